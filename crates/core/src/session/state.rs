/// Where a connection stands in its lifecycle. Both roles track the same
/// enum: the client for itself, the authority once per remote peer. Any
/// packet arriving outside the states its handler accepts closes the
/// connection. `Inactive` is terminal; reconnecting starts a fresh
/// machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Inactive,
    Joining,
    Authenticating,
    Encrypted,
    ContentCheck,
    Authorized,
    SnapshotWait,
    SnapshotTransfer,
    Active,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Inactive => "inactive",
            SessionState::Joining => "joining",
            SessionState::Authenticating => "authenticating",
            SessionState::Encrypted => "encrypted",
            SessionState::ContentCheck => "content check",
            SessionState::Authorized => "authorized",
            SessionState::SnapshotWait => "snapshot wait",
            SessionState::SnapshotTransfer => "snapshot transfer",
            SessionState::Active => "active",
        }
    }

    /// True once the handshake is behind us and the peer counts toward
    /// the session roster.
    pub fn is_joined(&self) -> bool {
        matches!(
            self,
            SessionState::Authorized
                | SessionState::SnapshotWait
                | SessionState::SnapshotTransfer
                | SessionState::Active
        )
    }

    /// States that receive the frame and command fan-out: live peers plus
    /// those still downloading the snapshot, which must collect commands
    /// stamped past the capture frame for their catch-up.
    pub fn in_fanout(&self) -> bool {
        matches!(self, SessionState::SnapshotTransfer | SessionState::Active)
    }
}
