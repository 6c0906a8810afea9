use super::packet::{Packet, PacketError, Payload};

/// Bumped whenever the versioned packet region changes shape.
pub const PROTOCOL_VERSION: u32 = 1;

/// Packet types of the session protocol.
///
/// Tags 0..=9 are exchanged before version negotiation completes and their
/// numeric values are frozen forever: an old peer must be able to decode a
/// rejection or a server descriptor from any future release. Everything from
/// [`SessionTag::ServerEnableEncryption`] up may be appended to freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionTag {
    ServerFull = 0,
    ServerBanned = 1,
    ClientJoin = 2,
    ServerError = 3,
    ClientGameInfo = 4,
    ServerGameInfo = 5,
    ServerNewGame = 6,
    ServerShutdown = 7,
    ServerAuthRequest = 8,
    ClientAuthResponse = 9,

    ServerEnableEncryption = 10,
    ClientIdentify = 11,
    ServerCheckManifest = 12,
    ClientManifestOk = 13,
    ServerWelcome = 14,
    ServerPeerInfo = 15,
    ServerJoined = 16,
    ClientGetSnapshot = 17,
    ServerSnapshotWait = 18,
    ServerSnapshotBegin = 19,
    ServerSnapshotSize = 20,
    ServerSnapshotData = 21,
    ServerSnapshotDone = 22,
    ClientSnapshotOk = 23,
    ServerFrame = 24,
    ClientAck = 25,
    ServerSync = 26,
    ClientCommand = 27,
    ServerCommand = 28,
    ClientChat = 29,
    ServerChat = 30,
    ClientQuit = 31,
    ServerQuit = 32,
    ClientError = 33,
}

impl SessionTag {
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    /// Unknown tags must be rejected by the caller; there is no catch-all.
    pub const fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::ServerFull,
            1 => Self::ServerBanned,
            2 => Self::ClientJoin,
            3 => Self::ServerError,
            4 => Self::ClientGameInfo,
            5 => Self::ServerGameInfo,
            6 => Self::ServerNewGame,
            7 => Self::ServerShutdown,
            8 => Self::ServerAuthRequest,
            9 => Self::ClientAuthResponse,
            10 => Self::ServerEnableEncryption,
            11 => Self::ClientIdentify,
            12 => Self::ServerCheckManifest,
            13 => Self::ClientManifestOk,
            14 => Self::ServerWelcome,
            15 => Self::ServerPeerInfo,
            16 => Self::ServerJoined,
            17 => Self::ClientGetSnapshot,
            18 => Self::ServerSnapshotWait,
            19 => Self::ServerSnapshotBegin,
            20 => Self::ServerSnapshotSize,
            21 => Self::ServerSnapshotData,
            22 => Self::ServerSnapshotDone,
            23 => Self::ClientSnapshotOk,
            24 => Self::ServerFrame,
            25 => Self::ClientAck,
            26 => Self::ServerSync,
            27 => Self::ClientCommand,
            28 => Self::ServerCommand,
            29 => Self::ClientChat,
            30 => Self::ServerChat,
            31 => Self::ClientQuit,
            32 => Self::ServerQuit,
            33 => Self::ClientError,
            _ => return None,
        })
    }
}

/// Packet types of the rendezvous protocol. Separate connection, separate tag
/// space; tag 0 is the coordinator's error report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayTag {
    Error = 0,
    Register = 1,
    RegisterAck = 2,
    Update = 3,
    Listing = 4,
    ListingEntry = 5,
    ListingDone = 6,
    ConnectRequest = 7,
    ConnectReply = 8,
    ConnectFailed = 9,
}

impl RelayTag {
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    pub const fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Error,
            1 => Self::Register,
            2 => Self::RegisterAck,
            3 => Self::Update,
            4 => Self::Listing,
            5 => Self::ListingEntry,
            6 => Self::ListingDone,
            7 => Self::ConnectRequest,
            8 => Self::ConnectReply,
            9 => Self::ConnectFailed,
            _ => return None,
        })
    }
}

/// Reason carried by `ServerError` / `ClientError` packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    General = 0,
    Desync = 1,
    SnapshotFailed = 2,
    ConnectionLost = 3,
    MalformedPacket = 4,
    WrongVersion = 5,
    AuthFailed = 6,
    NotExpected = 7,
    Full = 8,
    Banned = 9,
    ManifestMismatch = 10,
    Timeout = 11,
    Kicked = 12,
    Shutdown = 13,
    NewGame = 14,
}

impl ErrorCode {
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    /// Error packets are terminal either way, so an unknown code degrades to
    /// `General` instead of compounding the failure.
    pub const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Desync,
            2 => Self::SnapshotFailed,
            3 => Self::ConnectionLost,
            4 => Self::MalformedPacket,
            5 => Self::WrongVersion,
            6 => Self::AuthFailed,
            7 => Self::NotExpected,
            8 => Self::Full,
            9 => Self::Banned,
            10 => Self::ManifestMismatch,
            11 => Self::Timeout,
            12 => Self::Kicked,
            13 => Self::Shutdown,
            14 => Self::NewGame,
            _ => Self::General,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general error",
            Self::Desync => "simulation desync",
            Self::SnapshotFailed => "snapshot failed",
            Self::ConnectionLost => "connection lost",
            Self::MalformedPacket => "malformed packet",
            Self::WrongVersion => "protocol version mismatch",
            Self::AuthFailed => "authentication failed",
            Self::NotExpected => "packet not expected",
            Self::Full => "server full",
            Self::Banned => "banned",
            Self::ManifestMismatch => "content manifest mismatch",
            Self::Timeout => "timed out",
            Self::Kicked => "kicked",
            Self::Shutdown => "server shutting down",
            Self::NewGame => "server starting a new session",
        }
    }
}

/// Company slot a peer acts for. Spectators submit no commands.
pub const COMPANY_SPECTATOR: u8 = 255;
pub const MAX_COMPANIES: u8 = 15;

/// Server descriptor answered to `ClientGameInfo` queries and pushed to the
/// rendezvous service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameInfo {
    pub name: String,
    pub peers: u8,
    pub max_peers: u8,
    pub frame: u32,
    pub paused: bool,
}

impl GameInfo {
    pub fn write(&self, p: &mut Packet) {
        p.put_string(&self.name)
            .put_u8(self.peers)
            .put_u8(self.max_peers)
            .put_u32(self.frame)
            .put_bool(self.paused);
    }

    pub fn read(r: &mut Payload) -> Result<Self, PacketError> {
        Ok(Self {
            name: r.read_string()?,
            peers: r.read_u8()?,
            max_peers: r.read_u8()?,
            frame: r.read_u32()?,
            paused: r.read_bool()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_pre_join_tags_are_frozen() {
        // These values are wire compatibility; they must never change.
        assert_eq!(SessionTag::ServerFull.to_u8(), 0);
        assert_eq!(SessionTag::ServerBanned.to_u8(), 1);
        assert_eq!(SessionTag::ClientJoin.to_u8(), 2);
        assert_eq!(SessionTag::ServerError.to_u8(), 3);
        assert_eq!(SessionTag::ClientGameInfo.to_u8(), 4);
        assert_eq!(SessionTag::ServerGameInfo.to_u8(), 5);
        assert_eq!(SessionTag::ServerNewGame.to_u8(), 6);
        assert_eq!(SessionTag::ServerShutdown.to_u8(), 7);
        assert_eq!(SessionTag::ServerAuthRequest.to_u8(), 8);
        assert_eq!(SessionTag::ClientAuthResponse.to_u8(), 9);
    }

    #[test]
    fn test_tag_round_trip() {
        for v in 0u8..=33 {
            let tag = SessionTag::from_u8(v).unwrap();
            assert_eq!(tag.to_u8(), v);
        }
        assert!(SessionTag::from_u8(34).is_none());
        assert!(SessionTag::from_u8(255).is_none());
    }

    #[test]
    fn test_relay_tag_round_trip() {
        assert_eq!(RelayTag::Error.to_u8(), 0);
        for v in 0u8..=9 {
            assert_eq!(RelayTag::from_u8(v).unwrap().to_u8(), v);
        }
        assert!(RelayTag::from_u8(10).is_none());
    }

    #[test]
    fn test_unknown_error_code_degrades() {
        assert_eq!(ErrorCode::from_u8(200), ErrorCode::General);
        assert_eq!(ErrorCode::from_u8(1), ErrorCode::Desync);
    }

    #[test]
    fn test_game_info_round_trip() {
        let info = GameInfo {
            name: "test server".to_string(),
            peers: 3,
            max_peers: 16,
            frame: 123456,
            paused: true,
        };

        let mut p = Packet::new(SessionTag::ServerGameInfo.to_u8());
        info.write(&mut p);

        let bytes = p.freeze();
        let mut r = Payload::new(Bytes::copy_from_slice(&bytes[1..]));
        assert_eq!(GameInfo::read(&mut r).unwrap(), info);
    }

    #[test]
    fn test_game_info_truncated() {
        let info = GameInfo {
            name: "s".to_string(),
            peers: 0,
            max_peers: 8,
            frame: 9,
            paused: false,
        };
        let mut p = Packet::new(0);
        info.write(&mut p);
        let bytes = p.freeze();

        let mut r = Payload::new(Bytes::copy_from_slice(&bytes[1..bytes.len() - 2]));
        assert!(GameInfo::read(&mut r).is_err());
    }
}
