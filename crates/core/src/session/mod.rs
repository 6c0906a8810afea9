mod client;
mod peer;
mod server;
mod state;

use std::io;

use thiserror::Error;

use crate::net::{ErrorCode, PacketError};
use crate::snapshot::SnapshotError;

pub use client::{query_info, PeerEvent, PeerSession};
pub use peer::{CloseReason, Peer, PeerTable, AUTHORITY_ID};
pub use server::{Authority, AuthorityEvent};
pub use state::SessionState;

/// Packets dispatched per connection per tick. Keeps one peer's burst
/// from starving everyone else; the remainder stays queued for the next
/// tick.
pub const MAX_DISPATCH_PER_TICK: usize = 42;

/// A condition that ends the session (or stops one from starting).
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("refused by server: {}", .0.as_str())]
    Refused(ErrorCode),
    #[error("session is not active")]
    NotActive,
    #[error("timed out waiting for the server")]
    Timeout,
}
