pub mod config;
pub mod game;
pub mod net;
pub mod relay;
pub mod session;
pub mod snapshot;
pub mod sync;

pub use config::{AuthorityConfig, PeerConfig};
pub use game::{DemoGame, ExecutedCommand, Game, ManifestEntry};
pub use net::{
    ErrorCode, GameInfo, Packet, PacketError, Payload, RelayTag, SessionTag, COMPANY_SPECTATOR,
    DEFAULT_PORT, MAX_COMPANIES, MAX_PACKET_SIZE, PROTOCOL_VERSION,
};
pub use relay::{RelayError, RendezvousClient};
pub use session::{
    query_info, Authority, AuthorityEvent, CloseReason, PeerEvent, PeerSession, SessionError,
    SessionState,
};
pub use snapshot::{SnapshotError, SnapshotReceiver, SnapshotSender, MAX_SNAPSHOT_SIZE};
pub use sync::{CommandPacket, CommandQueue, FrameClock, MAX_COMMAND_PAYLOAD};
