mod crypto;
mod framing;
mod packet;
mod types;

pub use crypto::{
    respond, AuthMethods, MasterSecret, ServerHandshake, SessionCipher, CHALLENGE_LEN,
    KEY_MATERIAL_LEN, MAC_LEN,
};
pub(crate) use crypto::random_bytes;
pub use framing::{read_frame, write_frame, Link};
pub(crate) use framing::{spawn_listener, spawn_reader, WireEvent};
pub use packet::{Packet, PacketError, Payload, DEFAULT_PORT, MAX_PACKET_SIZE, MAX_STRING_LEN};
pub use types::{
    ErrorCode, GameInfo, RelayTag, SessionTag, COMPANY_SPECTATOR, MAX_COMPANIES, PROTOCOL_VERSION,
};
