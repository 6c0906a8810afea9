mod clock;
mod command;

pub use clock::FrameClock;
pub use command::{CommandPacket, CommandQueue, MAX_COMMAND_PAYLOAD};
