use std::collections::VecDeque;

use crate::net::{Packet, PacketError, Payload, MAX_PACKET_SIZE};

/// Longest command payload accepted for submission. Leaves room inside
/// the packet budget for the fixed fields and the frame stamp added at
/// fan-out.
pub const MAX_COMMAND_PAYLOAD: usize = MAX_PACKET_SIZE - 64;

/// A simulation command in flight. The payload is opaque to this layer;
/// only the embedding game interprets it. `frame` is assigned by the
/// authority at distribution time and is zero until then. `my_cmd` never
/// crosses the wire: a receiver derives it from the callback byte, which
/// the authority echoes only to the originating peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPacket {
    pub company: u8,
    pub frame: u32,
    pub cmd: u32,
    pub payload: Vec<u8>,
    pub callback: u8,
    pub my_cmd: bool,
}

impl CommandPacket {
    pub fn new(company: u8, cmd: u32, payload: Vec<u8>, callback: u8) -> Self {
        Self {
            company,
            frame: 0,
            cmd,
            payload,
            callback,
            my_cmd: false,
        }
    }

    /// Encode for submission to the authority. No frame: the authority
    /// stamps one at distribution time.
    pub fn write_request(&self, pkt: &mut Packet) {
        pkt.put_u8(self.company);
        pkt.put_u32(self.cmd);
        pkt.put_blob(&self.payload);
        pkt.put_u8(self.callback);
    }

    pub fn read_request(payload: &mut Payload) -> Result<Self, PacketError> {
        let company = payload.read_u8()?;
        let cmd = payload.read_u32()?;
        let data = payload.read_blob()?;
        let callback = payload.read_u8()?;
        Ok(Self::new(company, cmd, data, callback))
    }

    /// Encode for fan-out, stamped with the execution frame. `callback`
    /// carries the caller-provided byte so the authority can zero it for
    /// every peer except the originator.
    pub fn write_stamped(&self, pkt: &mut Packet, callback: u8) {
        pkt.put_u8(self.company);
        pkt.put_u32(self.cmd);
        pkt.put_blob(&self.payload);
        pkt.put_u8(callback);
        pkt.put_u32(self.frame);
    }

    pub fn read_stamped(payload: &mut Payload) -> Result<Self, PacketError> {
        let company = payload.read_u8()?;
        let cmd = payload.read_u32()?;
        let data = payload.read_blob()?;
        let callback = payload.read_u8()?;
        let frame = payload.read_u32()?;
        let mut packet = Self::new(company, cmd, data, callback);
        packet.frame = frame;
        packet.my_cmd = callback != 0;
        Ok(packet)
    }
}

/// Per-connection queue of stamped commands awaiting their execution
/// frame. Receipt order is preserved within a frame; entries survive a
/// pause untouched and are popped only once due.
#[derive(Debug, Default)]
pub struct CommandQueue {
    commands: VecDeque<CommandPacket>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self {
            commands: VecDeque::with_capacity(16),
        }
    }

    pub fn push(&mut self, cmd: CommandPacket) {
        self.commands.push_back(cmd);
    }

    /// Pop the next command whose frame has been reached. Callers drain
    /// this once per executed frame, so commands sharing a frame come out
    /// in receipt order.
    pub fn pop_due(&mut self, frame: u32) -> Option<CommandPacket> {
        match self.commands.front() {
            Some(cmd) if cmd.frame <= frame => self.commands.pop_front(),
            _ => None,
        }
    }

    /// Frame of the oldest queued command, if any.
    pub fn next_frame(&self) -> Option<u32> {
        self.commands.front().map(|cmd| cmd.frame)
    }

    /// Queued commands in receipt order. The authority replays these to a
    /// peer starting a snapshot transfer, since the capture predates
    /// their execution.
    pub fn iter(&self) -> impl Iterator<Item = &CommandPacket> + '_ {
        self.commands.iter()
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::SessionTag;

    fn stamped(frame: u32, cmd: u32) -> CommandPacket {
        let mut packet = CommandPacket::new(1, cmd, vec![], 0);
        packet.frame = frame;
        packet
    }

    #[test]
    fn pop_due_holds_future_commands() {
        let mut queue = CommandQueue::new();
        queue.push(stamped(5, 1));
        queue.push(stamped(5, 2));
        queue.push(stamped(9, 3));

        assert!(queue.pop_due(4).is_none());

        let first = queue.pop_due(5).unwrap();
        let second = queue.pop_due(5).unwrap();
        assert_eq!(first.cmd, 1);
        assert_eq!(second.cmd, 2);
        assert!(queue.pop_due(5).is_none());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_frame(), Some(9));
    }

    #[test]
    fn pop_due_catches_up_past_frames() {
        let mut queue = CommandQueue::new();
        queue.push(stamped(3, 1));
        queue.push(stamped(7, 2));

        assert_eq!(queue.pop_due(10).unwrap().cmd, 1);
        assert_eq!(queue.pop_due(10).unwrap().cmd, 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn request_round_trip_has_no_frame() {
        let cmd = CommandPacket::new(3, 0x0204, vec![1, 2, 3], 7);
        let mut pkt = Packet::new(SessionTag::ClientCommand.to_u8());
        cmd.write_request(&mut pkt);

        let mut payload = Payload::new(pkt.freeze().slice(1..));
        let decoded = CommandPacket::read_request(&mut payload).unwrap();
        assert_eq!(decoded.company, 3);
        assert_eq!(decoded.cmd, 0x0204);
        assert_eq!(decoded.payload, vec![1, 2, 3]);
        assert_eq!(decoded.callback, 7);
        assert_eq!(decoded.frame, 0);
        assert!(!decoded.my_cmd);
        assert_eq!(payload.remaining(), 0);
    }

    #[test]
    fn stamped_round_trip_marks_originator() {
        let mut cmd = CommandPacket::new(0, 42, vec![0xaa; 16], 9);
        cmd.frame = 1000;

        let mut pkt = Packet::new(SessionTag::ServerCommand.to_u8());
        cmd.write_stamped(&mut pkt, cmd.callback);
        let mut payload = Payload::new(pkt.freeze().slice(1..));
        let mine = CommandPacket::read_stamped(&mut payload).unwrap();
        assert_eq!(mine.frame, 1000);
        assert!(mine.my_cmd);

        let mut pkt = Packet::new(SessionTag::ServerCommand.to_u8());
        cmd.write_stamped(&mut pkt, 0);
        let mut payload = Payload::new(pkt.freeze().slice(1..));
        let theirs = CommandPacket::read_stamped(&mut payload).unwrap();
        assert_eq!(theirs.frame, 1000);
        assert!(!theirs.my_cmd);
        assert_eq!(theirs.callback, 0);
    }

    #[test]
    fn max_payload_command_fits_a_packet_when_stamped() {
        let mut cmd =
            CommandPacket::new(u8::MAX, u32::MAX, vec![0xff; MAX_COMMAND_PAYLOAD], u8::MAX);
        cmd.frame = u32::MAX;

        let mut pkt = Packet::new(SessionTag::ServerCommand.to_u8());
        cmd.write_stamped(&mut pkt, cmd.callback);
        assert!(pkt.freeze().len() <= MAX_PACKET_SIZE);
    }

    #[test]
    fn truncated_request_fails() {
        let cmd = CommandPacket::new(1, 2, vec![3, 4], 0);
        let mut pkt = Packet::new(SessionTag::ClientCommand.to_u8());
        cmd.write_request(&mut pkt);
        let bytes = pkt.freeze();

        let mut payload = Payload::new(bytes.slice(1..bytes.len() - 1));
        assert!(CommandPacket::read_request(&mut payload).is_err());
    }
}
