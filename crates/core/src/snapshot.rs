use std::collections::VecDeque;

use thiserror::Error;

use crate::net::{Packet, SessionTag, MAX_PACKET_SIZE};

/// Upper bound on a transferred snapshot blob.
pub const MAX_SNAPSHOT_SIZE: usize = 256 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot size {0} exceeds the {MAX_SNAPSHOT_SIZE} byte limit")]
    TooLarge(u32),
    #[error("snapshot data arrived before a size announcement")]
    NoTransfer,
    #[error("snapshot data overruns the announced size")]
    Overrun,
    #[error("snapshot ended at {got} of {want} bytes")]
    ShortData { got: usize, want: usize },
}

struct Transfer {
    peer: u32,
    data: Vec<u8>,
    offset: usize,
    done_sent: bool,
}

/// One burst of outbound snapshot packets for a single peer.
pub struct Emitted {
    pub peer: u32,
    pub packets: Vec<Packet>,
    pub done: bool,
}

/// Authority-side snapshot streaming. At most one transfer runs at a
/// time; later requesters queue up and are told their position. The
/// active slot is held until the receiver acknowledges the applied blob
/// (or departs), then the next waiter is served.
pub struct SnapshotSender {
    chunk: usize,
    active: Option<Transfer>,
    waiting: VecDeque<u32>,
}

impl SnapshotSender {
    pub fn new(chunk: usize) -> Self {
        Self {
            // Tag byte plus length prefix must still fit the frame.
            chunk: chunk.clamp(1, MAX_PACKET_SIZE - 3),
            active: None,
            waiting: VecDeque::new(),
        }
    }

    pub fn active_peer(&self) -> Option<u32> {
        self.active.as_ref().map(|t| t.peer)
    }

    /// Claim the transfer slot. `None` means the slot is free and the
    /// caller should capture and `begin` now; otherwise the peer has been
    /// queued and gets back its 1-based wait position.
    pub fn try_claim(&mut self, peer: u32) -> Option<u8> {
        if self.active.is_none() {
            return None;
        }
        if let Some(at) = self.waiting.iter().position(|p| *p == peer) {
            return Some(at as u8 + 1);
        }
        self.waiting.push_back(peer);
        Some(self.waiting.len() as u8)
    }

    /// Start streaming `data` to `peer`. Returns the begin and size
    /// announcements; data chunks follow through `emit`.
    pub fn begin(&mut self, peer: u32, frame: u32, data: Vec<u8>) -> [Packet; 2] {
        let mut begin = Packet::new(SessionTag::ServerSnapshotBegin.to_u8());
        begin.put_u32(frame);
        let mut size = Packet::new(SessionTag::ServerSnapshotSize.to_u8());
        size.put_u32(data.len() as u32);

        self.active = Some(Transfer {
            peer,
            data,
            offset: 0,
            done_sent: false,
        });
        [begin, size]
    }

    /// Produce up to `budget` data chunks for the active transfer, plus
    /// the done marker once the blob is exhausted. Returns `None` when
    /// there is nothing left to send (idle, or done already went out and
    /// we are waiting on the receiver's ack).
    pub fn emit(&mut self, budget: usize) -> Option<Emitted> {
        let transfer = self.active.as_mut()?;
        if transfer.done_sent {
            return None;
        }

        let mut packets = Vec::new();
        for _ in 0..budget {
            if transfer.offset >= transfer.data.len() {
                break;
            }
            let take = self.chunk.min(transfer.data.len() - transfer.offset);
            let mut pkt = Packet::new(SessionTag::ServerSnapshotData.to_u8());
            pkt.put_raw(&transfer.data[transfer.offset..transfer.offset + take]);
            packets.push(pkt);
            transfer.offset += take;
        }
        if transfer.offset >= transfer.data.len() {
            packets.push(Packet::new(SessionTag::ServerSnapshotDone.to_u8()));
            transfer.done_sent = true;
        }

        Some(Emitted {
            peer: transfer.peer,
            packets,
            done: transfer.done_sent,
        })
    }

    /// The active peer acknowledged the applied snapshot. Frees the slot;
    /// false if the ack came from the wrong peer or before done was sent.
    pub fn complete(&mut self, peer: u32) -> bool {
        match &self.active {
            Some(t) if t.peer == peer && t.done_sent => {
                self.active = None;
                true
            }
            _ => false,
        }
    }

    /// Drop a departing peer from the slot or the queue. Returns true if
    /// an in-progress stream was aborted, in which case the caller should
    /// serve the next waiter.
    pub fn forget(&mut self, peer: u32) -> bool {
        if self.active.as_ref().is_some_and(|t| t.peer == peer) {
            self.active = None;
            return true;
        }
        self.waiting.retain(|p| *p != peer);
        false
    }

    pub fn pop_waiter(&mut self) -> Option<u32> {
        self.waiting.pop_front()
    }

    /// Current 1-based wait positions, for re-announcement after the
    /// queue shifts.
    pub fn positions(&self) -> Vec<(u32, u8)> {
        self.waiting
            .iter()
            .enumerate()
            .map(|(at, peer)| (*peer, at as u8 + 1))
            .collect()
    }
}

/// Client-side reassembly with exact byte accounting. The caller applies
/// the finished blob before acknowledging anything to the authority.
#[derive(Debug, Default)]
pub struct SnapshotReceiver {
    frame: u32,
    expected: Option<usize>,
    data: Vec<u8>,
}

impl SnapshotReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame the snapshot was captured at.
    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn received(&self) -> usize {
        self.data.len()
    }

    pub fn start(&mut self, frame: u32) {
        self.frame = frame;
        self.expected = None;
        self.data.clear();
    }

    pub fn announce_size(&mut self, total: u32) -> Result<(), SnapshotError> {
        if total as usize > MAX_SNAPSHOT_SIZE {
            return Err(SnapshotError::TooLarge(total));
        }
        self.expected = Some(total as usize);
        self.data.reserve(total as usize);
        Ok(())
    }

    pub fn chunk(&mut self, bytes: &[u8]) -> Result<(), SnapshotError> {
        let expected = self.expected.ok_or(SnapshotError::NoTransfer)?;
        if self.data.len() + bytes.len() > expected {
            return Err(SnapshotError::Overrun);
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Close out the transfer, yielding the captured frame and the blob.
    /// Every announced byte must have arrived.
    pub fn finish(&mut self) -> Result<(u32, Vec<u8>), SnapshotError> {
        let want = self.expected.take().ok_or(SnapshotError::NoTransfer)?;
        if self.data.len() != want {
            return Err(SnapshotError::ShortData {
                got: self.data.len(),
                want,
            });
        }
        Ok((self.frame, std::mem::take(&mut self.data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Payload;

    fn unpack(pkt: Packet) -> (u8, Vec<u8>) {
        let bytes = pkt.freeze();
        (bytes[0], bytes[1..].to_vec())
    }

    #[test]
    fn sender_streams_every_byte_then_done() {
        let blob: Vec<u8> = (0..20000u32).map(|i| i as u8).collect();
        let mut sender = SnapshotSender::new(8192);

        assert!(sender.try_claim(1).is_none());
        let [begin, size] = sender.begin(1, 77, blob.clone());

        let (tag, body) = unpack(begin);
        assert_eq!(tag, SessionTag::ServerSnapshotBegin.to_u8());
        assert_eq!(Payload::new(body.into()).read_u32().unwrap(), 77);
        let (tag, body) = unpack(size);
        assert_eq!(tag, SessionTag::ServerSnapshotSize.to_u8());
        assert_eq!(Payload::new(body.into()).read_u32().unwrap(), 20000);

        let emitted = sender.emit(64).unwrap();
        assert_eq!(emitted.peer, 1);
        assert!(emitted.done);

        let mut rebuilt = Vec::new();
        let mut saw_done = false;
        for pkt in emitted.packets {
            let (tag, body) = unpack(pkt);
            if tag == SessionTag::ServerSnapshotData.to_u8() {
                assert!(!saw_done);
                assert!(body.len() <= 8192);
                rebuilt.extend_from_slice(&body);
            } else {
                assert_eq!(tag, SessionTag::ServerSnapshotDone.to_u8());
                saw_done = true;
            }
        }
        assert!(saw_done);
        assert_eq!(rebuilt, blob);

        assert!(sender.emit(64).is_none());
        assert!(sender.complete(1));
        assert!(sender.try_claim(2).is_none());
    }

    #[test]
    fn sender_paces_to_the_budget() {
        let mut sender = SnapshotSender::new(100);
        sender.begin(5, 0, vec![0; 250]);

        let first = sender.emit(1).unwrap();
        assert_eq!(first.packets.len(), 1);
        assert!(!first.done);
        let second = sender.emit(1).unwrap();
        assert!(!second.done);
        let last = sender.emit(2).unwrap();
        assert!(last.done);
        assert_eq!(last.packets.len(), 2);
    }

    #[test]
    fn later_requesters_queue_with_positions() {
        let mut sender = SnapshotSender::new(1024);
        assert!(sender.try_claim(1).is_none());
        sender.begin(1, 0, vec![1, 2, 3]);

        assert_eq!(sender.try_claim(2), Some(1));
        assert_eq!(sender.try_claim(3), Some(2));
        assert_eq!(sender.try_claim(2), Some(1));
        assert_eq!(sender.positions(), vec![(2, 1), (3, 2)]);

        sender.forget(2);
        assert_eq!(sender.positions(), vec![(3, 1)]);
        assert_eq!(sender.pop_waiter(), Some(3));
        assert_eq!(sender.pop_waiter(), None);
    }

    #[test]
    fn departing_active_peer_aborts_the_stream() {
        let mut sender = SnapshotSender::new(8);
        sender.begin(9, 0, vec![0; 64]);
        sender.try_claim(10);

        assert!(sender.forget(9));
        assert_eq!(sender.active_peer(), None);
        assert_eq!(sender.pop_waiter(), Some(10));
    }

    #[test]
    fn ack_is_refused_until_done_went_out() {
        let mut sender = SnapshotSender::new(8);
        sender.begin(4, 0, vec![0; 64]);
        assert!(!sender.complete(4));

        while !sender.emit(1).map(|e| e.done).unwrap_or(true) {}
        assert!(!sender.complete(5));
        assert!(sender.complete(4));
    }

    #[test]
    fn empty_snapshot_is_just_done() {
        let mut sender = SnapshotSender::new(8);
        sender.begin(2, 0, Vec::new());
        let emitted = sender.emit(4).unwrap();
        assert!(emitted.done);
        assert_eq!(emitted.packets.len(), 1);
    }

    #[test]
    fn receiver_accounts_for_every_byte() {
        let mut receiver = SnapshotReceiver::new();
        receiver.start(42);
        receiver.announce_size(10).unwrap();
        receiver.chunk(&[1, 2, 3, 4, 5, 6]).unwrap();
        receiver.chunk(&[7, 8, 9, 10]).unwrap();

        let (frame, blob) = receiver.finish().unwrap();
        assert_eq!(frame, 42);
        assert_eq!(blob, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn receiver_rejects_overrun_and_short_data() {
        let mut receiver = SnapshotReceiver::new();
        receiver.start(0);
        receiver.announce_size(4).unwrap();
        assert!(matches!(
            receiver.chunk(&[0; 5]),
            Err(SnapshotError::Overrun)
        ));

        let mut receiver = SnapshotReceiver::new();
        receiver.start(0);
        receiver.announce_size(4).unwrap();
        receiver.chunk(&[0; 3]).unwrap();
        assert!(matches!(
            receiver.finish(),
            Err(SnapshotError::ShortData { got: 3, want: 4 })
        ));
    }

    #[test]
    fn receiver_requires_a_size_first() {
        let mut receiver = SnapshotReceiver::new();
        receiver.start(0);
        assert!(matches!(
            receiver.chunk(&[1]),
            Err(SnapshotError::NoTransfer)
        ));
    }

    #[test]
    fn receiver_rejects_oversized_announcements() {
        let mut receiver = SnapshotReceiver::new();
        receiver.start(0);
        assert!(matches!(
            receiver.announce_size(u32::MAX),
            Err(SnapshotError::TooLarge(_))
        ));
    }
}
