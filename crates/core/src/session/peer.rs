use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

use crate::net::{ErrorCode, Link, ServerHandshake};
use crate::session::SessionState;

/// The authority's own peer id. Remote peers are numbered from 2, so id 1
/// can originate chat and commands like any other participant.
pub const AUTHORITY_ID: u32 = 1;

/// Why a connection went away. `Quit` is the peer's own announcement;
/// everything else carries the protocol error that ended it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Quit,
    Error(ErrorCode),
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Quit => "quit",
            CloseReason::Error(code) => code.as_str(),
        }
    }
}

/// Authority-side bookkeeping for one remote peer. Raw frames pile up in
/// `incoming` until the session loop dispatches them; teardown is two
/// phase via `pending_close` so nothing disappears while the loop is
/// iterating.
pub struct Peer {
    pub id: u32,
    pub addr: SocketAddr,
    pub link: Link,
    pub state: SessionState,
    pub name: String,
    pub company: u8,
    pub handshake: Option<ServerHandshake>,
    pub last_ack: u32,
    pub ceiling: u32,
    pub token: u8,
    pub token_frame: u32,
    pub incoming: VecDeque<Vec<u8>>,
    // Reader thread saw EOF; the close waits until `incoming` drains so
    // a final quit or error packet still gets handled.
    pub eof: bool,
    pub last_packet: Instant,
    pub last_live: Instant,
    pub pending_close: Option<CloseReason>,
}

impl Peer {
    pub fn new(id: u32, addr: SocketAddr, link: Link) -> Self {
        Self {
            id,
            addr,
            link,
            state: SessionState::Joining,
            name: String::new(),
            company: crate::net::COMPANY_SPECTATOR,
            handshake: None,
            last_ack: 0,
            ceiling: 0,
            token: 0,
            token_frame: 0,
            incoming: VecDeque::new(),
            eof: false,
            last_packet: Instant::now(),
            last_live: Instant::now(),
            pending_close: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_packet = Instant::now();
    }

    /// Mark for removal at the next safe point. The first reason sticks.
    pub fn close(&mut self, reason: CloseReason) {
        if self.pending_close.is_none() {
            self.pending_close = Some(reason);
        }
    }

    pub fn is_closing(&self) -> bool {
        self.pending_close.is_some()
    }
}

pub struct PeerTable {
    peers: HashMap<u32, Peer>,
    next_id: u32,
    max_peers: usize,
}

impl PeerTable {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: HashMap::new(),
            next_id: AUTHORITY_ID + 1,
            max_peers,
        }
    }

    pub fn is_full(&self) -> bool {
        self.peers.len() >= self.max_peers
    }

    pub fn admit(&mut self, addr: SocketAddr, link: Link) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.peers.insert(id, Peer::new(id, addr, link));
        id
    }

    pub fn get(&self, id: u32) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Peer> {
        self.peers.get_mut(&id)
    }

    /// Stable iteration order, so dispatch and fan-out are deterministic
    /// from the outside.
    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.peers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.values_mut()
    }

    /// Remove every peer marked for close, shutting their sockets down so
    /// the reader threads unblock. Only called between ticks.
    pub fn reap_closed(&mut self) -> Vec<Peer> {
        let closing: Vec<u32> = self
            .peers
            .iter()
            .filter(|(_, p)| p.is_closing())
            .map(|(&id, _)| id)
            .collect();

        let mut reaped = Vec::with_capacity(closing.len());
        for id in closing {
            if let Some(peer) = self.peers.remove(&id) {
                peer.link.shutdown();
                reaped.push(peer);
            }
        }
        reaped.sort_unstable_by_key(|p| p.id);
        reaped
    }

    pub fn active_count(&self) -> usize {
        self.peers
            .values()
            .filter(|p| p.state == SessionState::Active)
            .count()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
