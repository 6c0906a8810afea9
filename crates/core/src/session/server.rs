use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::AuthorityConfig;
use crate::game::Game;
use crate::net::{
    random_bytes, spawn_listener, spawn_reader, AuthMethods, ErrorCode, GameInfo, Link, Packet,
    PacketError, Payload, ServerHandshake, SessionTag, WireEvent, CHALLENGE_LEN,
    COMPANY_SPECTATOR, KEY_MATERIAL_LEN, MAC_LEN, MAX_COMPANIES, PROTOCOL_VERSION,
};
use crate::relay::RendezvousClient;
use crate::snapshot::SnapshotSender;
use crate::sync::{CommandPacket, CommandQueue, FrameClock, MAX_COMMAND_PAYLOAD};

use super::peer::{CloseReason, PeerTable, AUTHORITY_ID};
use super::state::SessionState;
use super::MAX_DISPATCH_PER_TICK;

/// Snapshot data chunks pushed per tick, so a transfer shares the tick
/// with frame traffic instead of monopolizing it.
const SNAPSHOT_BURST: usize = 16;

const RELAY_REFRESH: Duration = Duration::from_secs(30);

/// Observable happenings, drained by the embedder (the server binary
/// turns them into log lines).
#[derive(Debug, Clone)]
pub enum AuthorityEvent {
    PeerConnecting { addr: SocketAddr },
    PeerJoined { peer_id: u32, name: String },
    PeerLeft { peer_id: u32, reason: CloseReason },
    Denied { addr: SocketAddr, code: ErrorCode },
    Desync { peer_id: u32 },
    Chat { peer_id: u32, message: String },
}

/// The hosting side of a session: owns the canonical frame counter, the
/// peer table and the single snapshot stream. All protocol state is
/// confined to the thread calling [`Authority::pump`] and
/// [`Authority::step`]; listener and reader threads only move bytes.
pub struct Authority<G: Game> {
    config: AuthorityConfig,
    game: G,
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    tx: Sender<WireEvent>,
    rx: Receiver<WireEvent>,
    peers: PeerTable,
    clock: FrameClock,
    snapshots: SnapshotSender,
    own_queue: CommandQueue,
    pending_events: VecDeque<AuthorityEvent>,
    relay: Option<RendezvousClient>,
    relay_refreshed: Instant,
    frame_duration: Duration,
    last_tick: Instant,
    accumulator: Duration,
}

impl<G: Game> Authority<G> {
    pub fn new(bind_addr: &str, config: AuthorityConfig, game: G) -> io::Result<Self> {
        let listener = TcpListener::bind(bind_addr)?;
        let local_addr = listener.local_addr()?;
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel();
        spawn_listener(listener, Arc::clone(&running), tx.clone());

        let mut authority = Self {
            local_addr,
            running,
            tx,
            rx,
            peers: PeerTable::new(config.max_peers),
            clock: FrameClock::new(),
            snapshots: SnapshotSender::new(config.snapshot_chunk),
            own_queue: CommandQueue::new(),
            pending_events: VecDeque::new(),
            relay: None,
            relay_refreshed: Instant::now(),
            frame_duration: Duration::from_secs_f64(1.0 / config.frame_rate.max(1) as f64),
            last_tick: Instant::now(),
            accumulator: Duration::ZERO,
            game,
            config,
        };
        authority.connect_relay();
        info!("listening on {}", authority.local_addr);
        Ok(authority)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn frame(&self) -> u32 {
        self.clock.frame()
    }

    pub fn paused(&self) -> bool {
        self.clock.paused()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.active_count()
    }

    pub fn game(&self) -> &G {
        &self.game
    }

    pub fn game_mut(&mut self) -> &mut G {
        &mut self.game
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = AuthorityEvent> + '_ {
        self.pending_events.drain(..)
    }

    /// Drive the session at the configured frame rate until the running
    /// flag drops, then notify peers and tear down.
    pub fn run(&mut self) {
        while self.running.load(Ordering::SeqCst) {
            self.tick_once();
            thread::sleep(Duration::from_millis(1));
        }
        self.shutdown();
    }

    /// One pass of the fixed-rate loop: pump I/O, then execute however
    /// many frames wall time owes us. Embedders with their own loop call
    /// this instead of [`Authority::run`].
    pub fn tick_once(&mut self) {
        let now = Instant::now();
        self.accumulator += now - self.last_tick;
        self.last_tick = now;

        self.pump();
        while self.accumulator >= self.frame_duration {
            self.accumulator -= self.frame_duration;
            self.step();
        }
    }

    /// Move accepted sockets and received frames from the I/O threads
    /// into per-peer queues. Never blocks.
    pub fn pump(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            match event {
                WireEvent::Accepted(stream, addr) => self.accept(stream, addr),
                WireEvent::Frame(id, raw) => {
                    if let Some(peer) = self.peers.get_mut(id) {
                        if !peer.is_closing() {
                            peer.incoming.push_back(raw);
                        }
                    }
                }
                WireEvent::Closed(id) => {
                    if let Some(peer) = self.peers.get_mut(id) {
                        peer.eof = true;
                    }
                }
            }
        }
    }

    /// One simulation tick: reap departed peers, dispatch bounded input,
    /// advance the frame and execute due commands, then flush snapshot
    /// chunks and frame announcements.
    pub fn step(&mut self) {
        self.reap();
        self.check_timeouts();
        self.dispatch_all();

        if !self.clock.paused() {
            let frame = self.clock.advance();
            self.game.advance_frame();
            while let Some(cmd) = self.own_queue.pop_due(frame) {
                self.game.execute_command(cmd.company, cmd.cmd, &cmd.payload);
            }
            if self.config.sync_interval > 0 && frame % self.config.sync_interval == 0 {
                self.broadcast_sync(frame);
            }
        }

        self.stream_snapshot();
        self.announce_frames();
        self.refresh_relay();
    }

    /// Submit a command on the authority's own behalf. Takes the same
    /// stamping and fan-out path as commands arriving over the wire.
    /// Returns false without distributing if the payload is over the
    /// command budget.
    pub fn submit_command(
        &mut self,
        company: u8,
        cmd: u32,
        payload: Vec<u8>,
        callback: u8,
    ) -> bool {
        if payload.len() > MAX_COMMAND_PAYLOAD {
            warn!("own command {:#x} rejected: payload {} bytes", cmd, payload.len());
            return false;
        }
        let packet = CommandPacket::new(company, cmd, payload, callback);
        self.distribute(AUTHORITY_ID, packet);
        true
    }

    pub fn submit_chat(&mut self, message: &str) {
        self.broadcast_chat(AUTHORITY_ID, message);
    }

    /// Freeze the frame counter. Refused (returning false) while commands
    /// stamped during an earlier pause still await execution.
    pub fn pause(&mut self) -> bool {
        if self.clock.pause() {
            info!("paused at frame {}", self.clock.frame());
            true
        } else {
            info!("pause deferred until stamped commands execute");
            false
        }
    }

    pub fn unpause(&mut self) {
        self.clock.unpause();
        info!("resumed at frame {}", self.clock.frame());
    }

    pub fn kick(&mut self, peer_id: u32) {
        self.drop_peer(peer_id, ErrorCode::Kicked);
    }

    /// Announce a fresh session: every peer is dropped and must rejoin
    /// through a new state machine.
    pub fn announce_new_game(&mut self) {
        for id in self.peers.ids() {
            self.send_to(id, Packet::new(SessionTag::ServerNewGame.to_u8()));
            if let Some(peer) = self.peers.get_mut(id) {
                peer.close(CloseReason::Error(ErrorCode::NewGame));
            }
        }
    }

    pub fn shutdown(&mut self) {
        info!("shutting down");
        for id in self.peers.ids() {
            self.send_to(id, Packet::new(SessionTag::ServerShutdown.to_u8()));
            if let Some(peer) = self.peers.get_mut(id) {
                peer.close(CloseReason::Error(ErrorCode::Shutdown));
            }
        }
        self.reap();
        self.running.store(false, Ordering::SeqCst);
    }

    fn game_info(&self) -> GameInfo {
        GameInfo {
            name: self.config.server_name.clone(),
            peers: self.peers.active_count() as u8,
            max_peers: self.config.max_peers as u8,
            frame: self.clock.frame(),
            paused: self.clock.paused(),
        }
    }

    fn accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        if self.config.ban_list.contains(&addr.ip()) {
            let mut link = Link::new(stream);
            let _ = link.send(Packet::new(SessionTag::ServerBanned.to_u8()));
            link.shutdown();
            debug!("refused banned address {}", addr);
            self.pending_events.push_back(AuthorityEvent::Denied {
                addr,
                code: ErrorCode::Banned,
            });
            return;
        }
        if self.peers.is_full() {
            let mut link = Link::new(stream);
            let _ = link.send(Packet::new(SessionTag::ServerFull.to_u8()));
            link.shutdown();
            debug!("refused {}: server full", addr);
            self.pending_events.push_back(AuthorityEvent::Denied {
                addr,
                code: ErrorCode::Full,
            });
            return;
        }

        let reader = match stream.try_clone() {
            Ok(clone) => clone,
            Err(e) => {
                warn!("{}: could not clone stream: {}", addr, e);
                return;
            }
        };
        let id = self.peers.admit(addr, Link::new(stream));
        spawn_reader(id, reader, self.tx.clone());
        debug!("accepted {} as peer {}", addr, id);
        self.pending_events
            .push_back(AuthorityEvent::PeerConnecting { addr });
    }

    /// Deferred teardown, between ticks only: other code iterates the
    /// peer set and must never see an entry vanish mid-scan.
    fn reap(&mut self) {
        let reaped = self.peers.reap_closed();
        if reaped.is_empty() {
            return;
        }

        let mut stream_aborted = false;
        for peer in reaped {
            if self.snapshots.forget(peer.id) {
                stream_aborted = true;
            }
            let reason = peer
                .pending_close
                .unwrap_or(CloseReason::Error(ErrorCode::General));
            debug!("reaped peer {}: {}", peer.id, reason.as_str());
            if peer.state.is_joined() {
                self.broadcast_quit(peer.id);
            }
            self.pending_events.push_back(AuthorityEvent::PeerLeft {
                peer_id: peer.id,
                reason,
            });
        }

        if stream_aborted {
            self.start_next_transfer();
        } else {
            self.refresh_wait_positions();
        }
    }

    fn check_timeouts(&mut self) {
        let handshake = self.config.handshake_timeout;
        let lag = self.config.lag_timeout;
        let paused = self.clock.paused();

        let mut timed_out = Vec::new();
        for peer in self.peers.iter() {
            if peer.is_closing() {
                continue;
            }
            let idle = match peer.state {
                // No frames execute while paused, so no acks arrive;
                // a dead socket still surfaces through the reader.
                SessionState::Active if paused => continue,
                SessionState::Active => peer.last_live.elapsed(),
                // These two wait on us: the queue position or the stream.
                SessionState::SnapshotWait | SessionState::SnapshotTransfer => continue,
                _ => peer.last_packet.elapsed(),
            };
            let limit = if peer.state.is_joined() { lag } else { handshake };
            if idle > limit {
                warn!("peer {} timed out ({})", peer.id, peer.state.as_str());
                timed_out.push(peer.id);
            }
        }
        for id in timed_out {
            self.drop_peer(id, ErrorCode::Timeout);
        }
    }

    fn dispatch_all(&mut self) {
        for id in self.peers.ids() {
            for _ in 0..MAX_DISPATCH_PER_TICK {
                let raw = match self.peers.get_mut(id) {
                    Some(peer) if !peer.is_closing() => match peer.incoming.pop_front() {
                        Some(raw) => {
                            peer.touch();
                            raw
                        }
                        None => break,
                    },
                    _ => break,
                };
                let opened = match self.peers.get_mut(id) {
                    Some(peer) => peer.link.open(raw),
                    None => break,
                };
                match opened {
                    Ok((tag, payload)) => self.dispatch(id, tag, payload),
                    Err(e) => {
                        debug!("peer {}: undecodable frame: {}", id, e);
                        self.drop_peer(id, ErrorCode::MalformedPacket);
                    }
                }
            }
            if let Some(peer) = self.peers.get_mut(id) {
                if peer.eof && peer.incoming.is_empty() && !peer.is_closing() {
                    peer.close(CloseReason::Error(ErrorCode::ConnectionLost));
                }
            }
        }
    }

    fn dispatch(&mut self, id: u32, tag: u8, payload: Payload) {
        let result = match SessionTag::from_u8(tag) {
            Some(SessionTag::ClientJoin) => self.handle_join(id, payload),
            Some(SessionTag::ClientGameInfo) => self.handle_game_info(id),
            Some(SessionTag::ClientAuthResponse) => self.handle_auth_response(id, payload),
            Some(SessionTag::ClientIdentify) => self.handle_identify(id, payload),
            Some(SessionTag::ClientManifestOk) => self.handle_manifest_ok(id),
            Some(SessionTag::ClientGetSnapshot) => self.handle_get_snapshot(id),
            Some(SessionTag::ClientSnapshotOk) => self.handle_snapshot_ok(id),
            Some(SessionTag::ClientAck) => self.handle_ack(id, payload),
            Some(SessionTag::ClientCommand) => self.handle_command(id, payload),
            Some(SessionTag::ClientChat) => self.handle_chat(id, payload),
            Some(SessionTag::ClientQuit) => {
                self.handle_quit(id);
                Ok(())
            }
            Some(SessionTag::ClientError) => self.handle_client_error(id, payload),
            Some(other) => {
                debug!("peer {} sent server-only tag {:?}", id, other);
                self.drop_peer(id, ErrorCode::NotExpected);
                Ok(())
            }
            None => {
                debug!("peer {} sent unknown tag {}", id, tag);
                self.drop_peer(id, ErrorCode::MalformedPacket);
                Ok(())
            }
        };
        if let Err(e) = result {
            debug!("peer {}: {}", id, e);
            self.drop_peer(id, ErrorCode::MalformedPacket);
        }
    }

    fn peer_state(&self, id: u32) -> Option<SessionState> {
        self.peers.get(id).map(|p| p.state)
    }

    fn handle_join(&mut self, id: u32, mut payload: Payload) -> Result<(), PacketError> {
        match self.peer_state(id) {
            Some(SessionState::Joining) => {}
            Some(_) => {
                self.drop_peer(id, ErrorCode::NotExpected);
                return Ok(());
            }
            None => return Ok(()),
        }
        let version = payload.read_u32()?;
        let revision = payload.read_string()?;

        if version != PROTOCOL_VERSION {
            info!(
                "peer {} speaks protocol {}, ours is {}",
                id, version, PROTOCOL_VERSION
            );
            self.drop_peer(id, ErrorCode::WrongVersion);
            return Ok(());
        }
        debug!("peer {} joining, revision {:?}", id, revision);

        let methods = if self.config.join_key.is_some() {
            AuthMethods::JOIN_KEY
        } else {
            AuthMethods::KEY_EXCHANGE
        };
        let handshake = ServerHandshake::begin(methods);
        let mut pkt = Packet::new(SessionTag::ServerAuthRequest.to_u8());
        pkt.put_u8(methods.bits());
        pkt.put_raw(&handshake.key_material);
        pkt.put_raw(&handshake.challenge);

        if let Some(peer) = self.peers.get_mut(id) {
            peer.handshake = Some(handshake);
            peer.state = SessionState::Authenticating;
        }
        self.send_to(id, pkt);
        Ok(())
    }

    fn handle_game_info(&mut self, id: u32) -> Result<(), PacketError> {
        match self.peer_state(id) {
            Some(SessionState::Joining) => {}
            Some(_) => {
                self.drop_peer(id, ErrorCode::NotExpected);
                return Ok(());
            }
            None => return Ok(()),
        }
        let mut pkt = Packet::new(SessionTag::ServerGameInfo.to_u8());
        self.game_info().write(&mut pkt);
        self.send_to(id, pkt);
        Ok(())
    }

    fn handle_auth_response(&mut self, id: u32, mut payload: Payload) -> Result<(), PacketError> {
        match self.peer_state(id) {
            Some(SessionState::Authenticating) => {}
            Some(_) => {
                self.drop_peer(id, ErrorCode::NotExpected);
                return Ok(());
            }
            None => return Ok(()),
        }
        let material: [u8; KEY_MATERIAL_LEN] = payload.read_array()?;
        let mac: [u8; MAC_LEN] = payload.read_array()?;

        let join_key = self.config.join_key.clone().unwrap_or_default();
        let handshake = match self.peers.get_mut(id).and_then(|p| p.handshake.take()) {
            Some(handshake) => handshake,
            None => {
                self.drop_peer(id, ErrorCode::NotExpected);
                return Ok(());
            }
        };
        let Some(secret) = handshake.verify(&join_key, &material, &mac) else {
            info!("peer {} failed authentication", id);
            self.drop_peer(id, ErrorCode::AuthFailed);
            return Ok(());
        };

        let channel_nonce: [u8; CHALLENGE_LEN] = random_bytes();
        let mut pkt = Packet::new(SessionTag::ServerEnableEncryption.to_u8());
        pkt.put_raw(&channel_nonce);
        // The enable packet itself is the last plaintext on this link.
        self.send_to(id, pkt);

        let (c2s, s2c) = secret.traffic(&channel_nonce);
        if let Some(peer) = self.peers.get_mut(id) {
            peer.link.encrypt_send(s2c);
            peer.link.encrypt_recv(c2s);
            peer.state = SessionState::Encrypted;
        }
        debug!("peer {} authenticated, channel encrypted", id);
        Ok(())
    }

    fn handle_identify(&mut self, id: u32, mut payload: Payload) -> Result<(), PacketError> {
        match self.peer_state(id) {
            Some(SessionState::Encrypted) => {}
            Some(_) => {
                self.drop_peer(id, ErrorCode::NotExpected);
                return Ok(());
            }
            None => return Ok(()),
        }
        let name = payload.read_string()?;
        let company = payload.read_u8()?;

        if name.is_empty() || (company != COMPANY_SPECTATOR && company >= MAX_COMPANIES) {
            self.drop_peer(id, ErrorCode::General);
            return Ok(());
        }
        info!("peer {} identified as {:?}, company {}", id, name, company);
        if let Some(peer) = self.peers.get_mut(id) {
            peer.name = name;
            peer.company = company;
            peer.state = SessionState::ContentCheck;
        }

        let manifest = self.game.content_manifest();
        let count = manifest.len().min(u8::MAX as usize);
        let mut pkt = Packet::new(SessionTag::ServerCheckManifest.to_u8());
        pkt.put_u8(count as u8);
        for entry in manifest.iter().take(count) {
            entry.write(&mut pkt);
        }
        self.send_to(id, pkt);
        Ok(())
    }

    fn handle_manifest_ok(&mut self, id: u32) -> Result<(), PacketError> {
        match self.peer_state(id) {
            Some(SessionState::ContentCheck) => {}
            Some(_) => {
                self.drop_peer(id, ErrorCode::NotExpected);
                return Ok(());
            }
            None => return Ok(()),
        }
        if let Some(peer) = self.peers.get_mut(id) {
            peer.state = SessionState::Authorized;
        }

        let mut pkt = Packet::new(SessionTag::ServerWelcome.to_u8());
        pkt.put_u32(id);
        pkt.put_string(&self.config.server_name);
        self.send_to(id, pkt);

        // The newcomer gets the current roster; everyone else learns of
        // them once the snapshot is applied.
        let roster: Vec<(u32, String, u8)> = self
            .peers
            .iter()
            .filter(|p| p.id != id && p.state.is_joined() && !p.name.is_empty())
            .map(|p| (p.id, p.name.clone(), p.company))
            .collect();
        for (peer_id, name, company) in roster {
            let mut pkt = Packet::new(SessionTag::ServerPeerInfo.to_u8());
            pkt.put_u32(peer_id);
            pkt.put_string(&name);
            pkt.put_u8(company);
            self.send_to(id, pkt);
        }
        Ok(())
    }

    fn handle_get_snapshot(&mut self, id: u32) -> Result<(), PacketError> {
        match self.peer_state(id) {
            Some(SessionState::Authorized) => {}
            Some(_) => {
                self.drop_peer(id, ErrorCode::NotExpected);
                return Ok(());
            }
            None => return Ok(()),
        }
        match self.snapshots.try_claim(id) {
            None => self.start_transfer(id),
            Some(position) => {
                info!("peer {} waiting for snapshot at position {}", id, position);
                if let Some(peer) = self.peers.get_mut(id) {
                    peer.state = SessionState::SnapshotWait;
                }
                let mut pkt = Packet::new(SessionTag::ServerSnapshotWait.to_u8());
                pkt.put_u8(position);
                self.send_to(id, pkt);
            }
        }
        Ok(())
    }

    fn handle_snapshot_ok(&mut self, id: u32) -> Result<(), PacketError> {
        match self.peer_state(id) {
            Some(SessionState::SnapshotTransfer) => {}
            Some(_) => {
                self.drop_peer(id, ErrorCode::NotExpected);
                return Ok(());
            }
            None => return Ok(()),
        }
        if !self.snapshots.complete(id) {
            self.drop_peer(id, ErrorCode::NotExpected);
            return Ok(());
        }

        let frame = self.clock.frame();
        let ceiling = frame + self.config.frame_lead;
        let mut name = String::new();
        let mut company = COMPANY_SPECTATOR;
        if let Some(peer) = self.peers.get_mut(id) {
            peer.state = SessionState::Active;
            peer.ceiling = ceiling;
            peer.token_frame = frame;
            peer.last_live = Instant::now();
            name = peer.name.clone();
            company = peer.company;
        }
        debug!("peer {} ({}) is live at frame {}", id, name, frame);

        // Fresh grant so the catch-up from the capture frame is allowed
        // before the first ack lands.
        let mut pkt = Packet::new(SessionTag::ServerFrame.to_u8());
        pkt.put_u32(frame);
        pkt.put_u32(ceiling);
        self.send_to(id, pkt);

        self.broadcast_joined(id, &name, company);
        self.pending_events.push_back(AuthorityEvent::PeerJoined {
            peer_id: id,
            name,
        });
        self.start_next_transfer();
        Ok(())
    }

    fn handle_ack(&mut self, id: u32, mut payload: Payload) -> Result<(), PacketError> {
        match self.peer_state(id) {
            Some(SessionState::Active) => {}
            Some(_) => {
                self.drop_peer(id, ErrorCode::NotExpected);
                return Ok(());
            }
            None => return Ok(()),
        }
        let frame = payload.read_u32()?;
        let token = payload.read_u8()?;

        let granted = self.peers.get(id).map(|p| p.ceiling).unwrap_or(0);
        if frame > granted {
            debug!("peer {} acked frame {} beyond its ceiling {}", id, frame, granted);
            self.drop_peer(id, ErrorCode::MalformedPacket);
            return Ok(());
        }
        if let Some(peer) = self.peers.get_mut(id) {
            peer.last_ack = peer.last_ack.max(frame);
            if token == peer.token {
                peer.last_live = Instant::now();
            }
        }
        Ok(())
    }

    fn handle_command(&mut self, id: u32, mut payload: Payload) -> Result<(), PacketError> {
        match self.peer_state(id) {
            Some(SessionState::Active) => {}
            Some(_) => {
                self.drop_peer(id, ErrorCode::NotExpected);
                return Ok(());
            }
            None => return Ok(()),
        }
        let cmd = CommandPacket::read_request(&mut payload)?;
        // The stamped fan-out form is larger than the request form.
        if cmd.payload.len() > MAX_COMMAND_PAYLOAD {
            debug!("peer {} submitted a {} byte command payload", id, cmd.payload.len());
            self.drop_peer(id, ErrorCode::MalformedPacket);
            return Ok(());
        }
        let company = self.peers.get(id).map(|p| p.company).unwrap_or(COMPANY_SPECTATOR);
        if company == COMPANY_SPECTATOR || cmd.company != company {
            info!(
                "peer {} submitted a command for company {} it does not control",
                id, cmd.company
            );
            self.drop_peer(id, ErrorCode::Kicked);
            return Ok(());
        }
        self.distribute(id, cmd);
        Ok(())
    }

    fn handle_chat(&mut self, id: u32, mut payload: Payload) -> Result<(), PacketError> {
        match self.peer_state(id) {
            Some(SessionState::Active) => {}
            Some(_) => {
                self.drop_peer(id, ErrorCode::NotExpected);
                return Ok(());
            }
            None => return Ok(()),
        }
        let message = payload.read_string()?;

        self.pending_events.push_back(AuthorityEvent::Chat {
            peer_id: id,
            message: message.clone(),
        });
        self.broadcast_chat(id, &message);
        Ok(())
    }

    fn handle_quit(&mut self, id: u32) {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.close(CloseReason::Quit);
        }
    }

    fn handle_client_error(&mut self, id: u32, mut payload: Payload) -> Result<(), PacketError> {
        let code = ErrorCode::from_u8(payload.read_u8()?);
        warn!("peer {} reported: {}", id, code.as_str());
        if code == ErrorCode::Desync {
            self.pending_events
                .push_back(AuthorityEvent::Desync { peer_id: id });
        }
        if let Some(peer) = self.peers.get_mut(id) {
            peer.close(CloseReason::Error(code));
        }
        Ok(())
    }

    /// Stamp a command for a future frame and fan it out, including to
    /// our own execution queue. During a pause the stamp pins the
    /// earliest frame at which pausing is allowed again.
    fn distribute(&mut self, origin: u32, mut cmd: CommandPacket) {
        let stamp = self.clock.frame() + self.config.frame_lead + 1;
        cmd.frame = stamp;
        if self.clock.paused() {
            self.clock.defer_pause_until(stamp);
        }
        debug!(
            "command {:#x} from peer {} stamped for frame {}",
            cmd.cmd, origin, stamp
        );

        for id in self.peers.ids() {
            let wants = self
                .peers
                .get(id)
                .map(|p| !p.is_closing() && p.state.in_fanout())
                .unwrap_or(false);
            if !wants {
                continue;
            }
            let callback = if id == origin { cmd.callback } else { 0 };
            let mut pkt = Packet::new(SessionTag::ServerCommand.to_u8());
            cmd.write_stamped(&mut pkt, callback);
            self.send_to(id, pkt);
        }
        self.own_queue.push(cmd);
    }

    fn broadcast_sync(&mut self, frame: u32) {
        let seeds = self.game.sync_seeds();
        for id in self.peers.ids() {
            let wants = self
                .peers
                .get(id)
                .map(|p| !p.is_closing() && p.state.in_fanout())
                .unwrap_or(false);
            if !wants {
                continue;
            }
            let mut pkt = Packet::new(SessionTag::ServerSync.to_u8());
            pkt.put_u32(frame);
            pkt.put_u32(seeds[0]);
            pkt.put_u32(seeds[1]);
            self.send_to(id, pkt);
        }
    }

    fn broadcast_chat(&mut self, from: u32, message: &str) {
        for id in self.peers.ids() {
            let wants = self
                .peers
                .get(id)
                .map(|p| !p.is_closing() && p.state == SessionState::Active)
                .unwrap_or(false);
            if !wants {
                continue;
            }
            let mut pkt = Packet::new(SessionTag::ServerChat.to_u8());
            pkt.put_u32(from);
            pkt.put_string(message);
            self.send_to(id, pkt);
        }
    }

    fn broadcast_quit(&mut self, gone: u32) {
        for id in self.peers.ids() {
            let wants = self
                .peers
                .get(id)
                .map(|p| !p.is_closing() && p.state.is_joined())
                .unwrap_or(false);
            if !wants {
                continue;
            }
            let mut pkt = Packet::new(SessionTag::ServerQuit.to_u8());
            pkt.put_u32(gone);
            self.send_to(id, pkt);
        }
    }

    fn broadcast_joined(&mut self, joined: u32, name: &str, company: u8) {
        for id in self.peers.ids() {
            if id == joined {
                continue;
            }
            let wants = self
                .peers
                .get(id)
                .map(|p| !p.is_closing() && p.state.is_joined())
                .unwrap_or(false);
            if !wants {
                continue;
            }
            let mut info = Packet::new(SessionTag::ServerPeerInfo.to_u8());
            info.put_u32(joined);
            info.put_string(name);
            info.put_u8(company);
            self.send_to(id, info);

            let mut pkt = Packet::new(SessionTag::ServerJoined.to_u8());
            pkt.put_u32(joined);
            self.send_to(id, pkt);
        }
    }

    /// Serve a snapshot captured at the current frame, preceded by every
    /// stamped command still awaiting execution so the newcomer can
    /// catch up past the capture point.
    fn start_transfer(&mut self, id: u32) {
        let frame = self.clock.frame();
        let blob = self.game.write_snapshot();
        info!(
            "serving snapshot of {} bytes at frame {} to peer {}",
            blob.len(),
            frame,
            id
        );
        let [begin, size] = self.snapshots.begin(id, frame, blob);
        if let Some(peer) = self.peers.get_mut(id) {
            peer.state = SessionState::SnapshotTransfer;
            peer.last_ack = frame;
        }
        self.send_to(id, begin);
        self.send_to(id, size);

        let pending: Vec<CommandPacket> = self.own_queue.iter().cloned().collect();
        for cmd in pending {
            let mut pkt = Packet::new(SessionTag::ServerCommand.to_u8());
            cmd.write_stamped(&mut pkt, 0);
            self.send_to(id, pkt);
        }
    }

    fn start_next_transfer(&mut self) {
        while let Some(next) = self.snapshots.pop_waiter() {
            let alive = self
                .peers
                .get(next)
                .map(|p| !p.is_closing())
                .unwrap_or(false);
            if alive {
                self.start_transfer(next);
                break;
            }
        }
        self.refresh_wait_positions();
    }

    fn refresh_wait_positions(&mut self) {
        for (peer_id, position) in self.snapshots.positions() {
            let mut pkt = Packet::new(SessionTag::ServerSnapshotWait.to_u8());
            pkt.put_u8(position);
            self.send_to(peer_id, pkt);
        }
    }

    fn stream_snapshot(&mut self) {
        let Some(emitted) = self.snapshots.emit(SNAPSHOT_BURST) else {
            return;
        };
        for pkt in emitted.packets {
            self.send_to(emitted.peer, pkt);
        }
        if emitted.done {
            debug!("snapshot fully sent to peer {}", emitted.peer);
        }
    }

    /// Per-peer frame announcement. Each grant tracks the authority's
    /// frame but stays within `max_lag` of the peer's acknowledged
    /// position, so a stalled peer stops receiving runway instead of
    /// collecting an unbounded backlog; a fresh ack slides the window
    /// forward again. Grants freeze entirely while paused.
    fn announce_frames(&mut self) {
        let frame = self.clock.frame();
        let lead = self.config.frame_lead;
        let max_lag = self.config.max_lag;
        let token_interval = self.config.token_interval;
        let paused = self.clock.paused();

        for peer in self.peers.iter_mut() {
            if peer.is_closing() || !peer.state.in_fanout() {
                continue;
            }
            if !paused {
                let reach = frame.min(peer.last_ack.saturating_add(max_lag));
                peer.ceiling = peer.ceiling.max(reach + lead);
            }

            let token = if !paused && frame.saturating_sub(peer.token_frame) >= token_interval {
                peer.token = random_bytes::<1>()[0];
                peer.token_frame = frame;
                Some(peer.token)
            } else {
                None
            };

            let mut pkt = Packet::new(SessionTag::ServerFrame.to_u8());
            pkt.put_u32(frame);
            pkt.put_u32(peer.ceiling);
            if let Some(token) = token {
                pkt.put_u8(token);
            }
            if peer.link.send(pkt).is_err() {
                peer.close(CloseReason::Error(ErrorCode::ConnectionLost));
            }
        }
    }

    fn connect_relay(&mut self) {
        let Some(addr) = self.config.relay.clone() else {
            return;
        };
        match RendezvousClient::connect(&addr, self.config.handshake_timeout) {
            Ok(mut relay) => match relay.register(&self.game_info()) {
                Ok(()) => {
                    info!("registered with rendezvous service at {}", addr);
                    self.relay = Some(relay);
                }
                Err(e) => warn!("rendezvous registration failed: {}", e),
            },
            Err(e) => warn!("rendezvous connection failed: {}", e),
        }
    }

    fn refresh_relay(&mut self) {
        if self.relay.is_none() || self.relay_refreshed.elapsed() < RELAY_REFRESH {
            return;
        }
        self.relay_refreshed = Instant::now();
        let info = self.game_info();
        if let Some(relay) = self.relay.as_mut() {
            if let Err(e) = relay.update(&info) {
                warn!("rendezvous update failed, unregistering: {}", e);
                self.relay = None;
            }
        }
    }

    fn send_to(&mut self, id: u32, pkt: Packet) {
        if let Some(peer) = self.peers.get_mut(id) {
            if peer.link.send(pkt).is_err() {
                peer.close(CloseReason::Error(ErrorCode::ConnectionLost));
            }
        }
    }

    /// Report an error to the peer and mark it for removal.
    fn drop_peer(&mut self, id: u32, code: ErrorCode) {
        if let Some(peer) = self.peers.get_mut(id) {
            if !peer.is_closing() {
                let mut pkt = Packet::new(SessionTag::ServerError.to_u8());
                pkt.put_u8(code.to_u8());
                pkt.put_string(code.as_str());
                let _ = peer.link.send(pkt);
                peer.close(CloseReason::Error(code));
            }
        }
    }
}
