use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::PeerConfig;
use crate::game::{Game, ManifestEntry};
use crate::net::{
    read_frame, respond, spawn_reader, AuthMethods, ErrorCode, GameInfo, Link, MasterSecret,
    Packet, PacketError, Payload, SessionTag, WireEvent, CHALLENGE_LEN, KEY_MATERIAL_LEN,
    PROTOCOL_VERSION,
};
use crate::snapshot::SnapshotReceiver;
use crate::sync::{CommandPacket, CommandQueue, FrameClock, MAX_COMMAND_PAYLOAD};

use super::state::SessionState;
use super::{SessionError, MAX_DISPATCH_PER_TICK};

/// Observable happenings on the joining side, drained by the embedder.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Connected { peer_id: u32, server_name: String },
    Waiting { position: u8 },
    Active { frame: u32 },
    PeerInfo { peer_id: u32, name: String, company: u8 },
    PeerJoined { peer_id: u32 },
    PeerLeft { peer_id: u32 },
    Chat { peer_id: u32, message: String },
    CommandCompleted { frame: u32, cmd: u32, callback: u8 },
    Dropped { reason: ErrorCode },
}

/// The joining side of a session: walks the handshake, applies the
/// snapshot, then executes frames strictly inside the authority's
/// ceiling. One reader thread frames bytes; all protocol state lives on
/// the thread calling [`PeerSession::pump`] and [`PeerSession::step`].
pub struct PeerSession<G: Game> {
    config: PeerConfig,
    game: G,
    link: Link,
    rx: Receiver<WireEvent>,
    state: SessionState,
    peer_id: u32,
    server_name: String,
    clock: FrameClock,
    queue: CommandQueue,
    receiver: SnapshotReceiver,
    secret: Option<MasterSecret>,
    last_ack_sent: u32,
    last_server_packet: Instant,
    incoming: VecDeque<Vec<u8>>,
    // Reader thread saw EOF. Queued frames still dispatch first: the
    // server's parting error or shutdown notice rides just ahead of it.
    eof: bool,
    pending_events: VecDeque<PeerEvent>,
}

impl<G: Game> PeerSession<G> {
    /// Open the connection and send the join request. The rest of the
    /// handshake runs through [`PeerSession::pump`].
    pub fn connect(addr: &str, config: PeerConfig, game: G) -> Result<Self, SessionError> {
        let target = resolve(addr)?;
        let stream = TcpStream::connect_timeout(&target, config.connect_timeout)?;
        let reader = stream.try_clone()?;
        let mut link = Link::new(stream);
        let (tx, rx) = mpsc::channel();
        spawn_reader(0, reader, tx);
        info!("connecting to {}", target);

        let mut pkt = Packet::new(SessionTag::ClientJoin.to_u8());
        pkt.put_u32(PROTOCOL_VERSION);
        pkt.put_string(env!("CARGO_PKG_VERSION"));
        link.send(pkt)?;

        Ok(Self {
            config,
            game,
            link,
            rx,
            state: SessionState::Joining,
            peer_id: 0,
            server_name: String::new(),
            clock: FrameClock::new(),
            queue: CommandQueue::new(),
            receiver: SnapshotReceiver::new(),
            secret: None,
            last_ack_sent: 0,
            last_server_packet: Instant::now(),
            incoming: VecDeque::new(),
            eof: false,
            pending_events: VecDeque::new(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn frame(&self) -> u32 {
        self.clock.frame()
    }

    /// Frames the authority has executed that we have not.
    pub fn behind(&self) -> u32 {
        self.clock.behind()
    }

    /// Highest frame we are currently allowed to execute.
    pub fn ceiling(&self) -> u32 {
        self.clock.ceiling()
    }

    pub fn peer_id(&self) -> u32 {
        self.peer_id
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn game(&self) -> &G {
        &self.game
    }

    pub fn game_mut(&mut self) -> &mut G {
        &mut self.game
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = PeerEvent> + '_ {
        self.pending_events.drain(..)
    }

    /// Move framed bytes from the reader thread into handlers. Never
    /// blocks; at most a bounded batch per call, the rest stays queued.
    pub fn pump(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            match event {
                WireEvent::Frame(_, raw) => self.incoming.push_back(raw),
                WireEvent::Closed(_) => self.eof = true,
                WireEvent::Accepted(..) => {}
            }
        }

        for _ in 0..MAX_DISPATCH_PER_TICK {
            if self.state == SessionState::Inactive {
                break;
            }
            let Some(raw) = self.incoming.pop_front() else {
                break;
            };
            self.last_server_packet = Instant::now();
            match self.link.open(raw) {
                Ok((tag, payload)) => self.dispatch(tag, payload),
                Err(e) => {
                    warn!("undecodable server frame: {}", e);
                    self.report_and_close(ErrorCode::MalformedPacket);
                }
            }
        }
        if self.eof && self.incoming.is_empty() && self.state != SessionState::Inactive {
            warn!("connection lost");
            self.fatal(ErrorCode::ConnectionLost);
        }
        // Blocked at the ceiling with unreported progress: ack now, or
        // the authority's grant window can never slide past us.
        if self.state == SessionState::Active
            && self.clock.frame() > self.last_ack_sent
            && !self.clock.can_step()
        {
            self.send_ack(self.clock.frame());
        }
        self.check_idle();
    }

    /// Execute at most one frame, if the ceiling allows it. Returns true
    /// when a frame ran, so callers can fast-forward a backlog.
    pub fn step(&mut self) -> bool {
        if self.state != SessionState::Active || !self.clock.can_step() {
            return false;
        }
        let frame = self.clock.advance();
        self.game.advance_frame();
        while let Some(cmd) = self.queue.pop_due(frame) {
            self.game.execute_command(cmd.company, cmd.cmd, &cmd.payload);
            if cmd.my_cmd {
                self.pending_events.push_back(PeerEvent::CommandCompleted {
                    frame,
                    cmd: cmd.cmd,
                    callback: cmd.callback,
                });
            }
        }
        match self.run_due_check() {
            Some(false) => return true,
            // A passed check doubles as an ack point, keeping our
            // acknowledged frame fresh even with a long ack interval.
            Some(true) => self.send_ack(frame),
            None => {
                if frame.saturating_sub(self.last_ack_sent) >= self.config.ack_interval {
                    self.send_ack(frame);
                }
            }
        }
        true
    }

    /// Submit a command for distribution. It executes here only once the
    /// authority fans it back with a frame stamp.
    pub fn submit_command(
        &mut self,
        cmd: u32,
        payload: Vec<u8>,
        callback: u8,
    ) -> Result<(), SessionError> {
        if self.state != SessionState::Active {
            return Err(SessionError::NotActive);
        }
        if payload.len() > MAX_COMMAND_PAYLOAD {
            return Err(PacketError::Oversize.into());
        }
        let command = CommandPacket::new(self.config.company, cmd, payload, callback);
        let mut pkt = Packet::new(SessionTag::ClientCommand.to_u8());
        command.write_request(&mut pkt);
        self.link.send(pkt)?;
        Ok(())
    }

    pub fn submit_chat(&mut self, message: &str) -> Result<(), SessionError> {
        if self.state != SessionState::Active {
            return Err(SessionError::NotActive);
        }
        let mut pkt = Packet::new(SessionTag::ClientChat.to_u8());
        pkt.put_string(message);
        self.link.send(pkt)?;
        Ok(())
    }

    /// Orderly departure. No emergency save: leaving on purpose is not a
    /// failure.
    pub fn leave(&mut self) {
        if self.state == SessionState::Inactive {
            return;
        }
        info!("leaving session");
        let _ = self.link.send(Packet::new(SessionTag::ClientQuit.to_u8()));
        self.link.shutdown();
        self.state = SessionState::Inactive;
    }

    fn dispatch(&mut self, tag: u8, payload: Payload) {
        let result = match SessionTag::from_u8(tag) {
            Some(SessionTag::ServerFull) => self.handle_refusal(ErrorCode::Full),
            Some(SessionTag::ServerBanned) => self.handle_refusal(ErrorCode::Banned),
            Some(SessionTag::ServerError) => self.handle_error(payload),
            Some(SessionTag::ServerGameInfo) => {
                // Only the one-shot query path asks for this.
                self.report_and_close(ErrorCode::NotExpected);
                Ok(())
            }
            Some(SessionTag::ServerAuthRequest) => self.handle_auth_request(payload),
            Some(SessionTag::ServerEnableEncryption) => self.handle_enable_encryption(payload),
            Some(SessionTag::ServerCheckManifest) => self.handle_check_manifest(payload),
            Some(SessionTag::ServerWelcome) => self.handle_welcome(payload),
            Some(SessionTag::ServerSnapshotWait) => self.handle_snapshot_wait(payload),
            Some(SessionTag::ServerSnapshotBegin) => self.handle_snapshot_begin(payload),
            Some(SessionTag::ServerSnapshotSize) => self.handle_snapshot_size(payload),
            Some(SessionTag::ServerSnapshotData) => self.handle_snapshot_data(payload),
            Some(SessionTag::ServerSnapshotDone) => self.handle_snapshot_done(),
            Some(SessionTag::ServerFrame) => self.handle_frame(payload),
            Some(SessionTag::ServerSync) => self.handle_sync(payload),
            Some(SessionTag::ServerCommand) => self.handle_command(payload),
            Some(SessionTag::ServerPeerInfo) => self.handle_peer_info(payload),
            Some(SessionTag::ServerJoined) => self.handle_joined(payload),
            Some(SessionTag::ServerQuit) => self.handle_peer_quit(payload),
            Some(SessionTag::ServerChat) => self.handle_chat(payload),
            Some(SessionTag::ServerShutdown) => {
                info!("server is shutting down");
                self.fatal(ErrorCode::Shutdown);
                Ok(())
            }
            Some(SessionTag::ServerNewGame) => {
                info!("server is starting a new game");
                self.fatal(ErrorCode::NewGame);
                Ok(())
            }
            Some(other) => {
                warn!("server sent client-only tag {:?}", other);
                self.report_and_close(ErrorCode::NotExpected);
                Ok(())
            }
            None => {
                warn!("server sent unknown tag {}", tag);
                self.report_and_close(ErrorCode::MalformedPacket);
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!("malformed server packet: {}", e);
            self.report_and_close(ErrorCode::MalformedPacket);
        }
    }

    fn handle_refusal(&mut self, code: ErrorCode) -> Result<(), PacketError> {
        if self.state != SessionState::Joining {
            self.report_and_close(ErrorCode::NotExpected);
            return Ok(());
        }
        info!("server refused us: {}", code.as_str());
        self.fatal(code);
        Ok(())
    }

    fn handle_error(&mut self, mut payload: Payload) -> Result<(), PacketError> {
        let code = ErrorCode::from_u8(payload.read_u8()?);
        let detail = payload.read_string()?;
        warn!("server dropped us: {} ({})", code.as_str(), detail);
        self.fatal(code);
        Ok(())
    }

    fn handle_auth_request(&mut self, mut payload: Payload) -> Result<(), PacketError> {
        let offered = AuthMethods::from_bits_truncate(payload.read_u8()?);
        let material: [u8; KEY_MATERIAL_LEN] = payload.read_array()?;
        let challenge: [u8; CHALLENGE_LEN] = payload.read_array()?;

        if self.state != SessionState::Joining {
            self.report_and_close(ErrorCode::NotExpected);
            return Ok(());
        }
        let join_key = self.config.join_key.clone().unwrap_or_default();
        let Some((peer_material, mac, secret)) =
            respond(&join_key, offered, &material, &challenge)
        else {
            warn!("server requires a join key we do not have");
            self.fatal(ErrorCode::AuthFailed);
            return Ok(());
        };
        self.secret = Some(secret);

        let mut pkt = Packet::new(SessionTag::ClientAuthResponse.to_u8());
        pkt.put_raw(&peer_material);
        pkt.put_raw(&mac);
        self.send(pkt);
        self.state = SessionState::Authenticating;
        Ok(())
    }

    fn handle_enable_encryption(&mut self, mut payload: Payload) -> Result<(), PacketError> {
        let nonce: [u8; CHALLENGE_LEN] = payload.read_array()?;

        if self.state != SessionState::Authenticating {
            self.report_and_close(ErrorCode::NotExpected);
            return Ok(());
        }
        let Some(secret) = self.secret.take() else {
            self.report_and_close(ErrorCode::NotExpected);
            return Ok(());
        };
        let (c2s, s2c) = secret.traffic(&nonce);
        self.link.encrypt_send(c2s);
        self.link.encrypt_recv(s2c);
        debug!("channel encrypted");

        let mut pkt = Packet::new(SessionTag::ClientIdentify.to_u8());
        pkt.put_string(&self.config.name);
        pkt.put_u8(self.config.company);
        self.send(pkt);
        self.state = SessionState::Encrypted;
        Ok(())
    }

    fn handle_check_manifest(&mut self, mut payload: Payload) -> Result<(), PacketError> {
        let count = payload.read_u8()? as usize;
        let mut theirs = Vec::with_capacity(count);
        for _ in 0..count {
            theirs.push(ManifestEntry::read(&mut payload)?);
        }

        if self.state != SessionState::Encrypted {
            self.report_and_close(ErrorCode::NotExpected);
            return Ok(());
        }
        let mut ours = self.game.content_manifest();
        theirs.sort_by_key(|entry| entry.id);
        ours.sort_by_key(|entry| entry.id);
        if theirs != ours {
            warn!(
                "content manifest mismatch: server lists {} entries, we have {}",
                theirs.len(),
                ours.len()
            );
            self.report_and_close(ErrorCode::ManifestMismatch);
            return Ok(());
        }

        self.send(Packet::new(SessionTag::ClientManifestOk.to_u8()));
        self.state = SessionState::ContentCheck;
        Ok(())
    }

    fn handle_welcome(&mut self, mut payload: Payload) -> Result<(), PacketError> {
        let peer_id = payload.read_u32()?;
        let server_name = payload.read_string()?;

        if self.state != SessionState::ContentCheck {
            self.report_and_close(ErrorCode::NotExpected);
            return Ok(());
        }
        self.peer_id = peer_id;
        self.server_name = server_name.clone();
        self.state = SessionState::Authorized;
        info!("joined {:?} as peer {}", self.server_name, peer_id);
        self.pending_events.push_back(PeerEvent::Connected {
            peer_id,
            server_name,
        });

        self.send(Packet::new(SessionTag::ClientGetSnapshot.to_u8()));
        Ok(())
    }

    fn handle_snapshot_wait(&mut self, mut payload: Payload) -> Result<(), PacketError> {
        let position = payload.read_u8()?;

        if !matches!(
            self.state,
            SessionState::Authorized | SessionState::SnapshotWait
        ) {
            self.report_and_close(ErrorCode::NotExpected);
            return Ok(());
        }
        self.state = SessionState::SnapshotWait;
        info!("snapshot queue position {}", position);
        self.pending_events.push_back(PeerEvent::Waiting { position });
        Ok(())
    }

    fn handle_snapshot_begin(&mut self, mut payload: Payload) -> Result<(), PacketError> {
        let frame = payload.read_u32()?;

        if !matches!(
            self.state,
            SessionState::Authorized | SessionState::SnapshotWait
        ) {
            self.report_and_close(ErrorCode::NotExpected);
            return Ok(());
        }
        self.receiver.start(frame);
        self.state = SessionState::SnapshotTransfer;
        debug!("snapshot transfer started, capture frame {}", frame);
        Ok(())
    }

    fn handle_snapshot_size(&mut self, mut payload: Payload) -> Result<(), PacketError> {
        let total = payload.read_u32()?;

        if self.state != SessionState::SnapshotTransfer {
            self.report_and_close(ErrorCode::NotExpected);
            return Ok(());
        }
        if let Err(e) = self.receiver.announce_size(total) {
            warn!("snapshot refused: {}", e);
            self.report_and_close(ErrorCode::SnapshotFailed);
        }
        Ok(())
    }

    fn handle_snapshot_data(&mut self, mut payload: Payload) -> Result<(), PacketError> {
        if self.state != SessionState::SnapshotTransfer {
            self.report_and_close(ErrorCode::NotExpected);
            return Ok(());
        }
        let chunk = payload.read_rest();
        if let Err(e) = self.receiver.chunk(&chunk) {
            warn!("snapshot stream broke: {}", e);
            self.report_and_close(ErrorCode::SnapshotFailed);
        }
        Ok(())
    }

    fn handle_snapshot_done(&mut self) -> Result<(), PacketError> {
        if self.state != SessionState::SnapshotTransfer {
            self.report_and_close(ErrorCode::NotExpected);
            return Ok(());
        }
        let (frame, blob) = match self.receiver.finish() {
            Ok(done) => done,
            Err(e) => {
                warn!("snapshot incomplete: {}", e);
                self.report_and_close(ErrorCode::SnapshotFailed);
                return Ok(());
            }
        };
        info!("snapshot of {} bytes applied, resuming at frame {}", blob.len(), frame);
        if let Err(e) = self.game.load_snapshot(&blob) {
            warn!("snapshot failed to load: {}", e);
            self.report_and_close(ErrorCode::SnapshotFailed);
            return Ok(());
        }

        self.clock.resume_at(frame);
        self.last_ack_sent = frame;
        self.send(Packet::new(SessionTag::ClientSnapshotOk.to_u8()));
        self.state = SessionState::Active;
        self.pending_events.push_back(PeerEvent::Active { frame });
        Ok(())
    }

    fn handle_frame(&mut self, mut payload: Payload) -> Result<(), PacketError> {
        let frame = payload.read_u32()?;
        let ceiling = payload.read_u32()?;
        // The token byte rides along only when it was just rotated.
        let token = if payload.remaining() > 0 {
            Some(payload.read_u8()?)
        } else {
            None
        };

        if !self.state.in_fanout() {
            self.report_and_close(ErrorCode::NotExpected);
            return Ok(());
        }
        self.clock.observe_frame(frame, ceiling, token);
        Ok(())
    }

    fn handle_sync(&mut self, mut payload: Payload) -> Result<(), PacketError> {
        let frame = payload.read_u32()?;
        let seeds = [payload.read_u32()?, payload.read_u32()?];

        if !self.state.in_fanout() {
            self.report_and_close(ErrorCode::NotExpected);
            return Ok(());
        }
        if self.clock.observe_sync(frame, seeds) {
            // The pair may be for the frame we already sit at.
            if self.state == SessionState::Active {
                self.run_due_check();
            }
        } else {
            debug!(
                "sync check for frame {} arrived after frame {}",
                frame,
                self.clock.frame()
            );
        }
        Ok(())
    }

    fn handle_command(&mut self, mut payload: Payload) -> Result<(), PacketError> {
        let cmd = CommandPacket::read_stamped(&mut payload)?;

        if !self.state.in_fanout() {
            self.report_and_close(ErrorCode::NotExpected);
            return Ok(());
        }
        if self.state == SessionState::Active && cmd.frame <= self.clock.frame() {
            warn!(
                "command stamped for frame {} arrived at frame {}",
                cmd.frame,
                self.clock.frame()
            );
            self.report_and_close(ErrorCode::General);
            return Ok(());
        }
        self.queue.push(cmd);
        Ok(())
    }

    fn handle_peer_info(&mut self, mut payload: Payload) -> Result<(), PacketError> {
        let peer_id = payload.read_u32()?;
        let name = payload.read_string()?;
        let company = payload.read_u8()?;

        if !self.state.is_joined() {
            self.report_and_close(ErrorCode::NotExpected);
            return Ok(());
        }
        debug!("peer {} is {:?}, company {}", peer_id, name, company);
        self.pending_events.push_back(PeerEvent::PeerInfo {
            peer_id,
            name,
            company,
        });
        Ok(())
    }

    fn handle_joined(&mut self, mut payload: Payload) -> Result<(), PacketError> {
        let peer_id = payload.read_u32()?;

        if !self.state.is_joined() {
            self.report_and_close(ErrorCode::NotExpected);
            return Ok(());
        }
        self.pending_events.push_back(PeerEvent::PeerJoined { peer_id });
        Ok(())
    }

    fn handle_peer_quit(&mut self, mut payload: Payload) -> Result<(), PacketError> {
        let peer_id = payload.read_u32()?;

        if !self.state.is_joined() {
            self.report_and_close(ErrorCode::NotExpected);
            return Ok(());
        }
        self.pending_events.push_back(PeerEvent::PeerLeft { peer_id });
        Ok(())
    }

    fn handle_chat(&mut self, mut payload: Payload) -> Result<(), PacketError> {
        let peer_id = payload.read_u32()?;
        let message = payload.read_string()?;

        if self.state != SessionState::Active {
            self.report_and_close(ErrorCode::NotExpected);
            return Ok(());
        }
        self.pending_events.push_back(PeerEvent::Chat { peer_id, message });
        Ok(())
    }

    /// Compares the pending sync pair if a check is due at the current
    /// frame. `None` when nothing was due, otherwise whether the session
    /// survived the comparison.
    fn run_due_check(&mut self) -> Option<bool> {
        let expected = self.clock.due_check()?;
        let local = self.game.sync_seeds();
        if local != expected {
            warn!(
                "desync at frame {}: local seeds {:08x}/{:08x}, authority {:08x}/{:08x}",
                self.clock.frame(),
                local[0],
                local[1],
                expected[0],
                expected[1]
            );
            self.report_and_close(ErrorCode::Desync);
            return Some(false);
        }
        debug!("sync check passed at frame {}", self.clock.frame());
        Some(true)
    }

    fn send_ack(&mut self, frame: u32) {
        self.last_ack_sent = frame;
        let mut pkt = Packet::new(SessionTag::ClientAck.to_u8());
        pkt.put_u32(frame);
        pkt.put_u8(self.clock.token());
        self.send(pkt);
    }

    fn check_idle(&mut self) {
        // A queued peer legitimately hears nothing while transfers ahead
        // of it run.
        if matches!(
            self.state,
            SessionState::Inactive | SessionState::SnapshotWait
        ) {
            return;
        }
        if self.last_server_packet.elapsed() > self.config.idle_timeout {
            warn!("server went silent");
            self.fatal(ErrorCode::Timeout);
        }
    }

    fn send(&mut self, pkt: Packet) {
        if self.link.send(pkt).is_err() && self.state != SessionState::Inactive {
            self.fatal(ErrorCode::ConnectionLost);
        }
    }

    /// Report a protocol violation to the authority, then tear down.
    fn report_and_close(&mut self, code: ErrorCode) {
        let mut pkt = Packet::new(SessionTag::ClientError.to_u8());
        pkt.put_u8(code.to_u8());
        let _ = self.link.send(pkt);
        self.fatal(code);
    }

    /// Final teardown. A live session that dies unexpectedly gets one
    /// chance to preserve local state; an orderly shutdown or map change
    /// does not need it.
    fn fatal(&mut self, reason: ErrorCode) {
        if self.state == SessionState::Active
            && !matches!(reason, ErrorCode::Shutdown | ErrorCode::NewGame)
        {
            info!("saving emergency snapshot");
            self.game.emergency_save();
        }
        self.link.shutdown();
        self.state = SessionState::Inactive;
        self.pending_events.push_back(PeerEvent::Dropped { reason });
    }
}

/// One-shot, blocking: fetch a server's public info without joining.
pub fn query_info(addr: &str, timeout: Duration) -> Result<GameInfo, SessionError> {
    let target = resolve(addr)?;
    let stream = TcpStream::connect_timeout(&target, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    let mut reader = stream.try_clone()?;
    let mut link = Link::new(stream);
    link.send(Packet::new(SessionTag::ClientGameInfo.to_u8()))?;

    let raw = match read_frame(&mut reader) {
        Ok(raw) => raw,
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
            return Err(SessionError::Timeout)
        }
        Err(e) => return Err(e.into()),
    };
    let (tag, mut payload) = link.open(raw)?;
    match SessionTag::from_u8(tag) {
        Some(SessionTag::ServerGameInfo) => Ok(GameInfo::read(&mut payload)?),
        Some(SessionTag::ServerFull) => Err(SessionError::Refused(ErrorCode::Full)),
        Some(SessionTag::ServerBanned) => Err(SessionError::Refused(ErrorCode::Banned)),
        Some(SessionTag::ServerError) => {
            let code = ErrorCode::from_u8(payload.read_u8()?);
            Err(SessionError::Refused(code))
        }
        _ => Err(SessionError::Refused(ErrorCode::NotExpected)),
    }
}

fn resolve(addr: &str) -> io::Result<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no address resolved"))
}
