use crate::net::{Packet, PacketError, Payload};

/// One entry of the content manifest checked before a peer may join:
/// an opaque content id plus a digest of its bytes. The session layer
/// only compares entries; producing them is the embedder's business.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestEntry {
    pub id: u32,
    pub digest: [u8; 16],
}

impl ManifestEntry {
    pub fn write(&self, p: &mut Packet) {
        p.put_u32(self.id).put_raw(&self.digest);
    }

    pub fn read(r: &mut Payload) -> Result<Self, PacketError> {
        Ok(Self {
            id: r.read_u32()?,
            digest: r.read_array()?,
        })
    }
}

/// The simulation boundary. Everything below the session layer is
/// deterministic lockstep bookkeeping; everything above it lives behind
/// this trait. Implementations must be bit-identical across peers given
/// the same frame and command sequence.
pub trait Game {
    /// Run exactly one simulation tick.
    fn advance_frame(&mut self);

    /// Apply a command at the current frame. The payload is opaque.
    fn execute_command(&mut self, company: u8, cmd: u32, payload: &[u8]);

    /// Seeds derived from simulation state, compared across peers to
    /// detect divergence.
    fn sync_seeds(&self) -> [u32; 2];

    fn write_snapshot(&self) -> Vec<u8>;

    fn load_snapshot(
        &mut self,
        data: &[u8],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    fn content_manifest(&self) -> Vec<ManifestEntry>;

    /// Called on a client before fatal teardown so local state can be
    /// preserved.
    fn emergency_save(&mut self);
}

/// A record of one executed command, kept by [`DemoGame`] so tests can
/// diff execution order across peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutedCommand {
    pub frame: u32,
    pub company: u8,
    pub cmd: u32,
}

/// Minimal deterministic game: a single xorshift64 register stirred once
/// per frame and once per command byte. The snapshot is the raw register
/// plus the frame counter.
pub struct DemoGame {
    state: u64,
    frame: u32,
    manifest: Vec<ManifestEntry>,
    log: Vec<ExecutedCommand>,
    emergency_saves: u32,
}

fn xorshift64(mut x: u64) -> u64 {
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x
}

impl DemoGame {
    pub fn new(seed: u64) -> Self {
        Self {
            // xorshift has a fixed point at zero.
            state: if seed == 0 { 0x9e3779b97f4a7c15 } else { seed },
            frame: 0,
            manifest: vec![ManifestEntry {
                id: 1,
                digest: [0x5a; 16],
            }],
            log: Vec::new(),
            emergency_saves: 0,
        }
    }

    pub fn set_manifest(&mut self, manifest: Vec<ManifestEntry>) {
        self.manifest = manifest;
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn log(&self) -> &[ExecutedCommand] {
        &self.log
    }

    pub fn emergency_saves(&self) -> u32 {
        self.emergency_saves
    }

    /// Corrupt the register. Test hook for forcing a desync.
    pub fn scramble(&mut self) {
        self.state ^= 1;
    }
}

impl Game for DemoGame {
    fn advance_frame(&mut self) {
        self.frame += 1;
        self.state = xorshift64(self.state);
    }

    fn execute_command(&mut self, company: u8, cmd: u32, payload: &[u8]) {
        self.state = xorshift64(self.state ^ u64::from(cmd) ^ (u64::from(company) << 32));
        for &byte in payload {
            self.state = xorshift64(self.state ^ u64::from(byte));
        }
        self.log.push(ExecutedCommand {
            frame: self.frame,
            company,
            cmd,
        });
    }

    fn sync_seeds(&self) -> [u32; 2] {
        [self.state as u32, (self.state >> 32) as u32]
    }

    fn write_snapshot(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(12);
        blob.extend_from_slice(&self.state.to_le_bytes());
        blob.extend_from_slice(&self.frame.to_le_bytes());
        blob
    }

    fn load_snapshot(
        &mut self,
        data: &[u8],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if data.len() != 12 {
            return Err(format!("snapshot is {} bytes, expected 12", data.len()).into());
        }
        let mut state = [0u8; 8];
        state.copy_from_slice(&data[..8]);
        let mut frame = [0u8; 4];
        frame.copy_from_slice(&data[8..]);
        self.state = u64::from_le_bytes(state);
        self.frame = u32::from_le_bytes(frame);
        self.log.clear();
        Ok(())
    }

    fn content_manifest(&self) -> Vec<ManifestEntry> {
        self.manifest.clone()
    }

    fn emergency_save(&mut self) {
        self.emergency_saves += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(game: &mut DemoGame, script: &[(u32, Option<(u8, u32)>)]) {
        for &(frames, cmd) in script {
            for _ in 0..frames {
                game.advance_frame();
            }
            if let Some((company, cmd)) = cmd {
                game.execute_command(company, cmd, &[1, 2, 3]);
            }
        }
    }

    #[test]
    fn identical_runs_agree() {
        let script = [(3, Some((1, 10))), (5, None), (1, Some((2, 20)))];
        let mut a = DemoGame::new(42);
        let mut b = DemoGame::new(42);
        run(&mut a, &script);
        run(&mut b, &script);

        assert_eq!(a.sync_seeds(), b.sync_seeds());
        assert_eq!(a.log(), b.log());
    }

    #[test]
    fn command_order_changes_the_seeds() {
        let mut a = DemoGame::new(42);
        let mut b = DemoGame::new(42);
        a.execute_command(1, 10, &[]);
        a.execute_command(1, 20, &[]);
        b.execute_command(1, 20, &[]);
        b.execute_command(1, 10, &[]);

        assert_ne!(a.sync_seeds(), b.sync_seeds());
    }

    #[test]
    fn snapshot_resumes_in_lockstep() {
        let mut source = DemoGame::new(7);
        run(&mut source, &[(10, Some((1, 5)))]);

        let mut joined = DemoGame::new(999);
        joined.load_snapshot(&source.write_snapshot()).unwrap();
        assert_eq!(joined.frame(), source.frame());

        source.advance_frame();
        joined.advance_frame();
        assert_eq!(source.sync_seeds(), joined.sync_seeds());
    }

    #[test]
    fn short_snapshot_is_rejected() {
        let mut game = DemoGame::new(1);
        assert!(game.load_snapshot(&[0; 5]).is_err());
    }

    #[test]
    fn manifest_entry_round_trip() {
        let entry = ManifestEntry {
            id: 0xdead,
            digest: [3; 16],
        };
        let mut pkt = Packet::new(0);
        entry.write(&mut pkt);
        let mut payload = Payload::new(pkt.freeze().slice(1..));
        assert_eq!(ManifestEntry::read(&mut payload).unwrap(), entry);
    }
}
