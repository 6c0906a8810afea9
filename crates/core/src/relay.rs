//! Client for the rendezvous coordinator: a directory where authorities
//! register their sessions and joining peers look up how to reach them.
//! All calls are blocking request/response on one framed connection;
//! nothing here touches the session state machines.

use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::debug;
use thiserror::Error;

use crate::net::{read_frame, GameInfo, Link, Packet, PacketError, Payload, RelayTag};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error("coordinator refused: {0}")]
    Refused(String),
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("coordinator sent unexpected tag {0}")]
    UnexpectedTag(u8),
    #[error("timed out waiting for the coordinator")]
    Timeout,
}

/// One connection to the coordinator. An authority keeps this open for
/// the lifetime of its registration; a browsing peer uses it briefly for
/// a listing or a connect request.
pub struct RendezvousClient {
    link: Link,
    reader: TcpStream,
    host_id: u32,
}

impl RendezvousClient {
    pub fn connect(addr: &str, timeout: Duration) -> Result<Self, RelayError> {
        let target = resolve(addr)?;
        let stream = TcpStream::connect_timeout(&target, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        let reader = stream.try_clone()?;
        debug!("connected to coordinator at {}", target);
        Ok(Self {
            link: Link::new(stream),
            reader,
            host_id: 0,
        })
    }

    /// Id the coordinator assigned at registration. Zero until then.
    pub fn host_id(&self) -> u32 {
        self.host_id
    }

    /// Announce a hosted session. The coordinator answers with the id
    /// under which peers will find it.
    pub fn register(&mut self, info: &GameInfo) -> Result<(), RelayError> {
        let mut pkt = Packet::new(RelayTag::Register.to_u8());
        info.write(&mut pkt);
        self.link.send(pkt)?;

        let (tag, mut payload) = self.recv()?;
        match tag {
            RelayTag::RegisterAck => {
                self.host_id = payload.read_u32()?;
                debug!("registered as host {}", self.host_id);
                Ok(())
            }
            other => Err(RelayError::UnexpectedTag(other.to_u8())),
        }
    }

    /// Refresh the listing entry. No reply; a dead coordinator surfaces
    /// as a send error.
    pub fn update(&mut self, info: &GameInfo) -> Result<(), RelayError> {
        let mut pkt = Packet::new(RelayTag::Update.to_u8());
        info.write(&mut pkt);
        self.link.send(pkt)?;
        Ok(())
    }

    /// Fetch the directory of registered sessions.
    pub fn list(&mut self) -> Result<Vec<(u32, GameInfo)>, RelayError> {
        self.link.send(Packet::new(RelayTag::Listing.to_u8()))?;

        let mut entries = Vec::new();
        loop {
            let (tag, mut payload) = self.recv()?;
            match tag {
                RelayTag::ListingEntry => {
                    let host_id = payload.read_u32()?;
                    let info = GameInfo::read(&mut payload)?;
                    entries.push((host_id, info));
                }
                RelayTag::ListingDone => return Ok(entries),
                other => return Err(RelayError::UnexpectedTag(other.to_u8())),
            }
        }
    }

    /// Ask how to reach a registered session. On success the reply names
    /// a host and port to dial directly; how the coordinator arranged
    /// reachability is its business.
    pub fn connect_request(&mut self, host_id: u32) -> Result<(String, u16), RelayError> {
        let mut pkt = Packet::new(RelayTag::ConnectRequest.to_u8());
        pkt.put_u32(host_id);
        self.link.send(pkt)?;

        let (tag, mut payload) = self.recv()?;
        match tag {
            RelayTag::ConnectReply => {
                let host = payload.read_string()?;
                let port = payload.read_u16()?;
                Ok((host, port))
            }
            RelayTag::ConnectFailed => Err(RelayError::ConnectFailed(payload.read_string()?)),
            other => Err(RelayError::UnexpectedTag(other.to_u8())),
        }
    }

    fn recv(&mut self) -> Result<(RelayTag, Payload), RelayError> {
        let raw = match read_frame(&mut self.reader) {
            Ok(raw) => raw,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Err(RelayError::Timeout)
            }
            Err(e) => return Err(e.into()),
        };
        let (tag, mut payload) = self.link.open(raw)?;
        match RelayTag::from_u8(tag) {
            Some(RelayTag::Error) => {
                let detail = payload.read_string().unwrap_or_default();
                Err(RelayError::Refused(detail))
            }
            Some(tag) => Ok((tag, payload)),
            None => Err(RelayError::UnexpectedTag(tag)),
        }
    }
}

fn resolve(addr: &str) -> io::Result<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no address resolved"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::write_frame;
    use std::net::TcpListener;
    use std::thread;

    fn info(name: &str, frame: u32) -> GameInfo {
        GameInfo {
            name: name.to_string(),
            peers: 2,
            max_peers: 8,
            frame,
            paused: false,
        }
    }

    /// Runs `script` against the next accepted connection and returns
    /// the address to dial.
    fn coordinator<F>(script: F) -> String
    where
        F: FnOnce(TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            if let Ok((stream, _)) = listener.accept() {
                script(stream);
            }
        });
        addr.to_string()
    }

    fn reply(stream: &mut TcpStream, pkt: Packet) {
        write_frame(stream, &pkt.freeze()).unwrap();
    }

    #[test]
    fn register_stores_the_assigned_host_id() {
        let addr = coordinator(|mut stream| {
            let raw = read_frame(&mut stream).unwrap();
            assert_eq!(raw[0], RelayTag::Register.to_u8());

            let mut ack = Packet::new(RelayTag::RegisterAck.to_u8());
            ack.put_u32(77);
            reply(&mut stream, ack);
        });

        let mut relay = RendezvousClient::connect(&addr, Duration::from_secs(2)).unwrap();
        relay.register(&info("alpha", 10)).unwrap();
        assert_eq!(relay.host_id(), 77);
    }

    #[test]
    fn listing_collects_entries_until_done() {
        let addr = coordinator(|mut stream| {
            let raw = read_frame(&mut stream).unwrap();
            assert_eq!(raw[0], RelayTag::Listing.to_u8());

            for (id, name) in [(1u32, "alpha"), (2, "beta")] {
                let mut entry = Packet::new(RelayTag::ListingEntry.to_u8());
                entry.put_u32(id);
                info(name, 100).write(&mut entry);
                reply(&mut stream, entry);
            }
            reply(&mut stream, Packet::new(RelayTag::ListingDone.to_u8()));
        });

        let mut relay = RendezvousClient::connect(&addr, Duration::from_secs(2)).unwrap();
        let listing = relay.list().unwrap();
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].0, 1);
        assert_eq!(listing[0].1.name, "alpha");
        assert_eq!(listing[1].1.name, "beta");
    }

    #[test]
    fn connect_request_returns_the_dial_address() {
        let addr = coordinator(|mut stream| {
            let raw = read_frame(&mut stream).unwrap();
            assert_eq!(raw[0], RelayTag::ConnectRequest.to_u8());
            assert_eq!(u32::from_le_bytes(raw[1..5].try_into().unwrap()), 42);

            let mut ok = Packet::new(RelayTag::ConnectReply.to_u8());
            ok.put_string("198.51.100.7");
            ok.put_u16(26215);
            reply(&mut stream, ok);
        });

        let mut relay = RendezvousClient::connect(&addr, Duration::from_secs(2)).unwrap();
        let (host, port) = relay.connect_request(42).unwrap();
        assert_eq!(host, "198.51.100.7");
        assert_eq!(port, 26215);
    }

    #[test]
    fn connect_failure_carries_the_coordinator_detail() {
        let addr = coordinator(|mut stream| {
            read_frame(&mut stream).unwrap();
            let mut failed = Packet::new(RelayTag::ConnectFailed.to_u8());
            failed.put_string("host unreachable");
            reply(&mut stream, failed);
        });

        let mut relay = RendezvousClient::connect(&addr, Duration::from_secs(2)).unwrap();
        match relay.connect_request(9) {
            Err(RelayError::ConnectFailed(detail)) => assert_eq!(detail, "host unreachable"),
            other => panic!("expected connect failure, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn coordinator_error_tag_fails_closed() {
        let addr = coordinator(|mut stream| {
            read_frame(&mut stream).unwrap();
            let mut err = Packet::new(RelayTag::Error.to_u8());
            err.put_string("listing unavailable");
            reply(&mut stream, err);
        });

        let mut relay = RendezvousClient::connect(&addr, Duration::from_secs(2)).unwrap();
        match relay.list() {
            Err(RelayError::Refused(detail)) => assert_eq!(detail, "listing unavailable"),
            other => panic!("expected refusal, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn out_of_role_tag_fails_closed() {
        let addr = coordinator(|mut stream| {
            read_frame(&mut stream).unwrap();
            // A request tag coming back from the coordinator is nonsense.
            let mut bogus = Packet::new(RelayTag::ConnectRequest.to_u8());
            bogus.put_u32(1);
            reply(&mut stream, bogus);
        });

        let mut relay = RendezvousClient::connect(&addr, Duration::from_secs(2)).unwrap();
        match relay.register(&info("alpha", 0)) {
            Err(RelayError::UnexpectedTag(tag)) => {
                assert_eq!(tag, RelayTag::ConnectRequest.to_u8())
            }
            other => panic!("expected unexpected-tag error, got {:?}", other.map(|_| ())),
        }
    }
}
