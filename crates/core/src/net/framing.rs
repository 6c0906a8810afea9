use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;

use super::crypto::{SessionCipher, SEAL_OVERHEAD};
use super::packet::{Packet, PacketError, Payload, MAX_PACKET_SIZE};

/// Hard cap on one frame: the two length bytes, a maximum-size packet body,
/// and the AEAD tag appended once the channel is encrypted.
const MAX_FRAME_SIZE: usize = 2 + MAX_PACKET_SIZE + SEAL_OVERHEAD;

/// Reads one length-prefixed frame: u16 little-endian total size (including
/// the two size bytes themselves), then the body. The body is the type tag
/// plus fields, or one ciphertext once encryption is on.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf)?;
    let total = u16::from_le_bytes(len_buf) as usize;

    if total < 3 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame too short for a type tag",
        ));
    }
    if total > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", total),
        ));
    }

    let mut body = vec![0u8; total - 2];
    reader.read_exact(&mut body)?;
    Ok(body)
}

pub fn write_frame<W: Write>(writer: &mut W, body: &[u8]) -> io::Result<()> {
    let total = body.len() + 2;
    if total > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", total),
        ));
    }
    writer.write_all(&(total as u16).to_le_bytes())?;
    writer.write_all(body)?;
    writer.flush()
}

/// Write half of one connection, plus both cipher states. The session loop is
/// the only thread that touches a `Link`; reader threads frame raw bytes and
/// never decrypt.
pub struct Link {
    stream: TcpStream,
    send_cipher: Option<SessionCipher>,
    recv_cipher: Option<SessionCipher>,
}

impl Link {
    pub fn new(stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        Self {
            stream,
            send_cipher: None,
            recv_cipher: None,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }

    pub fn send(&mut self, packet: Packet) -> Result<(), PacketError> {
        let body = packet.freeze();
        if body.len() > MAX_PACKET_SIZE {
            return Err(PacketError::Oversize);
        }
        match &mut self.send_cipher {
            Some(cipher) => {
                let sealed = cipher.seal(&body)?;
                write_frame(&mut self.stream, &sealed)?;
            }
            None => write_frame(&mut self.stream, &body)?,
        }
        Ok(())
    }

    /// Turns a raw frame body from the reader thread into (tag, payload),
    /// decrypting first when the channel is encrypted.
    pub fn open(&mut self, raw: Vec<u8>) -> Result<(u8, Payload), PacketError> {
        let body = match &mut self.recv_cipher {
            Some(cipher) => cipher.open(&raw)?,
            None => raw,
        };
        if body.is_empty() {
            return Err(PacketError::Truncated);
        }
        let body = Bytes::from(body);
        Ok((body[0], Payload::new(body.slice(1..))))
    }

    /// All packets written after this call go out encrypted.
    pub fn encrypt_send(&mut self, cipher: SessionCipher) {
        self.send_cipher = Some(cipher);
    }

    /// All frames opened after this call are expected to be ciphertext.
    pub fn encrypt_recv(&mut self, cipher: SessionCipher) {
        self.recv_cipher = Some(cipher);
    }

    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Events flowing from I/O threads into a session loop.
pub(crate) enum WireEvent {
    Accepted(TcpStream, SocketAddr),
    Frame(u32, Vec<u8>),
    Closed(u32),
}

/// Accept loop: nonblocking accept with a short sleep so the running flag is
/// observed promptly. Exits when the flag drops or the session loop is gone.
pub(crate) fn spawn_listener(
    listener: TcpListener,
    running: Arc<AtomicBool>,
    tx: Sender<WireEvent>,
) {
    thread::spawn(move || {
        if listener.set_nonblocking(true).is_err() {
            return;
        }
        while running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, addr)) => {
                    if tx.send(WireEvent::Accepted(stream, addr)).is_err() {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(_) => return,
            }
        }
    });
}

/// Per-connection reader: blocking frame reads forwarded to the session loop.
/// Unblocked on teardown by the session loop shutting the socket down.
pub(crate) fn spawn_reader(id: u32, stream: TcpStream, tx: Sender<WireEvent>) {
    thread::spawn(move || {
        let mut stream = stream;
        loop {
            match read_frame(&mut stream) {
                Ok(body) => {
                    if tx.send(WireEvent::Frame(id, body)).is_err() {
                        return;
                    }
                }
                Err(_) => {
                    let _ = tx.send(WireEvent::Closed(id));
                    return;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frame_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &[7, 1, 2, 3]).unwrap();
        assert_eq!(buf[..2], (6u16).to_le_bytes());

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).unwrap(), vec![7, 1, 2, 3]);
    }

    #[test]
    fn test_multiple_frames_in_sequence() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &[1]).unwrap();
        write_frame(&mut buf, &[2, 2]).unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).unwrap(), vec![1]);
        assert_eq!(read_frame(&mut cursor).unwrap(), vec![2, 2]);
    }

    #[test]
    fn test_undersized_frame_rejected() {
        let mut cursor = Cursor::new(vec![2u8, 0]);
        assert!(read_frame(&mut cursor).is_err());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let len = (MAX_FRAME_SIZE + 1) as u16;
        let mut cursor = Cursor::new(len.to_le_bytes().to_vec());
        assert!(read_frame(&mut cursor).is_err());

        let mut out = Vec::new();
        assert!(write_frame(&mut out, &vec![0u8; MAX_FRAME_SIZE]).is_err());
    }

    #[test]
    fn test_max_size_packet_fits_sealed() {
        // A full-size body plus the seal overhead is exactly one legal frame.
        let body = vec![0u8; MAX_PACKET_SIZE + SEAL_OVERHEAD];
        let mut buf = Vec::new();
        write_frame(&mut buf, &body).unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).unwrap().len(), body.len());
    }

    #[test]
    fn test_link_refuses_a_packet_over_the_limit() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let _held = listener.accept().unwrap();

        let mut link = Link::new(stream);
        let mut pkt = Packet::new(0);
        pkt.put_raw(&vec![0u8; MAX_PACKET_SIZE]);
        assert!(matches!(link.send(pkt), Err(PacketError::Oversize)));
    }

    #[test]
    fn test_truncated_stream() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &[9; 10]).unwrap();
        buf.truncate(6);
        let mut cursor = Cursor::new(buf);
        assert!(read_frame(&mut cursor).is_err());
    }
}
