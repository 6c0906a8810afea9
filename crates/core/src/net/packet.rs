use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Hard ceiling on a single framed packet, enforced on both send and receive.
pub const MAX_PACKET_SIZE: usize = 16 * 1024;
/// Longest string accepted in any packet field (bytes of UTF-8).
pub const MAX_STRING_LEN: usize = 512;

pub const DEFAULT_PORT: u16 = 26215;

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("packet too short")]
    Truncated,
    #[error("packet exceeds {MAX_PACKET_SIZE} bytes")]
    Oversize,
    #[error("string field exceeds {MAX_STRING_LEN} bytes")]
    StringTooLong,
    #[error("invalid utf-8 in string field")]
    BadString,
    #[error("unknown packet tag {0}")]
    UnknownTag(u8),
    #[error("packet tag {0} not valid here")]
    UnexpectedTag(u8),
    #[error("payload authentication failed")]
    Decrypt,
    #[error("payload encryption failed")]
    Encrypt,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Outgoing packet under construction: the type tag followed by fields in
/// wire order. Integers are little-endian, strings and blobs carry a u16
/// length prefix. The framing layer prepends the overall length.
#[derive(Debug, Clone)]
pub struct Packet {
    buf: BytesMut,
}

impl Packet {
    pub fn new(tag: u8) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(tag);
        Self { buf }
    }

    pub fn tag(&self) -> u8 {
        self.buf[0]
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn put_bool(&mut self, v: bool) -> &mut Self {
        self.buf.put_u8(v as u8);
        self
    }

    pub fn put_u16(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16_le(v);
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32_le(v);
        self
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.buf.put_u64_le(v);
        self
    }

    /// Strings longer than [`MAX_STRING_LEN`] are truncated at a character
    /// boundary rather than rejected; the receive side enforces the limit.
    pub fn put_string(&mut self, s: &str) -> &mut Self {
        let mut end = s.len().min(MAX_STRING_LEN);
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        self.buf.put_u16_le(end as u16);
        self.buf.put_slice(&s.as_bytes()[..end]);
        self
    }

    /// Length-prefixed byte block.
    pub fn put_blob(&mut self, data: &[u8]) -> &mut Self {
        debug_assert!(data.len() <= u16::MAX as usize);
        self.buf.put_u16_le(data.len() as u16);
        self.buf.put_slice(data);
        self
    }

    /// Raw bytes with no prefix: fixed-size fields and end-of-packet chunks.
    pub fn put_raw(&mut self, data: &[u8]) -> &mut Self {
        self.buf.put_slice(data);
        self
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Cursor over a received packet body, positioned after the type tag.
/// Every read is bounds-checked; running off the end is a malformed packet.
#[derive(Debug)]
pub struct Payload {
    buf: Bytes,
}

impl Payload {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize) -> Result<(), PacketError> {
        if self.buf.remaining() < n {
            return Err(PacketError::Truncated);
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, PacketError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool, PacketError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16, PacketError> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn read_u32(&mut self) -> Result<u32, PacketError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn read_u64(&mut self) -> Result<u64, PacketError> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn read_string(&mut self) -> Result<String, PacketError> {
        let len = self.read_u16()? as usize;
        if len > MAX_STRING_LEN {
            return Err(PacketError::StringTooLong);
        }
        self.need(len)?;
        let raw = self.buf.split_to(len);
        String::from_utf8(raw.to_vec()).map_err(|_| PacketError::BadString)
    }

    pub fn read_blob(&mut self) -> Result<Vec<u8>, PacketError> {
        let len = self.read_u16()? as usize;
        self.need(len)?;
        Ok(self.buf.split_to(len).to_vec())
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], PacketError> {
        self.need(N)?;
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    /// Everything left in the packet, e.g. a snapshot chunk.
    pub fn read_rest(&mut self) -> Bytes {
        self.buf.split_to(self.buf.remaining())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_round_trip() {
        let mut p = Packet::new(7);
        p.put_u8(0xAB).put_u16(0x1234).put_u32(0xDEADBEEF).put_u64(42).put_bool(true);

        let bytes = p.freeze();
        assert_eq!(bytes[0], 7);

        let mut r = Payload::new(bytes.slice(1..));
        assert_eq!(r.read_u8().unwrap(), 0xAB);
        assert_eq!(r.read_u16().unwrap(), 0x1234);
        assert_eq!(r.read_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(r.read_u64().unwrap(), 42);
        assert!(r.read_bool().unwrap());
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_little_endian_layout() {
        let mut p = Packet::new(0);
        p.put_u16(0x0102).put_u32(0x03040506);
        let bytes = p.freeze();
        assert_eq!(&bytes[1..], &[0x02, 0x01, 0x06, 0x05, 0x04, 0x03]);
    }

    #[test]
    fn test_string_round_trip() {
        let mut p = Packet::new(0);
        p.put_string("hello").put_string("");
        let mut r = Payload::new(p.freeze().slice(1..));
        assert_eq!(r.read_string().unwrap(), "hello");
        assert_eq!(r.read_string().unwrap(), "");
    }

    #[test]
    fn test_long_string_truncated_on_send() {
        let long = "x".repeat(MAX_STRING_LEN + 100);
        let mut p = Packet::new(0);
        p.put_string(&long);
        let mut r = Payload::new(p.freeze().slice(1..));
        assert_eq!(r.read_string().unwrap().len(), MAX_STRING_LEN);
    }

    #[test]
    fn test_truncation_respects_char_boundary() {
        let s = "é".repeat(MAX_STRING_LEN);
        let mut p = Packet::new(0);
        p.put_string(&s);
        let mut r = Payload::new(p.freeze().slice(1..));
        let back = r.read_string().unwrap();
        assert!(back.len() <= MAX_STRING_LEN);
        assert!(back.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_oversized_string_rejected_on_receive() {
        let mut raw = BytesMut::new();
        raw.put_u16_le((MAX_STRING_LEN + 1) as u16);
        raw.put_slice(&vec![b'a'; MAX_STRING_LEN + 1]);
        let mut r = Payload::new(raw.freeze());
        assert!(matches!(r.read_string(), Err(PacketError::StringTooLong)));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut raw = BytesMut::new();
        raw.put_u16_le(2);
        raw.put_slice(&[0xFF, 0xFE]);
        let mut r = Payload::new(raw.freeze());
        assert!(matches!(r.read_string(), Err(PacketError::BadString)));
    }

    #[test]
    fn test_short_read_fails() {
        let mut r = Payload::new(Bytes::from_static(&[0x01, 0x02]));
        assert!(matches!(r.read_u32(), Err(PacketError::Truncated)));
        // The failed read consumed nothing.
        assert_eq!(r.read_u16().unwrap(), 0x0201);
    }

    #[test]
    fn test_truncated_blob_fails() {
        let mut raw = BytesMut::new();
        raw.put_u16_le(10);
        raw.put_slice(&[1, 2, 3]);
        let mut r = Payload::new(raw.freeze());
        assert!(matches!(r.read_blob(), Err(PacketError::Truncated)));
    }

    #[test]
    fn test_blob_and_rest() {
        let mut p = Packet::new(0);
        p.put_blob(&[9, 8, 7]).put_raw(&[1, 2, 3, 4]);
        let mut r = Payload::new(p.freeze().slice(1..));
        assert_eq!(r.read_blob().unwrap(), vec![9, 8, 7]);
        assert_eq!(r.read_rest().as_ref(), &[1, 2, 3, 4]);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_array_read() {
        let mut p = Packet::new(0);
        p.put_raw(&[5; 16]);
        let mut r = Payload::new(p.freeze().slice(1..));
        let arr: [u8; 16] = r.read_array().unwrap();
        assert_eq!(arr, [5; 16]);
        assert!(matches!(r.read_array::<4>(), Err(PacketError::Truncated)));
    }
}
