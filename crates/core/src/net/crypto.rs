use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use super::packet::PacketError;

pub const KEY_MATERIAL_LEN: usize = 32;
pub const CHALLENGE_LEN: usize = 24;
pub const MAC_LEN: usize = 32;
/// Poly1305 tag appended to every sealed packet body.
pub const SEAL_OVERHEAD: usize = 16;

bitflags::bitflags! {
    /// Authentication methods a server may offer in its auth request.
    /// Unknown bits from newer peers are ignored, not rejected.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AuthMethods: u8 {
        const KEY_EXCHANGE = 1 << 0;
        const JOIN_KEY = 1 << 1;
    }
}

impl AuthMethods {
    /// Picks the method a joining peer answers with: the join key when the
    /// server asks for one and we have one, plain key exchange otherwise.
    pub fn select(offered: AuthMethods, has_key: bool) -> Option<AuthMethods> {
        if offered.contains(AuthMethods::JOIN_KEY) && has_key {
            return Some(AuthMethods::JOIN_KEY);
        }
        if offered.contains(AuthMethods::KEY_EXCHANGE) {
            return Some(AuthMethods::KEY_EXCHANGE);
        }
        None
    }
}

pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

/// Shared secret agreed during the handshake. Traffic keys are not derived
/// from it until the enable-encryption packet supplies the channel nonce.
pub struct MasterSecret([u8; 32]);

fn derive_master(join_key: &str, server_material: &[u8; 32], peer_material: &[u8; 32]) -> Hkdf<Sha256> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(server_material);
    salt[32..].copy_from_slice(peer_material);
    Hkdf::<Sha256>::new(Some(&salt), join_key.as_bytes())
}

fn expand(hk: &Hkdf<Sha256>, info: &[u8], out: &mut [u8]) {
    // Output lengths here are all well under the hkdf limit.
    hk.expand(info, out).expect("hkdf output length");
}

fn challenge_mac(hk: &Hkdf<Sha256>, challenge: &[u8; CHALLENGE_LEN]) -> [u8; MAC_LEN] {
    let mut info = Vec::with_capacity(4 + CHALLENGE_LEN);
    info.extend_from_slice(b"auth");
    info.extend_from_slice(challenge);
    let mut mac = [0u8; MAC_LEN];
    expand(hk, &info, &mut mac);
    mac
}

/// Authority side of the challenge/response exchange. One instance per
/// joining connection; dropped once verified.
pub struct ServerHandshake {
    pub methods: AuthMethods,
    pub key_material: [u8; KEY_MATERIAL_LEN],
    pub challenge: [u8; CHALLENGE_LEN],
}

impl ServerHandshake {
    pub fn begin(methods: AuthMethods) -> Self {
        Self {
            methods,
            key_material: random_bytes(),
            challenge: random_bytes(),
        }
    }

    /// Checks the peer's MAC over the challenge. `None` means authentication
    /// failed; the connection must be closed, never retried.
    pub fn verify(
        &self,
        join_key: &str,
        peer_material: &[u8; KEY_MATERIAL_LEN],
        mac: &[u8; MAC_LEN],
    ) -> Option<MasterSecret> {
        let hk = derive_master(join_key, &self.key_material, peer_material);
        if challenge_mac(&hk, &self.challenge) != *mac {
            return None;
        }
        let mut master = [0u8; 32];
        expand(&hk, b"master", &mut master);
        Some(MasterSecret(master))
    }
}

/// Joining-peer side: derive the secret and produce the response fields.
pub fn respond(
    join_key: &str,
    offered: AuthMethods,
    server_material: &[u8; KEY_MATERIAL_LEN],
    challenge: &[u8; CHALLENGE_LEN],
) -> Option<([u8; KEY_MATERIAL_LEN], [u8; MAC_LEN], MasterSecret)> {
    let method = AuthMethods::select(offered, !join_key.is_empty())?;
    let key = if method == AuthMethods::JOIN_KEY { join_key } else { "" };

    let peer_material: [u8; KEY_MATERIAL_LEN] = random_bytes();
    let hk = derive_master(key, server_material, &peer_material);
    let mac = challenge_mac(&hk, challenge);
    let mut master = [0u8; 32];
    expand(&hk, b"master", &mut master);
    Some((peer_material, mac, MasterSecret(master)))
}

impl MasterSecret {
    /// Derives the two directional ciphers from the enable-encryption nonce.
    /// Returns (client-to-server, server-to-client).
    pub fn traffic(&self, channel_nonce: &[u8; CHALLENGE_LEN]) -> (SessionCipher, SessionCipher) {
        let hk = Hkdf::<Sha256>::new(Some(channel_nonce), &self.0);

        let mut c2s_key = [0u8; 32];
        let mut s2c_key = [0u8; 32];
        let mut c2s_iv = [0u8; 4];
        let mut s2c_iv = [0u8; 4];
        expand(&hk, b"c2s key", &mut c2s_key);
        expand(&hk, b"s2c key", &mut s2c_key);
        expand(&hk, b"c2s iv", &mut c2s_iv);
        expand(&hk, b"s2c iv", &mut s2c_iv);

        (
            SessionCipher::new(&c2s_key, c2s_iv),
            SessionCipher::new(&s2c_key, s2c_iv),
        )
    }
}

/// One direction of the encrypted channel: ChaCha20-Poly1305 with a derived
/// 4-byte prefix plus a packet counter as the nonce. Both ends count in step
/// because the transport is ordered and lossless.
pub struct SessionCipher {
    cipher: ChaCha20Poly1305,
    prefix: [u8; 4],
    counter: u64,
}

impl SessionCipher {
    fn new(key: &[u8; 32], prefix: [u8; 4]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(GenericArray::from_slice(key)),
            prefix,
            counter: 0,
        }
    }

    fn next_nonce(&mut self) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&self.prefix);
        nonce[4..].copy_from_slice(&self.counter.to_le_bytes());
        self.counter = self.counter.wrapping_add(1);
        nonce
    }

    pub fn seal(&mut self, plain: &[u8]) -> Result<Vec<u8>, PacketError> {
        let nonce = self.next_nonce();
        self.cipher
            .encrypt(GenericArray::from_slice(&nonce), plain)
            .map_err(|_| PacketError::Encrypt)
    }

    pub fn open(&mut self, sealed: &[u8]) -> Result<Vec<u8>, PacketError> {
        let nonce = self.next_nonce();
        self.cipher
            .decrypt(GenericArray::from_slice(&nonce), sealed)
            .map_err(|_| PacketError::Decrypt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake(server_key: &str, client_key: &str) -> Option<(MasterSecret, MasterSecret)> {
        let methods = if server_key.is_empty() {
            AuthMethods::KEY_EXCHANGE
        } else {
            AuthMethods::JOIN_KEY
        };
        let hs = ServerHandshake::begin(methods);
        let (material, mac, client_master) =
            respond(client_key, methods, &hs.key_material, &hs.challenge)?;
        let server_master = hs.verify(server_key, &material, &mac)?;
        Some((server_master, client_master))
    }

    #[test]
    fn test_handshake_agrees_on_keys() {
        let (server, client) = handshake("sesame", "sesame").unwrap();

        let nonce = random_bytes::<CHALLENGE_LEN>();
        let (mut s_c2s, mut s_s2c) = server.traffic(&nonce);
        let (mut c_c2s, mut c_s2c) = client.traffic(&nonce);

        let sealed = c_c2s.seal(b"to the server").unwrap();
        assert_eq!(s_c2s.open(&sealed).unwrap(), b"to the server");

        let sealed = s_s2c.seal(b"to the client").unwrap();
        assert_eq!(c_s2c.open(&sealed).unwrap(), b"to the client");
    }

    #[test]
    fn test_open_handshake_without_key() {
        assert!(handshake("", "").is_some());
    }

    #[test]
    fn test_wrong_join_key_rejected() {
        assert!(handshake("sesame", "not sesame").is_none());
    }

    #[test]
    fn test_client_without_required_key_cannot_answer() {
        let hs = ServerHandshake::begin(AuthMethods::JOIN_KEY);
        assert!(respond("", AuthMethods::JOIN_KEY, &hs.key_material, &hs.challenge).is_none());
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let (server, client) = handshake("", "").unwrap();
        let nonce = random_bytes::<CHALLENGE_LEN>();
        let (mut c2s, _) = client.traffic(&nonce);
        let (mut s_c2s, _) = server.traffic(&nonce);

        let mut sealed = c2s.seal(b"payload").unwrap();
        sealed[0] ^= 0x01;
        assert!(matches!(s_c2s.open(&sealed), Err(PacketError::Decrypt)));
    }

    #[test]
    fn test_nonces_do_not_repeat() {
        let (_, client) = handshake("", "").unwrap();
        let nonce = random_bytes::<CHALLENGE_LEN>();
        let (mut c2s, _) = client.traffic(&nonce);

        let a = c2s.seal(b"same").unwrap();
        let b = c2s.seal(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_method_selection() {
        let both = AuthMethods::KEY_EXCHANGE | AuthMethods::JOIN_KEY;
        assert_eq!(AuthMethods::select(both, true), Some(AuthMethods::JOIN_KEY));
        assert_eq!(AuthMethods::select(both, false), Some(AuthMethods::KEY_EXCHANGE));
        assert_eq!(AuthMethods::select(AuthMethods::JOIN_KEY, false), None);
        assert_eq!(AuthMethods::select(AuthMethods::empty(), true), None);
    }
}
