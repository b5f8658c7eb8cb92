//! # Crypto Context
//!
//! Session keying and per-datagram protection.
//!
//! ## Handshake
//!
//! Each side holds a secp256k1 key pair and a 16-byte handshake key (chosen by
//! the client and shipped to the console in the launch spec). The public key
//! travels in BIG/BANG together with `HMAC-SHA256(handshake_key, pub)`; the
//! peer's signature is checked before the ECDH shared secret (the x
//! coordinate of the shared point) is used.
//!
//! ## Stream ciphers
//!
//! Two directional ciphers are derived from the secret:
//!
//! ```text
//!   key ‖ iv = HMAC-SHA256(secret, [1, index, 0] ‖ handshake_key ‖ [1, 0])
//! ```
//!
//! with index 2 for what the client sends and 3 for what the console sends.
//! Everything is addressed by a key position (byte offset into the stream):
//!
//! - keystream: AES-128-ECB over counter blocks `iv + (key_pos / 16 + 1 + n)`,
//!   starting `key_pos % 16` bytes into the first block
//! - GMAC: AES-GCM with nonce `iv + key_pos / 16`, the data as AAD and an empty
//!   plaintext, truncated to 4 bytes. The GMAC key rotates every 45000 bytes
//!   of key position.
//!
//! Addressing by position rather than by an internal counter keeps decryption
//! of reordered datagrams deterministic. The only mutable state is the local
//! send position and the replay window of accepted remote positions.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::aes::cipher::BlockEncrypt;
use aes_gcm::aes::Aes128;
use aes_gcm::AesGcm;
use bytes::{Bytes, BytesMut};
use hmac::{Hmac, Mac};
use rand::RngExt;
use secp256k1::{ecdh, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{trace, warn};

use crate::packet::{auth_offset, auth_view, stamp_auth, HeaderType, PacketError};

type HmacSha256 = Hmac<Sha256>;
type Gmac128 = AesGcm<Aes128, U16>;

pub const HANDSHAKE_KEY_LEN: usize = 16;
pub const PUBLIC_KEY_LEN: usize = 65;
pub const SIGNATURE_LEN: usize = 32;

const GMAC_REFRESH_IV: u128 = 44910;
const GMAC_REFRESH_KEY_POS: u32 = 45000;

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("handshake rejected: {0}")]
    HandshakeRejected(&'static str),
    #[error("authentication failed at key position {key_pos}")]
    AuthenticationFailed { key_pos: u32 },
    #[error("key position {key_pos} was already accepted")]
    Replayed { key_pos: u32 },
    #[error("invalid key material: {0}")]
    KeyMaterial(&'static str),
    #[error(transparent)]
    Packet(#[from] PacketError),
}

impl CryptoError {
    /// Fatal errors end the session; the rest drop one datagram.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CryptoError::HandshakeRejected(_)
                | CryptoError::AuthenticationFailed { .. }
                | CryptoError::KeyMaterial(_)
        )
    }
}

// ─── Primitives ─────────────────────────────────────────────────────────────

fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 32], CryptoError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|_| CryptoError::KeyMaterial("hmac key"))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

/// Little-endian 128-bit add of `counter` into `iv`.
fn counter_add(counter: u128, iv: &[u8; 16]) -> [u8; 16] {
    u128::from_le_bytes(*iv).wrapping_add(counter).to_le_bytes()
}

fn derive_gmac_key(index: u32, key: &[u8; 16], iv: &[u8; 16]) -> [u8; 16] {
    let ctr = counter_add(index as u128 * GMAC_REFRESH_IV, iv);
    let digest = Sha256::new().chain_update(key).chain_update(ctr).finalize();
    let mut out = [0u8; 16];
    for (i, b) in out.iter_mut().enumerate() {
        *b = digest[i] ^ digest[i + 16];
    }
    out
}

fn gmac_key_index(key_pos: u32) -> u32 {
    if key_pos == 0 {
        0
    } else {
        (key_pos - 1) / GMAC_REFRESH_KEY_POS
    }
}

// ─── Stream Cipher ──────────────────────────────────────────────────────────

/// One direction of the session: keystream plus GMAC keys.
struct StreamCipher {
    aes: Aes128,
    iv: [u8; 16],
    gmac_base: [u8; 16],
    /// Last derived GMAC key, by rotation index.
    gmac_cache: (u32, [u8; 16]),
}

impl StreamCipher {
    fn new(secret: &[u8], handshake_key: &[u8], index: u8) -> Result<Self, CryptoError> {
        let okm = hmac_sha256(secret, &[&[0x01, index, 0x00], handshake_key, &[0x01, 0x00]])?;
        let mut key = [0u8; 16];
        let mut iv = [0u8; 16];
        key.copy_from_slice(&okm[..16]);
        iv.copy_from_slice(&okm[16..]);
        let gmac_base = derive_gmac_key(0, &key, &iv);
        Ok(StreamCipher {
            aes: Aes128::new(GenericArray::from_slice(&key)),
            iv,
            gmac_base,
            gmac_cache: (0, gmac_base),
        })
    }

    fn apply_keystream(&self, data: &mut [u8], key_pos: u32) {
        let skip = (key_pos % 16) as usize;
        let mut counter = (key_pos / 16) as u128 + 1;
        let mut offset = 0usize;
        let mut first = true;
        while offset < data.len() {
            let mut block = GenericArray::from(counter_add(counter, &self.iv));
            self.aes.encrypt_block(&mut block);
            let start = if first { skip } else { 0 };
            first = false;
            for &k in &block[start..] {
                if offset == data.len() {
                    break;
                }
                data[offset] ^= k;
                offset += 1;
            }
            counter += 1;
        }
    }

    fn gmac_key(&mut self, index: u32) -> [u8; 16] {
        if index == 0 {
            return self.gmac_base;
        }
        if self.gmac_cache.0 != index {
            self.gmac_cache = (index, derive_gmac_key(index, &self.gmac_base, &self.iv));
        }
        self.gmac_cache.1
    }

    fn gmac(&mut self, data: &[u8], key_pos: u32) -> Result<u32, CryptoError> {
        let key = self.gmac_key(gmac_key_index(key_pos));
        let nonce = counter_add((key_pos / 16) as u128, &self.iv);
        let gcm = Gmac128::new(GenericArray::from_slice(&key));
        let tag = gcm
            .encrypt_in_place_detached(GenericArray::from_slice(&nonce), data, &mut [])
            .map_err(|_| CryptoError::KeyMaterial("gmac input too long"))?;
        Ok(u32::from_be_bytes([tag[0], tag[1], tag[2], tag[3]]))
    }
}

// ─── ECDH Handshake ─────────────────────────────────────────────────────────

/// Which end of the session this context belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Console,
}

impl Role {
    fn cipher_indices(self) -> (u8, u8) {
        match self {
            Role::Client => (2, 3),
            Role::Console => (3, 2),
        }
    }
}

/// Local ECDH key pair plus the handshake key that signs public keys.
pub struct EcdhKeypair {
    secret: SecretKey,
    public: PublicKey,
    handshake_key: [u8; HANDSHAKE_KEY_LEN],
}

impl EcdhKeypair {
    /// Fresh key pair and fresh handshake key.
    pub fn generate() -> Self {
        let handshake_key = rand::rng().random::<[u8; HANDSHAKE_KEY_LEN]>();
        Self::with_handshake_key(handshake_key)
    }

    /// Fresh key pair bound to a given handshake key (the console side).
    pub fn with_handshake_key(handshake_key: [u8; HANDSHAKE_KEY_LEN]) -> Self {
        let mut rng = rand::rng();
        loop {
            let candidate = rng.random::<[u8; 32]>();
            if let Ok(pair) = Self::from_parts(handshake_key, candidate) {
                return pair;
            }
        }
    }

    pub fn from_parts(
        handshake_key: [u8; HANDSHAKE_KEY_LEN],
        private_key: [u8; 32],
    ) -> Result<Self, CryptoError> {
        let secret = SecretKey::from_slice(&private_key)
            .map_err(|_| CryptoError::KeyMaterial("private key out of range"))?;
        let public = PublicKey::from_secret_key(&Secp256k1::signing_only(), &secret);
        Ok(EcdhKeypair {
            secret,
            public,
            handshake_key,
        })
    }

    pub fn handshake_key(&self) -> &[u8; HANDSHAKE_KEY_LEN] {
        &self.handshake_key
    }

    /// Uncompressed SEC1 point.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public.serialize_uncompressed()
    }

    /// HMAC of the public key under the handshake key.
    pub fn public_sig(&self) -> Result<[u8; SIGNATURE_LEN], CryptoError> {
        hmac_sha256(&self.handshake_key, &[&self.public_key()])
    }
}

impl std::fmt::Debug for EcdhKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EcdhKeypair").finish_non_exhaustive()
    }
}

/// Shared secret and handshake key, the input to both stream ciphers.
pub struct SessionKey {
    secret: [u8; 32],
    handshake_key: [u8; HANDSHAKE_KEY_LEN],
}

/// Check the peer's signature over its public key, then run ECDH.
pub fn derive_session(
    local: &EcdhKeypair,
    peer_pub_key: &[u8],
    peer_sig: &[u8],
) -> Result<SessionKey, CryptoError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(&local.handshake_key)
        .map_err(|_| CryptoError::KeyMaterial("hmac key"))?;
    mac.update(peer_pub_key);
    mac.verify_slice(peer_sig)
        .map_err(|_| CryptoError::HandshakeRejected("peer key signature mismatch"))?;

    let peer = PublicKey::from_slice(peer_pub_key)
        .map_err(|_| CryptoError::HandshakeRejected("peer public key is not a curve point"))?;
    let point = ecdh::shared_secret_point(&peer, &local.secret);
    let mut secret = [0u8; 32];
    secret.copy_from_slice(&point[..32]);
    Ok(SessionKey {
        secret,
        handshake_key: local.handshake_key,
    })
}

// ─── Replay Window ──────────────────────────────────────────────────────────

/// Bounded set of accepted remote key positions. Positions at or below the
/// oldest evicted entry count as replays.
#[derive(Debug)]
struct ReplayWindow {
    seen: BTreeSet<u32>,
    capacity: usize,
    floor: Option<u32>,
}

impl ReplayWindow {
    fn new(capacity: usize) -> Self {
        ReplayWindow {
            seen: BTreeSet::new(),
            capacity: capacity.max(1),
            floor: None,
        }
    }

    fn is_fresh(&self, key_pos: u32) -> bool {
        !self.seen.contains(&key_pos) && !matches!(self.floor, Some(f) if key_pos <= f)
    }

    fn record(&mut self, key_pos: u32) {
        self.seen.insert(key_pos);
        while self.seen.len() > self.capacity {
            if let Some(oldest) = self.seen.pop_first() {
                self.floor = Some(oldest);
            }
        }
    }
}

// ─── Crypto Context ─────────────────────────────────────────────────────────

/// Both directions of an established session.
pub struct CryptoContext {
    local: StreamCipher,
    remote: StreamCipher,
    local_key_pos: u32,
    replay: ReplayWindow,
}

impl std::fmt::Debug for CryptoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoContext")
            .field("local_key_pos", &self.local_key_pos)
            .finish_non_exhaustive()
    }
}

impl CryptoContext {
    pub const DEFAULT_REPLAY_WINDOW: usize = 4096;

    pub fn new(key: &SessionKey, role: Role, replay_window: usize) -> Result<Self, CryptoError> {
        let (local_idx, remote_idx) = role.cipher_indices();
        Ok(CryptoContext {
            local: StreamCipher::new(&key.secret, &key.handshake_key, local_idx)?,
            remote: StreamCipher::new(&key.secret, &key.handshake_key, remote_idx)?,
            local_key_pos: 0,
            replay: ReplayWindow::new(replay_window),
        })
    }

    /// Next outbound key position.
    pub fn key_pos(&self) -> u32 {
        self.local_key_pos
    }

    pub fn advance(&mut self, by: usize) {
        self.local_key_pos = self.local_key_pos.wrapping_add(by as u32);
    }

    // ─── Payload operations ─────────────────────────────────────────────

    /// Encrypt with the local keystream at `key_pos`; the tag covers the
    /// ciphertext.
    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        key_pos: u32,
    ) -> Result<(Bytes, u32), CryptoError> {
        let mut buf = BytesMut::from(plaintext);
        self.local.apply_keystream(&mut buf, key_pos);
        let tag = self.local.gmac(&buf, key_pos)?;
        Ok((buf.freeze(), tag))
    }

    /// Verify and decrypt a remote payload. A bad tag is fatal, a position
    /// seen before is a dropped replay.
    pub fn decrypt(
        &mut self,
        ciphertext: &[u8],
        key_pos: u32,
        tag: u32,
    ) -> Result<Bytes, CryptoError> {
        self.authenticate(ciphertext, key_pos, tag)?;
        let mut buf = BytesMut::from(ciphertext);
        self.remote.apply_keystream(&mut buf, key_pos);
        Ok(buf.freeze())
    }

    /// Local tag over `data` at `key_pos`.
    pub fn sign(&mut self, data: &[u8], key_pos: u32) -> Result<u32, CryptoError> {
        self.local.gmac(data, key_pos)
    }

    /// Check a remote tag and record the position as used.
    pub fn authenticate(&mut self, data: &[u8], key_pos: u32, tag: u32) -> Result<(), CryptoError> {
        if !self.replay.is_fresh(key_pos) {
            return Err(CryptoError::Replayed { key_pos });
        }
        let expected = self.remote.gmac(data, key_pos)?;
        if expected != tag {
            warn!(key_pos, "gmac mismatch");
            return Err(CryptoError::AuthenticationFailed { key_pos });
        }
        self.replay.record(key_pos);
        Ok(())
    }

    // ─── Datagram operations ────────────────────────────────────────────

    /// Protect an encoded datagram in place at the next local key position.
    ///
    /// Bytes from `encrypt_from` onward are encrypted first; the tag then
    /// covers the whole datagram with its auth fields zeroed. The local
    /// position advances by the datagram length. Returns the position used.
    pub fn seal(
        &mut self,
        datagram: &mut BytesMut,
        encrypt_from: Option<usize>,
    ) -> Result<u32, CryptoError> {
        let key_pos = self.local_key_pos;
        if let Some(start) = encrypt_from {
            if start <= datagram.len() {
                self.local.apply_keystream(&mut datagram[start..], key_pos);
            }
        }
        stamp_auth(datagram, 0, 0)?;
        let tag = self.local.gmac(datagram, key_pos)?;
        stamp_auth(datagram, tag, key_pos)?;
        self.advance(datagram.len());
        Ok(key_pos)
    }

    /// Verify a received datagram and decrypt bytes from `decrypt_from` on.
    /// Returns the datagram with its payload in plaintext.
    pub fn open(
        &mut self,
        datagram: &[u8],
        decrypt_from: Option<usize>,
    ) -> Result<Bytes, CryptoError> {
        let header_type = HeaderType::from_first_byte(*datagram.first().unwrap_or(&0xFF))?;
        let off = auth_offset(header_type);
        let view = auth_view(datagram)?;
        let field = |at: usize| {
            u32::from_be_bytes([datagram[at], datagram[at + 1], datagram[at + 2], datagram[at + 3]])
        };
        let (tag, key_pos) = (field(off), field(off + 4));
        self.authenticate(&view, key_pos, tag)?;
        let mut plain = BytesMut::from(datagram);
        if let Some(start) = decrypt_from {
            if start <= plain.len() {
                self.remote.apply_keystream(&mut plain[start..], key_pos);
            }
        }
        trace!(key_pos, len = datagram.len(), "datagram authenticated");
        Ok(plain.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Chunk, ControlPacket};

    fn pair() -> (CryptoContext, CryptoContext) {
        let client_keys = EcdhKeypair::generate();
        let console_keys = EcdhKeypair::with_handshake_key(*client_keys.handshake_key());
        let client_key = derive_session(
            &client_keys,
            &console_keys.public_key(),
            &console_keys.public_sig().unwrap(),
        )
        .unwrap();
        let console_key = derive_session(
            &console_keys,
            &client_keys.public_key(),
            &client_keys.public_sig().unwrap(),
        )
        .unwrap();
        (
            CryptoContext::new(&client_key, Role::Client, 64).unwrap(),
            CryptoContext::new(&console_key, Role::Console, 64).unwrap(),
        )
    }

    // ─── Primitives ─────────────────────────────────────────────────────

    #[test]
    fn counter_add_carries_little_endian() {
        let mut iv = [0u8; 16];
        iv[0] = 0xFF;
        let out = counter_add(1, &iv);
        assert_eq!(out[0], 0x00);
        assert_eq!(out[1], 0x01);

        let max = [0xFF; 16];
        assert_eq!(counter_add(1, &max), [0u8; 16]);
    }

    #[test]
    fn gmac_key_rotates_every_45000_bytes() {
        assert_eq!(gmac_key_index(0), 0);
        assert_eq!(gmac_key_index(1), 0);
        assert_eq!(gmac_key_index(45000), 0);
        assert_eq!(gmac_key_index(45001), 1);
        assert_eq!(gmac_key_index(90001), 2);
    }

    #[test]
    fn keystream_is_position_addressed() {
        let cipher = StreamCipher::new(&[7u8; 32], &[1u8; 16], 2).unwrap();
        let mut whole = [0u8; 64];
        cipher.apply_keystream(&mut whole, 100);

        // Encrypting a suffix at its own position yields the same bytes.
        let mut tail = [0u8; 20];
        cipher.apply_keystream(&mut tail, 130);
        assert_eq!(&tail[..], &whole[30..50]);
    }

    // ─── Handshake ──────────────────────────────────────────────────────

    #[test]
    fn public_key_is_uncompressed() {
        let keys = EcdhKeypair::generate();
        assert_eq!(keys.public_key()[0], 0x04);
        assert_eq!(keys.public_sig().unwrap().len(), SIGNATURE_LEN);
    }

    #[test]
    fn bad_signature_rejected() {
        let client = EcdhKeypair::generate();
        let console = EcdhKeypair::with_handshake_key(*client.handshake_key());
        let mut sig = console.public_sig().unwrap();
        sig[0] ^= 1;
        let err = derive_session(&client, &console.public_key(), &sig).err().unwrap();
        assert!(matches!(err, CryptoError::HandshakeRejected(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn signature_under_other_handshake_key_rejected() {
        let client = EcdhKeypair::generate();
        let console = EcdhKeypair::generate();
        assert!(matches!(
            derive_session(&client, &console.public_key(), &console.public_sig().unwrap()),
            Err(CryptoError::HandshakeRejected(_))
        ));
    }

    // ─── Payload protection ─────────────────────────────────────────────

    #[test]
    fn encrypt_decrypt_across_roles() {
        let (mut client, mut console) = pair();
        let (ct, tag) = console.encrypt(b"frame bytes", 4096).unwrap();
        assert_ne!(&ct[..], b"frame bytes");
        let pt = client.decrypt(&ct, 4096, tag).unwrap();
        assert_eq!(&pt[..], b"frame bytes");
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let (mut client, mut console) = pair();
        let (ct, tag) = console.encrypt(b"payload", 16).unwrap();
        let mut bad = ct.to_vec();
        bad[0] ^= 0x80;
        assert_eq!(
            client.decrypt(&bad, 16, tag),
            Err(CryptoError::AuthenticationFailed { key_pos: 16 })
        );
    }

    #[test]
    fn tampered_tag_fails_authentication() {
        let (mut client, mut console) = pair();
        let (ct, tag) = console.encrypt(b"payload", 16).unwrap();
        let err = client.decrypt(&ct, 16, tag ^ 1).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn same_key_pos_accepted_once() {
        let (mut client, mut console) = pair();
        let (ct, tag) = console.encrypt(b"x", 300).unwrap();
        client.decrypt(&ct, 300, tag).unwrap();
        let err = client.decrypt(&ct, 300, tag).unwrap_err();
        assert_eq!(err, CryptoError::Replayed { key_pos: 300 });
        assert!(!err.is_fatal());
    }

    #[test]
    fn out_of_order_positions_decrypt() {
        let (mut client, mut console) = pair();
        let (a, ta) = console.encrypt(b"first", 0).unwrap();
        let (b, tb) = console.encrypt(b"second", 50_000).unwrap();
        assert_eq!(&client.decrypt(&b, 50_000, tb).unwrap()[..], b"second");
        assert_eq!(&client.decrypt(&a, 0, ta).unwrap()[..], b"first");
    }

    #[test]
    fn replay_window_floor_rejects_evicted_positions() {
        let mut window = ReplayWindow::new(2);
        window.record(10);
        window.record(20);
        window.record(30);
        assert!(!window.is_fresh(10));
        assert!(!window.is_fresh(5));
        assert!(window.is_fresh(15));
        assert!(!window.is_fresh(30));
    }

    // ─── Datagram protection ────────────────────────────────────────────

    #[test]
    fn sealed_control_datagram_opens_on_peer() {
        let (mut client, mut console) = pair();
        let pkt = ControlPacket::new(
            9,
            1,
            Chunk::Data {
                tsn: 1,
                channel: 1,
                data: Bytes::from_static(b"\x08\x05"),
            },
        );
        let mut bytes = pkt.encode();
        let len = bytes.len();
        let used = client.seal(&mut bytes, None).unwrap();
        assert_eq!(used, 0);
        assert_eq!(client.key_pos(), len as u32);

        let opened = console.open(&bytes, None).unwrap();
        let decoded = ControlPacket::decode(opened).unwrap();
        assert_eq!(decoded.chunk, pkt.chunk);
        assert_eq!(decoded.key_pos, 0);
    }

    #[test]
    fn sealed_datagram_with_flipped_byte_is_rejected() {
        let (mut client, mut console) = pair();
        client.advance(1000);
        let mut bytes = ControlPacket::new(9, 0, Chunk::data_ack(4)).encode();
        client.seal(&mut bytes, None).unwrap();
        bytes[20] ^= 0x01;
        assert_eq!(
            console.open(&bytes, None),
            Err(CryptoError::AuthenticationFailed { key_pos: 1000 })
        );
    }
}
