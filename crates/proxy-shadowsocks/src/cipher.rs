//! Cipher table, key derivation and the per-direction AEAD state.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use md5::{Digest as _, Md5};
use sha1::Sha1;

use crate::Error;

pub(crate) const TAG_LEN: usize = 16;
pub(crate) const NONCE_LEN: usize = 12;

const SUBKEY_INFO: &[u8] = b"ss-subkey";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl CipherKind {
    pub fn key_len(self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes256Gcm | CipherKind::ChaCha20Poly1305 => 32,
        }
    }

    /// The salt is always as long as the key.
    pub fn salt_len(self) -> usize {
        self.key_len()
    }
}

impl std::str::FromStr for CipherKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.to_ascii_lowercase().as_str() {
            "aes-128-gcm" => Ok(CipherKind::Aes128Gcm),
            "aes-256-gcm" => Ok(CipherKind::Aes256Gcm),
            "chacha20-poly1305" | "chacha20-ietf-poly1305" => Ok(CipherKind::ChaCha20Poly1305),
            other => Err(Error::UnsupportedCipher(other.to_owned())),
        }
    }
}

/// EVP_BytesToKey-compatible MD5 cascade, as used by every Shadowsocks
/// implementation to turn the user password into the master key.
pub(crate) fn derive_master_key(password: &str, key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len);
    let mut previous: Vec<u8> = Vec::new();

    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&previous);
        hasher.update(password.as_bytes());
        previous = hasher.finalize().to_vec();
        key.extend_from_slice(&previous);
    }

    key.truncate(key_len);
    key
}

/// Per-session subkey: `HKDF-SHA1(master, salt, "ss-subkey")`.
pub(crate) fn derive_session_key(master_key: &[u8], salt: &[u8]) -> Vec<u8> {
    let hk = Hkdf::<Sha1>::new(Some(salt), master_key);
    let mut subkey = vec![0u8; master_key.len()];
    hk.expand(SUBKEY_INFO, &mut subkey)
        .expect("subkey length is a valid HKDF-SHA1 output length");
    subkey
}

/// Adds one to a little-endian multi-byte counter, carrying through each
/// byte. Matches libsodium's `sodium_increment` byte-for-byte.
pub(crate) fn increment_nonce(nonce: &mut [u8]) {
    let mut carry = 1u16;
    for byte in nonce.iter_mut() {
        carry += u16::from(*byte);
        *byte = (carry & 0xff) as u8;
        carry >>= 8;
    }
}

enum AeadImpl {
    Aes128(Box<Aes128Gcm>),
    Aes256(Box<Aes256Gcm>),
    ChaCha(Box<ChaCha20Poly1305>),
}

/// One direction's AEAD state: the session cipher plus the little-endian
/// nonce counter, incremented after every seal/open.
pub(crate) struct DirectionState {
    aead: AeadImpl,
    nonce: [u8; NONCE_LEN],
}

impl DirectionState {
    pub(crate) fn new(kind: CipherKind, session_key: &[u8]) -> Self {
        debug_assert_eq!(session_key.len(), kind.key_len());

        let aead = match kind {
            CipherKind::Aes128Gcm => {
                AeadImpl::Aes128(Box::new(Aes128Gcm::new_from_slice(session_key).expect("session key length")))
            }
            CipherKind::Aes256Gcm => {
                AeadImpl::Aes256(Box::new(Aes256Gcm::new_from_slice(session_key).expect("session key length")))
            }
            CipherKind::ChaCha20Poly1305 => {
                AeadImpl::ChaCha(Box::new(ChaCha20Poly1305::new_from_slice(session_key).expect("session key length")))
            }
        };

        Self {
            aead,
            nonce: [0u8; NONCE_LEN],
        }
    }

    pub(crate) fn seal(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let payload = Payload::from(plaintext);
        let nonce = self.nonce.into();

        let sealed = match &self.aead {
            AeadImpl::Aes128(aead) => aead.encrypt(&nonce, payload),
            AeadImpl::Aes256(aead) => aead.encrypt(&nonce, payload),
            AeadImpl::ChaCha(aead) => aead.encrypt(&nonce, payload),
        }
        .expect("sealing can not fail for in-memory buffers");

        increment_nonce(&mut self.nonce);
        sealed
    }

    pub(crate) fn open(&mut self, sealed: &[u8]) -> Result<Vec<u8>, Error> {
        let payload = Payload::from(sealed);
        let nonce = self.nonce.into();

        let opened = match &self.aead {
            AeadImpl::Aes128(aead) => aead.decrypt(&nonce, payload),
            AeadImpl::Aes256(aead) => aead.decrypt(&nonce, payload),
            AeadImpl::ChaCha(aead) => aead.decrypt(&nonce, payload),
        }
        .map_err(|_| Error::BadTag)?;

        increment_nonce(&mut self.nonce);
        Ok(opened)
    }
}
