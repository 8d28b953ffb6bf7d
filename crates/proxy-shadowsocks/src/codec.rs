//! Sans-io encryptor/decryptor pair.
//!
//! Both sides are synchronous state machines over byte buffers; the
//! async stream wrapper drives them from `poll_read`/`poll_write`.

use bytes::{Buf as _, BufMut as _, BytesMut};
use proxy_types::{codec as addr_codec, DestAddr};
use rand::RngCore as _;

use crate::cipher::{derive_master_key, derive_session_key, DirectionState, TAG_LEN};
use crate::{CipherKind, Error};

/// Payload bytes per frame; the two high bits of the length field are
/// reserved and must be zero.
pub const MAX_CHUNK_LEN: usize = 0x3FFF;

/// Outbound half: salt and sealed address frame first, sealed payload
/// frames afterwards.
pub struct Encryptor {
    kind: CipherKind,
    master_key: Vec<u8>,
    header: Option<Vec<u8>>,
    state: Option<DirectionState>,
}

impl Encryptor {
    /// Client-side encryptor: the first frame carries the destination
    /// address, per the Shadowsocks TCP request format.
    pub fn client(kind: CipherKind, password: &str, dest: &DestAddr) -> Result<Self, Error> {
        let mut header = Vec::with_capacity(addr_codec::encoded_len(dest));
        addr_codec::encode(dest, &mut header).map_err(|_| Error::BadAddress)?;

        Ok(Self {
            kind,
            master_key: derive_master_key(password, kind.key_len()),
            header: Some(header),
            state: None,
        })
    }

    /// Raw encryptor without a leading address frame (the server-to-client
    /// direction of the protocol).
    pub fn raw(kind: CipherKind, password: &str) -> Self {
        Self {
            kind,
            master_key: derive_master_key(password, kind.key_len()),
            header: None,
            state: None,
        }
    }

    /// Seals `plaintext` into `out`, splitting at the frame cap. The very
    /// first call also emits the salt (and the address frame for client
    /// encryptors).
    pub fn encrypt(&mut self, plaintext: &[u8], out: &mut BytesMut) {
        let kind = self.kind;
        let master_key = &self.master_key;

        let state = self.state.get_or_insert_with(|| {
            let mut salt = vec![0u8; kind.salt_len()];
            rand::thread_rng().fill_bytes(&mut salt);
            out.put_slice(&salt);

            let session_key = derive_session_key(master_key, &salt);
            DirectionState::new(kind, &session_key)
        });

        if let Some(header) = self.header.take() {
            seal_frame(state, &header, out);
        }

        for chunk in plaintext.chunks(MAX_CHUNK_LEN) {
            seal_frame(state, chunk, out);
        }
    }
}

fn seal_frame(state: &mut DirectionState, chunk: &[u8], out: &mut BytesMut) {
    debug_assert!(chunk.len() <= MAX_CHUNK_LEN);

    let length = (chunk.len() as u16).to_be_bytes();
    out.put_slice(&state.seal(&length));
    out.put_slice(&state.seal(chunk));
}

enum DecryptState {
    Salt,
    Length,
    Payload { len: usize },
}

/// Inbound half. Explicit state machine so a frame is never half-opened:
/// the nonce only advances when the corresponding sealed piece is fully
/// buffered, which makes "need more bytes" trivially restartable.
pub struct Decryptor {
    kind: CipherKind,
    master_key: Vec<u8>,
    state: DecryptState,
    opener: Option<DirectionState>,
}

impl Decryptor {
    pub fn new(kind: CipherKind, password: &str) -> Self {
        Self {
            kind,
            master_key: derive_master_key(password, kind.key_len()),
            state: DecryptState::Salt,
            opener: None,
        }
    }

    /// Consumes as much of `buf` as forms a complete frame and returns the
    /// recovered payload, or `None` when more bytes are needed.
    pub fn decrypt(&mut self, buf: &mut BytesMut) -> Result<Option<Vec<u8>>, Error> {
        loop {
            match self.state {
                DecryptState::Salt => {
                    let salt_len = self.kind.salt_len();
                    if buf.len() < salt_len {
                        return Ok(None);
                    }

                    let salt = buf.split_to(salt_len);
                    let session_key = derive_session_key(&self.master_key, &salt);
                    self.opener = Some(DirectionState::new(self.kind, &session_key));
                    self.state = DecryptState::Length;
                }
                DecryptState::Length => {
                    if buf.len() < 2 + TAG_LEN {
                        return Ok(None);
                    }

                    let opener = self.opener.as_mut().expect("opener exists after salt state");
                    let length = opener.open(&buf[..2 + TAG_LEN])?;
                    buf.advance(2 + TAG_LEN);

                    let raw = u16::from_be_bytes([length[0], length[1]]);
                    if usize::from(raw) > MAX_CHUNK_LEN {
                        return Err(Error::ReservedLengthBits);
                    }

                    self.state = DecryptState::Payload { len: usize::from(raw) };
                }
                DecryptState::Payload { len } => {
                    if buf.len() < len + TAG_LEN {
                        return Ok(None);
                    }

                    let opener = self.opener.as_mut().expect("opener exists after salt state");
                    let payload = opener.open(&buf[..len + TAG_LEN])?;
                    buf.advance(len + TAG_LEN);

                    self.state = DecryptState::Length;
                    return Ok(Some(payload));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use proxy_types::ToDestAddr as _;

    use super::*;

    const PASSWORD: &str = "BeMWIH2K5YtZ";

    fn decrypt_all(decryptor: &mut Decryptor, buf: &mut BytesMut) -> Vec<Vec<u8>> {
        let mut chunks = Vec::new();
        while let Some(chunk) = decryptor.decrypt(buf).unwrap() {
            chunks.push(chunk);
        }
        chunks
    }

    #[test]
    fn client_request_layout() {
        let dest = "192.168.1.1:80".to_dest_addr().unwrap();
        let mut encryptor = Encryptor::client(CipherKind::Aes128Gcm, PASSWORD, &dest).unwrap();

        let mut wire = BytesMut::new();
        encryptor.encrypt(&[1, 2], &mut wire);

        // salt, then sealed length + sealed address (7 bytes), then the
        // sealed payload frame.
        let salt_len = CipherKind::Aes128Gcm.salt_len();
        assert_eq!(wire.len(), salt_len + (2 + 16) + (7 + 16) + (2 + 16) + (2 + 16));

        let mut decryptor = Decryptor::new(CipherKind::Aes128Gcm, PASSWORD);
        let chunks = decrypt_all(&mut decryptor, &mut wire);
        assert_eq!(chunks.len(), 2);

        let (addr, consumed) = addr_codec::decode(&chunks[0]).unwrap().unwrap();
        assert_eq!(addr, dest);
        assert_eq!(consumed, chunks[0].len());
        assert_eq!(chunks[1], vec![1, 2]);
        assert!(wire.is_empty());
    }

    #[test]
    fn sequential_writes_round_trip() {
        let dest = "192.168.1.1:80".to_dest_addr().unwrap();
        let mut encryptor = Encryptor::client(CipherKind::Aes128Gcm, PASSWORD, &dest).unwrap();
        let mut decryptor = Decryptor::new(CipherKind::Aes128Gcm, PASSWORD);

        let mut wire = BytesMut::new();
        for write in [&[1u8, 2][..], &[3, 4], &[5]] {
            encryptor.encrypt(write, &mut wire);
        }

        let chunks = decrypt_all(&mut decryptor, &mut wire);
        let mut chunks = chunks.into_iter();
        let _addr = chunks.next().expect("address frame");
        assert_eq!(chunks.collect::<Vec<_>>(), vec![vec![1, 2], vec![3, 4], vec![5]]);
    }

    #[test]
    fn decoder_is_restartable_at_any_cut() {
        let dest = "swift.org:443".to_dest_addr().unwrap();
        let mut encryptor = Encryptor::client(CipherKind::ChaCha20Poly1305, PASSWORD, &dest).unwrap();

        let mut wire = BytesMut::new();
        encryptor.encrypt(b"hello world", &mut wire);
        let wire = wire.freeze();

        let mut decryptor = Decryptor::new(CipherKind::ChaCha20Poly1305, PASSWORD);
        let mut staging = BytesMut::new();
        let mut recovered: Vec<Vec<u8>> = Vec::new();

        // Feed one byte at a time; every intermediate state must report
        // need-more instead of failing.
        for byte in wire.iter() {
            staging.put_u8(*byte);
            while let Some(chunk) = decryptor.decrypt(&mut staging).unwrap() {
                recovered.push(chunk);
            }
        }

        assert_eq!(recovered.len(), 2);
        assert_eq!(recovered[1], b"hello world");
    }

    #[test]
    fn oversized_payload_is_split_at_the_cap() {
        let payload = vec![0xA5u8; MAX_CHUNK_LEN + 17];
        let mut encryptor = Encryptor::raw(CipherKind::Aes256Gcm, PASSWORD);
        let mut decryptor = Decryptor::new(CipherKind::Aes256Gcm, PASSWORD);

        let mut wire = BytesMut::new();
        encryptor.encrypt(&payload, &mut wire);

        let chunks = decrypt_all(&mut decryptor, &mut wire);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), MAX_CHUNK_LEN);
        assert_eq!(chunks[1].len(), 17);
        assert_eq!(chunks.concat(), payload);
    }

    #[test]
    fn corrupted_frame_is_fatal() {
        let mut encryptor = Encryptor::raw(CipherKind::Aes128Gcm, PASSWORD);
        let mut decryptor = Decryptor::new(CipherKind::Aes128Gcm, PASSWORD);

        let mut wire = BytesMut::new();
        encryptor.encrypt(b"data", &mut wire);

        let last = wire.len() - 1;
        wire[last] ^= 0xFF;

        assert_eq!(decryptor.decrypt(&mut wire), Err(Error::BadTag));
    }

    #[test]
    fn wrong_password_fails_on_first_frame() {
        let mut encryptor = Encryptor::raw(CipherKind::Aes128Gcm, PASSWORD);
        let mut decryptor = Decryptor::new(CipherKind::Aes128Gcm, "not-the-password");

        let mut wire = BytesMut::new();
        encryptor.encrypt(b"data", &mut wire);

        assert_eq!(decryptor.decrypt(&mut wire), Err(Error::BadTag));
    }

    proptest! {
        #[test]
        fn round_trip_all_ciphers(
            payload in proxy_generators::payload(),
            kind in prop_oneof![
                Just(CipherKind::Aes128Gcm),
                Just(CipherKind::Aes256Gcm),
                Just(CipherKind::ChaCha20Poly1305),
            ],
        ) {
            let mut encryptor = Encryptor::raw(kind, PASSWORD);
            let mut decryptor = Decryptor::new(kind, PASSWORD);

            let mut wire = BytesMut::new();
            encryptor.encrypt(&payload, &mut wire);

            let mut recovered = Vec::new();
            while let Some(chunk) = decryptor.decrypt(&mut wire).unwrap() {
                recovered.extend_from_slice(&chunk);
            }

            prop_assert_eq!(recovered, payload);
            prop_assert!(wire.is_empty());
        }
    }
}
