//! Body frame codec, one instance per direction.
//!
//! Frame layout: `length_field ‖ sealed_payload ‖ padding`. The length
//! value counts the sealed payload plus the padding. Padding length and
//! the length mask both come from the direction's SHAKE128 stream, in
//! that order, one draw each per frame. AEAD nonces are
//! `BE16(frame_offset) ‖ iv[2..12]` with a strictly monotonic offset.

use bytes::{Buf as _, BufMut as _, BytesMut};
use rand::RngCore as _;

use crate::crypto::{chacha_body_key, kdf16, BodyAead, MaskReader, AEAD_OVERHEAD, LABEL_AUTH_LEN};
use crate::{Error, Options, Security};

/// Upper bound on a whole frame; length field, tag, padding and
/// payload all fit inside it.
const MAX_FRAME_LEN: usize = 2048;
const MAX_PADDING: usize = 64;

struct SealedLength {
    aead: BodyAead,
    count: u16,
}

fn body_aead(security: Security, key: &[u8; 16]) -> Option<BodyAead> {
    match security {
        Security::Aes128Gcm => Some(BodyAead::aes128(key)),
        Security::ChaCha20Poly1305 => Some(BodyAead::chacha(&chacha_body_key(key))),
        Security::None | Security::Zero => None,
    }
}

fn frame_nonce(count: u16, iv: &[u8; 16]) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..2].copy_from_slice(&count.to_be_bytes());
    nonce[2..].copy_from_slice(&iv[2..12]);
    nonce
}

/// Shared per-direction framing state.
struct Framing {
    security: Security,
    options: Options,
    aead: Option<BodyAead>,
    iv: [u8; 16],
    count: u16,
    mask: Option<MaskReader>,
    sealed_length: Option<SealedLength>,
}

impl Framing {
    /// `request_key` keys the authenticated-length AEAD for *both*
    /// directions; `key`/`iv` are the direction's own body key and IV.
    fn new(security: Security, options: Options, key: &[u8; 16], iv: &[u8; 16], request_key: &[u8; 16]) -> Self {
        let needs_mask = options.intersects(Options::CHUNK_MASKING | Options::GLOBAL_PADDING);

        let sealed_length = options.contains(Options::AUTHENTICATED_LENGTH).then(|| SealedLength {
            aead: BodyAead::aes128(&kdf16(request_key, &[LABEL_AUTH_LEN])),
            count: 0,
        });

        Self {
            security,
            options,
            aead: body_aead(security, key),
            iv: *iv,
            count: 0,
            mask: needs_mask.then(|| MaskReader::new(iv)),
            sealed_length,
        }
    }

    fn aead_overhead(&self) -> usize {
        if self.aead.is_some() {
            AEAD_OVERHEAD
        } else {
            0
        }
    }

    fn length_field_size(&self) -> usize {
        if self.sealed_length.is_some() {
            2 + AEAD_OVERHEAD
        } else {
            2
        }
    }

    fn max_padding(&self) -> usize {
        if self.options.contains(Options::GLOBAL_PADDING) {
            MAX_PADDING
        } else {
            0
        }
    }

    /// Biggest payload that keeps a whole frame under the cap.
    fn max_payload(&self) -> usize {
        MAX_FRAME_LEN - self.aead_overhead() - self.length_field_size() - self.max_padding()
    }

    fn next_padding(&mut self) -> usize {
        if self.options.contains(Options::GLOBAL_PADDING) {
            let mask = self.mask.as_mut().expect("mask stream exists when padding is on");
            usize::from(mask.next_u16() % MAX_PADDING as u16)
        } else {
            0
        }
    }
}

/// Encoder half.
pub struct FrameEncoder {
    framing: Framing,
}

impl FrameEncoder {
    pub(crate) fn new(
        security: Security,
        options: Options,
        key: &[u8; 16],
        iv: &[u8; 16],
        request_key: &[u8; 16],
    ) -> Self {
        Self {
            framing: Framing::new(security, options, key, iv, request_key),
        }
    }

    /// Frames `payload` into `out`, splitting at the chunk cap.
    pub fn encode(&mut self, payload: &[u8], out: &mut BytesMut) {
        if matches!(self.framing.security, Security::Zero) {
            out.put_slice(payload);
            return;
        }

        for chunk in payload.chunks(self.framing.max_payload()) {
            self.encode_frame(chunk, out);
        }
    }

    /// Empty-payload sentinel marking end of stream (chunk-stream mode).
    pub fn encode_end(&mut self, out: &mut BytesMut) {
        if matches!(self.framing.security, Security::Zero) {
            return;
        }
        if self.framing.options.contains(Options::CHUNK_STREAM) {
            self.encode_frame(&[], out);
        }
    }

    fn encode_frame(&mut self, chunk: &[u8], out: &mut BytesMut) {
        debug_assert!(chunk.len() <= self.framing.max_payload());

        // Draw order matters: padding first, then the length mask.
        let padding = self.framing.next_padding();

        let sealed = match &self.framing.aead {
            Some(aead) => aead.seal(&frame_nonce(self.framing.count, &self.framing.iv), chunk, &[]),
            None => chunk.to_vec(),
        };

        let frame_len = sealed.len() + padding;
        let frame_len_u16 = u16::try_from(frame_len).expect("frame length fits the cap");

        match &mut self.framing.sealed_length {
            Some(sealed_length) => {
                // Wire value excludes the length AEAD's own tag; wrapping
                // mirrors the modular u16 arithmetic of the format.
                let value = frame_len_u16.wrapping_sub(u16::try_from(AEAD_OVERHEAD).expect("constant"));
                let nonce = frame_nonce(sealed_length.count, &self.framing.iv);
                out.put_slice(&sealed_length.aead.seal(&nonce, &value.to_be_bytes(), &[]));
                sealed_length.count = sealed_length.count.wrapping_add(1);
            }
            None if self.framing.options.contains(Options::CHUNK_MASKING) => {
                let mask = self
                    .framing
                    .mask
                    .as_mut()
                    .expect("mask stream exists when masking is on");
                out.put_u16(frame_len_u16 ^ mask.next_u16());
            }
            None => out.put_u16(frame_len_u16),
        }

        out.put_slice(&sealed);

        if padding > 0 {
            let start = out.len();
            out.resize(start + padding, 0);
            rand::thread_rng().fill_bytes(&mut out[start..]);
        }

        self.framing.count = self.framing.count.wrapping_add(1);
    }
}

enum DecodeState {
    Length,
    Payload { frame_len: usize, padding: usize },
}

/// Decoder half. Restartable: SHAKE draws happen exactly once per frame
/// even when the input arrives one byte at a time.
pub struct FrameDecoder {
    framing: Framing,
    state: DecodeState,
    pending_padding: Option<usize>,
}

impl FrameDecoder {
    pub(crate) fn new(
        security: Security,
        options: Options,
        key: &[u8; 16],
        iv: &[u8; 16],
        request_key: &[u8; 16],
    ) -> Self {
        Self {
            framing: Framing::new(security, options, key, iv, request_key),
            state: DecodeState::Length,
            pending_padding: None,
        }
    }

    /// Returns the next frame's payload, or `None` when more bytes are
    /// needed. An empty payload is the end-of-stream sentinel.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Vec<u8>>, Error> {
        if matches!(self.framing.security, Security::Zero) {
            if buf.is_empty() {
                return Ok(None);
            }
            let everything = buf.split_to(buf.len());
            return Ok(Some(everything.to_vec()));
        }

        loop {
            match self.state {
                DecodeState::Length => {
                    // One padding draw per frame, before the mask draw.
                    let padding = match self.pending_padding {
                        Some(padding) => padding,
                        None => {
                            let padding = self.framing.next_padding();
                            self.pending_padding = Some(padding);
                            padding
                        }
                    };

                    let field_size = self.framing.length_field_size();
                    if buf.len() < field_size {
                        return Ok(None);
                    }

                    let frame_len = match &mut self.framing.sealed_length {
                        Some(sealed_length) => {
                            let nonce = frame_nonce(sealed_length.count, &self.framing.iv);
                            let opened = sealed_length.aead.open(&nonce, &buf[..field_size], &[])?;
                            sealed_length.count = sealed_length.count.wrapping_add(1);
                            let value = u16::from_be_bytes([opened[0], opened[1]]);
                            usize::from(value.wrapping_add(u16::try_from(AEAD_OVERHEAD).expect("constant")))
                        }
                        None => {
                            let raw = u16::from_be_bytes([buf[0], buf[1]]);
                            if self.framing.options.contains(Options::CHUNK_MASKING) {
                                let mask = self
                                    .framing
                                    .mask
                                    .as_mut()
                                    .expect("mask stream exists when masking is on");
                                usize::from(raw ^ mask.next_u16())
                            } else {
                                usize::from(raw)
                            }
                        }
                    };
                    buf.advance(field_size);
                    self.pending_padding = None;

                    if frame_len < padding + self.framing.aead_overhead() {
                        return Err(Error::BadFrameLength);
                    }

                    self.state = DecodeState::Payload { frame_len, padding };
                }
                DecodeState::Payload { frame_len, padding } => {
                    if buf.len() < frame_len {
                        return Ok(None);
                    }

                    let sealed_len = frame_len - padding;
                    let payload = match &self.framing.aead {
                        Some(aead) => {
                            aead.open(&frame_nonce(self.framing.count, &self.framing.iv), &buf[..sealed_len], &[])?
                        }
                        None => buf[..sealed_len].to_vec(),
                    };
                    buf.advance(frame_len);

                    self.framing.count = self.framing.count.wrapping_add(1);
                    self.state = DecodeState::Length;
                    return Ok(Some(payload));
                }
            }
        }
    }
}
