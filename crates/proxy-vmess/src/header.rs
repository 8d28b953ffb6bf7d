//! Sealed request header and response head.

use bytes::{Buf as _, BytesMut};
use proxy_types::{codec as addr_codec, DestAddr};
use rand::Rng as _;
use sha2::{Digest as _, Sha256};

use crate::crypto::{
    cmd_key, fnv1a, generate_auth_id, kdf12, kdf16, BodyAead, AEAD_OVERHEAD, LABEL_HEADER_IV, LABEL_HEADER_KEY,
    LABEL_HEADER_LEN_IV, LABEL_HEADER_LEN_KEY, LABEL_RESP_IV, LABEL_RESP_KEY, LABEL_RESP_LEN_IV, LABEL_RESP_LEN_KEY,
};
use crate::{Error, Options, Security};

const VERSION: u8 = 1;
const COMMAND_TCP: u8 = 0x01;
const INSTRUCTION_DYNAMIC_PORT: u8 = 0x01;

/// Everything derived for one connection: the command key from the user
/// identity, fresh body key/IV, and their response-side counterparts
/// (SHA-256 truncations, per the AEAD response format).
pub(crate) struct SessionKeys {
    pub(crate) cmd_key: [u8; 16],
    pub(crate) request_key: [u8; 16],
    pub(crate) request_iv: [u8; 16],
    pub(crate) response_key: [u8; 16],
    pub(crate) response_iv: [u8; 16],
    pub(crate) response_auth: u8,
}

impl SessionKeys {
    pub(crate) fn generate(user_id: &uuid::Uuid) -> Self {
        let mut rng = rand::thread_rng();

        let request_key: [u8; 16] = rng.gen();
        let request_iv: [u8; 16] = rng.gen();

        Self::assemble(user_id, request_key, request_iv, rng.gen())
    }

    pub(crate) fn assemble(user_id: &uuid::Uuid, request_key: [u8; 16], request_iv: [u8; 16], auth: u8) -> Self {
        let response_key: [u8; 16] = Sha256::digest(request_key)[..16].try_into().expect("slice length");
        let response_iv: [u8; 16] = Sha256::digest(request_iv)[..16].try_into().expect("slice length");

        Self {
            cmd_key: cmd_key(user_id),
            request_key,
            request_iv,
            response_key,
            response_iv,
            response_auth: auth,
        }
    }
}

/// Builds and seals the request header:
/// `auth_id(16) ‖ sealed_len(2+16) ‖ nonce(8) ‖ sealed_header`.
pub(crate) fn seal_request(
    keys: &SessionKeys,
    dest: &DestAddr,
    security: Security,
    options: Options,
    out: &mut Vec<u8>,
) -> Result<(), Error> {
    let mut rng = rand::thread_rng();

    // Zero security means no body framing; the chunk options make no
    // sense then and are cleared from the wire.
    let options = match security {
        Security::Zero => options & !(Options::CHUNK_STREAM | Options::CHUNK_MASKING | Options::GLOBAL_PADDING),
        _ => options,
    };

    let padding_len: u8 = rng.gen_range(0..16);

    let mut header = Vec::with_capacity(64);
    header.push(VERSION);
    header.extend_from_slice(&keys.request_iv);
    header.extend_from_slice(&keys.request_key);
    header.push(keys.response_auth);
    header.push(options.bits());
    header.push(padding_len << 4 | security.wire_code());
    header.push(0x00); // reserved
    header.push(COMMAND_TCP);
    header.extend_from_slice(&dest.port().to_be_bytes());
    addr_codec::encode_host(dest, &mut header).map_err(|_| Error::BadAddress)?;
    for _ in 0..padding_len {
        header.push(rng.gen());
    }
    let checksum = fnv1a(&header);
    header.extend_from_slice(&checksum.to_be_bytes());

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    let auth_id = generate_auth_id(&keys.cmd_key, timestamp, rng.gen());
    let connection_nonce: [u8; 8] = rng.gen();

    let len_key = kdf16(&keys.cmd_key, &[LABEL_HEADER_LEN_KEY, &auth_id, &connection_nonce]);
    let len_iv = kdf12(&keys.cmd_key, &[LABEL_HEADER_LEN_IV, &auth_id, &connection_nonce]);
    let header_len = u16::try_from(header.len()).map_err(|_| Error::BadAddress)?;
    let sealed_len = BodyAead::aes128(&len_key).seal(&len_iv, &header_len.to_be_bytes(), &auth_id);

    let header_key = kdf16(&keys.cmd_key, &[LABEL_HEADER_KEY, &auth_id, &connection_nonce]);
    let header_iv = kdf12(&keys.cmd_key, &[LABEL_HEADER_IV, &auth_id, &connection_nonce]);
    let sealed_header = BodyAead::aes128(&header_key).seal(&header_iv, &header, &auth_id);

    out.extend_from_slice(&auth_id);
    out.extend_from_slice(&sealed_len);
    out.extend_from_slice(&connection_nonce);
    out.extend_from_slice(&sealed_header);

    Ok(())
}

/// Parsed response head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub options: u8,
    pub instruction: Option<DynamicPort>,
}

/// DynamicPort instruction: the server offers an alternative port plus a
/// temporary identity to use on it. The alter-ID count is carried by the
/// wire format and parsed, but nothing consumes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicPort {
    pub host: String,
    pub port: u16,
    pub user_id: uuid::Uuid,
    pub alter_ids: u16,
    pub level: u8,
    pub valid_minutes: u8,
}

enum ResponseState {
    Length,
    Header { len: usize },
}

/// Decoder for the sealed response head. Missing bytes in either sealed
/// part report need-more; a short read *inside* the opened plaintext is a
/// protocol error.
pub struct ResponseDecoder {
    len_aead: BodyAead,
    len_iv: [u8; 12],
    header_aead: BodyAead,
    header_iv: [u8; 12],
    expected_auth: u8,
    state: ResponseState,
}

impl ResponseDecoder {
    pub(crate) fn new(keys: &SessionKeys) -> Self {
        let len_key = kdf16(&keys.response_key, &[LABEL_RESP_LEN_KEY]);
        let len_iv = kdf12(&keys.response_iv, &[LABEL_RESP_LEN_IV]);
        let header_key = kdf16(&keys.response_key, &[LABEL_RESP_KEY]);
        let header_iv = kdf12(&keys.response_iv, &[LABEL_RESP_IV]);

        Self {
            len_aead: BodyAead::aes128(&len_key),
            len_iv,
            header_aead: BodyAead::aes128(&header_key),
            header_iv,
            expected_auth: keys.response_auth,
            state: ResponseState::Length,
        }
    }

    /// Consumes the response head off the front of `buf` once complete.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<ResponseHead>, Error> {
        loop {
            match self.state {
                ResponseState::Length => {
                    if buf.len() < 2 + AEAD_OVERHEAD {
                        return Ok(None);
                    }

                    let opened = self.len_aead.open(&self.len_iv, &buf[..2 + AEAD_OVERHEAD], &[])?;
                    buf.advance(2 + AEAD_OVERHEAD);

                    let len = usize::from(u16::from_be_bytes([opened[0], opened[1]]));
                    self.state = ResponseState::Header { len };
                }
                ResponseState::Header { len } => {
                    if buf.len() < len + AEAD_OVERHEAD {
                        return Ok(None);
                    }

                    let opened = self.header_aead.open(&self.header_iv, &buf[..len + AEAD_OVERHEAD], &[])?;
                    buf.advance(len + AEAD_OVERHEAD);

                    return parse_head(&opened, self.expected_auth).map(Some);
                }
            }
        }
    }
}

fn parse_head(head: &[u8], expected_auth: u8) -> Result<ResponseHead, Error> {
    let fixed: [u8; 4] = head
        .get(..4)
        .ok_or(Error::TruncatedHeader)?
        .try_into()
        .expect("slice length");
    let [auth, options, instruction_code, instruction_len] = fixed;

    if auth != expected_auth {
        return Err(Error::AuthMismatch);
    }

    let content = head
        .get(4..4 + usize::from(instruction_len))
        .ok_or(Error::TruncatedHeader)?;

    let instruction = match instruction_code {
        0 => None,
        INSTRUCTION_DYNAMIC_PORT => Some(parse_dynamic_port(content)?),
        unknown => return Err(Error::UnknownInstruction(unknown)),
    };

    Ok(ResponseHead { options, instruction })
}

fn parse_dynamic_port(content: &[u8]) -> Result<DynamicPort, Error> {
    let checksum = content.get(..4).ok_or(Error::TruncatedHeader)?;
    let rest = &content[4..];

    if u32::from_be_bytes(checksum.try_into().expect("slice length")) != fnv1a(rest) {
        return Err(Error::BadChecksum);
    }

    let host_len = usize::from(*rest.first().ok_or(Error::TruncatedHeader)?);
    let rest = rest.get(1..).ok_or(Error::TruncatedHeader)?;
    let host = rest.get(..host_len).ok_or(Error::TruncatedHeader)?;
    let host = core::str::from_utf8(host).map_err(|_| Error::TruncatedHeader)?.to_owned();
    let rest = &rest[host_len..];

    // port(2) ‖ uuid(16) ‖ alter_ids(2) ‖ level(1) ‖ valid_minutes(1)
    if rest.len() < 22 {
        return Err(Error::TruncatedHeader);
    }

    Ok(DynamicPort {
        host,
        port: u16::from_be_bytes([rest[0], rest[1]]),
        user_id: uuid::Uuid::from_slice(&rest[2..18]).expect("slice length"),
        alter_ids: u16::from_be_bytes([rest[18], rest[19]]),
        level: rest[20],
        valid_minutes: rest[21],
    })
}
