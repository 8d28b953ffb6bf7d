//! VMESS AEAD client implementation.
//!
//! The request starts with a sealed header (authenticated by the auth ID
//! derived from the command key); both body directions are framed into
//! chunks of at most 2 kiB, with optional SHAKE128 length masking,
//! SHAKE128-driven padding and a sealed ("authenticated") length field.
//! The response begins with a small sealed head echoing the auth code the
//! client picked in its request.

mod codec;
mod crypto;
mod header;
mod stream;

pub use codec::{FrameDecoder, FrameEncoder};
pub use header::{DynamicPort, ResponseDecoder, ResponseHead};
pub use stream::VmessStream;

use core::fmt;

bitflags::bitflags! {
    /// Request option bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Options: u8 {
        const CHUNK_STREAM = 0x01;
        const CONNECTION_REUSE = 0x02;
        const CHUNK_MASKING = 0x04;
        const GLOBAL_PADDING = 0x08;
        const AUTHENTICATED_LENGTH = 0x10;
    }
}

impl Default for Options {
    /// The options a well-behaved modern client sends.
    fn default() -> Self {
        Options::CHUNK_STREAM | Options::CHUNK_MASKING
    }
}

/// Body security level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    Aes128Gcm,
    ChaCha20Poly1305,
    /// Length-framed plaintext chunks.
    None,
    /// No body processing at all. Clears the chunk options on the wire.
    Zero,
}

impl Security {
    /// Security nibble carried in the request header. `Zero` is a client
    /// behaviour, not a wire value; it is transmitted as `None`.
    fn wire_code(self) -> u8 {
        match self {
            Security::Aes128Gcm => 0x03,
            Security::ChaCha20Poly1305 => 0x04,
            Security::None | Security::Zero => 0x05,
        }
    }
}

impl std::str::FromStr for Security {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.to_ascii_lowercase().as_str() {
            "aes-128-gcm" => Ok(Security::Aes128Gcm),
            "chacha20-poly1305" => Ok(Security::ChaCha20Poly1305),
            "none" => Ok(Security::None),
            "zero" => Ok(Security::Zero),
            other => Err(Error::UnsupportedSecurity(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Security name is not part of the supported set.
    UnsupportedSecurity(String),
    /// AEAD open failed on a sealed header or frame.
    BadTag,
    /// A plaintext header was shorter than its own length fields claim.
    TruncatedHeader,
    /// The response echoed a different auth code than the request carried.
    AuthMismatch,
    /// Frame length arithmetic does not add up (shorter than its padding
    /// and tag).
    BadFrameLength,
    /// Response instruction code is not one we understand.
    UnknownInstruction(u8),
    /// Instruction checksum mismatch.
    BadChecksum,
    /// Destination address can not be represented on the wire.
    BadAddress,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnsupportedSecurity(name) => write!(f, "unsupported security: {name}"),
            Error::BadTag => write!(f, "AEAD open failed"),
            Error::TruncatedHeader => write!(f, "truncated header"),
            Error::AuthMismatch => write!(f, "response auth code mismatch"),
            Error::BadFrameLength => write!(f, "inconsistent frame length"),
            Error::UnknownInstruction(code) => write!(f, "unknown instruction code {code}"),
            Error::BadChecksum => write!(f, "instruction checksum mismatch"),
            Error::BadAddress => write!(f, "destination address is not encodable"),
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        let kind = match e {
            Error::UnsupportedSecurity(_) | Error::BadAddress => std::io::ErrorKind::InvalidInput,
            Error::AuthMismatch => std::io::ErrorKind::PermissionDenied,
            _ => std::io::ErrorKind::InvalidData,
        };
        std::io::Error::new(kind, e)
    }
}
