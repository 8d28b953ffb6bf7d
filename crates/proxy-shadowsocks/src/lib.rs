//! Shadowsocks AEAD client implementation.
//!
//! The wire format per direction is a random salt followed by sealed
//! frames; every frame is a sealed 2-byte length (high two bits reserved)
//! then the sealed payload, each with its own 16-byte tag. Session keys
//! are derived per direction with HKDF-SHA1 from the master key and the
//! direction's salt.

mod cipher;
mod codec;
mod stream;

pub use cipher::CipherKind;
pub use codec::{Decryptor, Encryptor, MAX_CHUNK_LEN};
pub use stream::ShadowsocksStream;

use core::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Cipher name is not one of the supported AEAD ciphers.
    UnsupportedCipher(String),
    /// AEAD open failed: wrong key, corrupted frame or replayed nonce.
    BadTag,
    /// Length field uses the reserved high bits.
    ReservedLengthBits,
    /// Destination address can not be represented on the wire.
    BadAddress,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnsupportedCipher(name) => write!(f, "unsupported cipher: {name}"),
            Error::BadTag => write!(f, "AEAD open failed"),
            Error::ReservedLengthBits => write!(f, "length field uses reserved bits"),
            Error::BadAddress => write!(f, "destination address is not encodable"),
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        let kind = match e {
            Error::UnsupportedCipher(_) => std::io::ErrorKind::InvalidInput,
            Error::BadAddress => std::io::ErrorKind::InvalidInput,
            Error::BadTag | Error::ReservedLengthBits => std::io::ErrorKind::InvalidData,
        };
        std::io::Error::new(kind, e)
    }
}
