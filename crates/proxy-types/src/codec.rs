//! RFC 1928 address field codec.
//!
//! | ATYP | DST.ADDR | DST.PORT |
//! | ---- | -------- | -------- |
//! |  1   | Variable |    2     |
//!
//! ATYP is `0x01` for IPv4 (4 octets), `0x03` for a domain name (1-byte
//! length followed by the name, no terminating NUL), `0x04` for IPv6
//! (16 octets). The port is always 2 bytes, big endian.

use core::fmt;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::DestAddr;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Biggest possible encoding: domain tag + length byte + 255 bytes + port.
pub const MAX_ADDR_LEN: usize = 1 + 1 + 255 + 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrError {
    /// ATYP byte is none of `0x01` / `0x03` / `0x04`.
    UnknownType(u8),
    /// Domain name bytes are not valid UTF-8.
    BadDomainEncoding,
    /// Domain name does not fit the 1-byte length prefix.
    DomainTooLong,
}

impl std::error::Error for AddrError {}

impl fmt::Display for AddrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddrError::UnknownType(tag) => write!(f, "unknown address type 0x{tag:02x}"),
            AddrError::BadDomainEncoding => write!(f, "domain name is not valid UTF-8"),
            AddrError::DomainTooLong => write!(f, "domain name too long"),
        }
    }
}

impl From<AddrError> for std::io::Error {
    fn from(e: AddrError) -> Self {
        let kind = match e {
            AddrError::UnknownType(_) => std::io::ErrorKind::Unsupported,
            AddrError::BadDomainEncoding | AddrError::DomainTooLong => std::io::ErrorKind::InvalidData,
        };
        std::io::Error::new(kind, e)
    }
}

/// Decodes an address field from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` holds fewer bytes than the field needs;
/// the caller keeps the bytes and retries once more arrived. On success
/// the decoded address and the number of bytes consumed are returned.
pub fn decode(buf: &[u8]) -> Result<Option<(DestAddr, usize)>, AddrError> {
    let Some(&atyp) = buf.first() else {
        return Ok(None);
    };

    match atyp {
        ATYP_IPV4 => {
            let Some(field) = buf.get(1..7) else {
                return Ok(None);
            };
            let ip = <[u8; 4]>::try_from(&field[..4]).expect("slice length checked");
            let port = u16::from_be_bytes([field[4], field[5]]);
            let addr = SocketAddr::V4(SocketAddrV4::new(ip.into(), port));
            Ok(Some((DestAddr::Ip(addr), 7)))
        }
        ATYP_DOMAIN => {
            let Some(&len) = buf.get(1) else {
                return Ok(None);
            };
            let len = usize::from(len);
            let Some(field) = buf.get(2..2 + len + 2) else {
                return Ok(None);
            };
            let domain = core::str::from_utf8(&field[..len]).map_err(|_| AddrError::BadDomainEncoding)?;
            let port = u16::from_be_bytes([field[len], field[len + 1]]);
            Ok(Some((DestAddr::Domain(domain.to_owned(), port), 2 + len + 2)))
        }
        ATYP_IPV6 => {
            let Some(field) = buf.get(1..19) else {
                return Ok(None);
            };
            let ip = <[u8; 16]>::try_from(&field[..16]).expect("slice length checked");
            let port = u16::from_be_bytes([field[16], field[17]]);
            let addr = SocketAddr::V6(SocketAddrV6::new(ip.into(), port, 0, 0));
            Ok(Some((DestAddr::Ip(addr), 19)))
        }
        unknown => Err(AddrError::UnknownType(unknown)),
    }
}

/// Appends the encoding of `addr` to `buf` and returns the encoded length.
pub fn encode(addr: &DestAddr, buf: &mut Vec<u8>) -> Result<usize, AddrError> {
    let start = buf.len();

    match addr {
        DestAddr::Ip(SocketAddr::V4(v4)) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&v4.ip().octets());
            buf.extend_from_slice(&v4.port().to_be_bytes());
        }
        DestAddr::Ip(SocketAddr::V6(v6)) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&v6.ip().octets());
            buf.extend_from_slice(&v6.port().to_be_bytes());
        }
        DestAddr::Domain(domain, port) => {
            let len = u8::try_from(domain.len()).map_err(|_| AddrError::DomainTooLong)?;
            if len == 0 {
                return Err(AddrError::BadDomainEncoding);
            }
            buf.push(ATYP_DOMAIN);
            buf.push(len);
            buf.extend_from_slice(domain.as_bytes());
            buf.extend_from_slice(&port.to_be_bytes());
        }
    }

    Ok(buf.len() - start)
}

/// Appends only the tag and host body of `addr` (no trailing port) to
/// `buf`. Used by wire formats that place the port ahead of the address.
pub fn encode_host(addr: &DestAddr, buf: &mut Vec<u8>) -> Result<usize, AddrError> {
    let start = buf.len();

    match addr {
        DestAddr::Ip(SocketAddr::V4(v4)) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&v4.ip().octets());
        }
        DestAddr::Ip(SocketAddr::V6(v6)) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&v6.ip().octets());
        }
        DestAddr::Domain(domain, _) => {
            let len = u8::try_from(domain.len()).map_err(|_| AddrError::DomainTooLong)?;
            if len == 0 {
                return Err(AddrError::BadDomainEncoding);
            }
            buf.push(ATYP_DOMAIN);
            buf.push(len);
            buf.extend_from_slice(domain.as_bytes());
        }
    }

    Ok(buf.len() - start)
}

/// Encoded size of `addr`, without encoding it.
pub fn encoded_len(addr: &DestAddr) -> usize {
    match addr {
        DestAddr::Ip(SocketAddr::V4(_)) => 7,
        DestAddr::Ip(SocketAddr::V6(_)) => 19,
        DestAddr::Domain(domain, _) => 2 + domain.len() + 2,
    }
}
