//! Byte-stream forwarding for proxy pipelines.
//!
//! [`forward`] drives one direction (read → write) and half-closes the
//! write side once the reader reaches EOF. [`relay`] drives both
//! directions of a pair of streams: each direction half-closes
//! independently, an error on either side tears the whole pair down.

mod copy;

pub use copy::{forward, relay, RelayResult};

use tokio::io::{AsyncRead, AsyncWrite};

pub type ErasedRead = Box<dyn AsyncRead + Send + Unpin>;
pub type ErasedWrite = Box<dyn AsyncWrite + Send + Unpin>;

pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}

impl<T> AsyncReadWrite for T where T: AsyncRead + AsyncWrite {}

pub type ErasedReadWrite = Box<dyn AsyncReadWrite + Send + Unpin>;
