//! Trojan client stream.
//!
//! Trojan rides on an established TLS session; its whole handshake is a
//! request block prepended to the first payload write:
//!
//! ```text
//! hex(SHA224(password)) CRLF CMD(0x01 = CONNECT) address CRLF payload…
//! ```
//!
//! Everything after that first write passes through untouched, in both
//! directions.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf as _, BytesMut};
use pin_project_lite::pin_project;
use proxy_types::{codec as addr_codec, DestAddr};
use sha2::{Digest as _, Sha224};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const CRLF: &[u8] = b"\r\n";
const CMD_CONNECT: u8 = 0x01;

/// Builds the request block sent ahead of the first payload bytes.
fn request_block(password: &str, dest: &DestAddr) -> io::Result<Vec<u8>> {
    let digest = hex::encode(Sha224::digest(password.as_bytes()));

    let mut block = Vec::with_capacity(56 + 2 + 1 + addr_codec::encoded_len(dest) + 2);
    block.extend_from_slice(digest.as_bytes());
    block.extend_from_slice(CRLF);
    block.push(CMD_CONNECT);
    addr_codec::encode(dest, &mut block)?;
    block.extend_from_slice(CRLF);

    Ok(block)
}

pin_project! {
    /// Client-side Trojan stream over an already-negotiated TLS session.
    pub struct TrojanStream<S> {
        #[pin]
        inner: S,
        // request block, pending until the first write
        header: Option<Vec<u8>>,
        write_buf: BytesMut,
    }
}

impl<S> TrojanStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn client(inner: S, password: &str, dest: &DestAddr) -> io::Result<Self> {
        Ok(Self {
            inner,
            header: Some(request_block(password, dest)?),
            write_buf: BytesMut::new(),
        })
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S> AsyncRead for TrojanStream<S>
where
    S: AsyncRead + Unpin,
{
    #[inline]
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for TrojanStream<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, io::Error>> {
        let mut this = self.project();

        // Finish any queued request-block bytes before accepting more.
        while !this.write_buf.is_empty() {
            let n = ready!(this.inner.as_mut().poll_write(cx, this.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            this.write_buf.advance(n);
        }

        // First write: request block and payload go out as one unit so the
        // server sees them inline.
        if let Some(header) = this.header.take() {
            this.write_buf.extend_from_slice(&header);
            this.write_buf.extend_from_slice(buf);

            while !this.write_buf.is_empty() {
                match this.inner.as_mut().poll_write(cx, this.write_buf) {
                    Poll::Ready(Ok(0)) => return Poll::Ready(Err(io::ErrorKind::WriteZero.into())),
                    Poll::Ready(Ok(n)) => this.write_buf.advance(n),
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => break,
                }
            }

            return Poll::Ready(Ok(buf.len()));
        }

        this.inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let mut this = self.project();

        // A flush before any payload write still sends the request block.
        if let Some(header) = this.header.take() {
            this.write_buf.extend_from_slice(&header);
        }

        while !this.write_buf.is_empty() {
            let n = ready!(this.inner.as_mut().poll_write(cx, this.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            this.write_buf.advance(n);
        }

        this.inner.poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        ready!(self.as_mut().poll_flush(cx))?;
        self.project().inner.poll_shutdown(cx)
    }
}
