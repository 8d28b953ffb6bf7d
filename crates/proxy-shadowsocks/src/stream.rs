//! AsyncRead/AsyncWrite wrapper driving the codec pair over a transport
//! stream.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf as _, BytesMut};
use pin_project_lite::pin_project;
use proxy_types::DestAddr;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::codec::{Decryptor, Encryptor};
use crate::{CipherKind, Error};

const READ_BUF_LEN: usize = 16 * 1024;

pin_project! {
    /// Client-side Shadowsocks stream: writes are sealed (the first one
    /// carrying the destination address), reads are opened.
    pub struct ShadowsocksStream<S> {
        #[pin]
        inner: S,
        encryptor: Encryptor,
        decryptor: Decryptor,
        // ciphertext waiting to be written out
        write_buf: BytesMut,
        // ciphertext read but not yet decodable / decoded
        read_buf: BytesMut,
        // plaintext ready to hand to the caller
        decoded: BytesMut,
        read_eof: bool,
    }
}

impl<S> ShadowsocksStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn client(inner: S, kind: CipherKind, password: &str, dest: &DestAddr) -> Result<Self, Error> {
        Ok(Self {
            inner,
            encryptor: Encryptor::client(kind, password, dest)?,
            decryptor: Decryptor::new(kind, password),
            write_buf: BytesMut::new(),
            read_buf: BytesMut::with_capacity(READ_BUF_LEN),
            decoded: BytesMut::new(),
            read_eof: false,
        })
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S> AsyncRead for ShadowsocksStream<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();

        loop {
            // Serve already-decoded plaintext first.
            if !this.decoded.is_empty() {
                let n = std::cmp::min(buf.remaining(), this.decoded.len());
                buf.put_slice(&this.decoded.split_to(n));
                return Poll::Ready(Ok(()));
            }

            if *this.read_eof {
                return Poll::Ready(Ok(()));
            }

            // Decode whatever is already buffered.
            loop {
                match this.decryptor.decrypt(this.read_buf) {
                    Ok(Some(chunk)) => this.decoded.extend_from_slice(&chunk),
                    Ok(None) => break,
                    Err(e) => return Poll::Ready(Err(e.into())),
                }
            }

            if !this.decoded.is_empty() {
                continue;
            }

            // Pull more ciphertext.
            this.read_buf.reserve(READ_BUF_LEN);
            let mut inner_buf = ReadBuf::uninit(this.read_buf.spare_capacity_mut());
            ready!(this.inner.as_mut().poll_read(cx, &mut inner_buf))?;
            let filled = inner_buf.filled().len();

            if filled == 0 {
                // EOF in the middle of a frame means the peer was cut off.
                if !this.read_buf.is_empty() {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream ended inside an encrypted frame",
                    )));
                }
                *this.read_eof = true;
                return Poll::Ready(Ok(()));
            }

            // SAFETY: poll_read filled (and thus initialised) `filled` bytes.
            unsafe {
                this.read_buf.set_len(this.read_buf.len() + filled);
            }
        }
    }
}

impl<S> AsyncWrite for ShadowsocksStream<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, io::Error>> {
        let mut this = self.project();

        // Backpressure: finish writing previously sealed bytes before
        // accepting new plaintext.
        while !this.write_buf.is_empty() {
            let n = ready!(this.inner.as_mut().poll_write(cx, this.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            this.write_buf.advance(n);
        }

        this.encryptor.encrypt(buf, this.write_buf);

        // Opportunistically drain; leftovers go out on the next write or flush.
        while !this.write_buf.is_empty() {
            match this.inner.as_mut().poll_write(cx, this.write_buf) {
                Poll::Ready(Ok(0)) => return Poll::Ready(Err(io::ErrorKind::WriteZero.into())),
                Poll::Ready(Ok(n)) => this.write_buf.advance(n),
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => break,
            }
        }

        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let mut this = self.project();

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

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use proxy_types::{codec as addr_codec, ToDestAddr as _};
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    use super::*;
    use crate::Encryptor;

    /// Plain tokio-side server speaking the raw codec, for exercising the
    /// stream wrapper end to end.
    async fn fake_server(
        mut stream: tokio::io::DuplexStream,
        kind: CipherKind,
        password: &str,
        reply: &[u8],
    ) -> (DestAddr, Vec<u8>) {
        let mut decryptor = Decryptor::new(kind, password);
        let mut buf = BytesMut::new();
        let mut chunks: Vec<Vec<u8>> = Vec::new();

        let mut tmp = [0u8; 4096];
        loop {
            let n = stream.read(&mut tmp).await.expect("server read");
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&tmp[..n]);
            while let Some(chunk) = decryptor.decrypt(&mut buf).expect("server decrypt") {
                chunks.push(chunk);
            }
            // One address frame + one payload frame is all the test sends.
            if chunks.len() >= 2 {
                break;
            }
        }

        let (dest, _) = addr_codec::decode(&chunks[0]).expect("address decode").expect("complete");
        let received = chunks[1..].concat();

        let mut encryptor = Encryptor::raw(kind, password);
        let mut wire = BytesMut::new();
        encryptor.encrypt(reply, &mut wire);
        stream.write_all(&wire).await.expect("server write");
        stream.shutdown().await.expect("server shutdown");

        (dest, received)
    }

    #[tokio::test]
    async fn stream_round_trip() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let dest = "swift.org:443".to_dest_addr().unwrap();

        let server = tokio::spawn(fake_server(
            server_io,
            CipherKind::Aes128Gcm,
            "BeMWIH2K5YtZ",
            b"response bytes",
        ));

        let mut client =
            ShadowsocksStream::client(client_io, CipherKind::Aes128Gcm, "BeMWIH2K5YtZ", &dest).unwrap();

        client.write_all(b"request bytes").await.unwrap();
        client.flush().await.unwrap();

        let mut reply = vec![0u8; 14];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, b"response bytes");

        let (seen_dest, seen_payload) = server.await.unwrap();
        assert_eq!(seen_dest, dest);
        assert_eq!(seen_payload, b"request bytes");
    }
}
