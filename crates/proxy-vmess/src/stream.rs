//! AsyncRead/AsyncWrite wrapper tying the sealed header, the response
//! head and the two frame codecs to a transport stream.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf as _, BytesMut};
use pin_project_lite::pin_project;
use proxy_types::DestAddr;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::codec::{FrameDecoder, FrameEncoder};
use crate::header::{seal_request, ResponseDecoder, SessionKeys};
use crate::{Error, Options, Security};

const READ_BUF_LEN: usize = 16 * 1024;

enum ReadState {
    Head(ResponseDecoder),
    Body(FrameDecoder),
    Eof,
}

pin_project! {
    /// Client-side VMESS stream: the first write seals and sends the
    /// request header, reads decode the response head then body frames.
    pub struct VmessStream<S> {
        #[pin]
        inner: S,
        encoder: FrameEncoder,
        read_state: ReadState,
        // parked until the response head is parsed
        pending_body_decoder: Option<FrameDecoder>,
        header: Option<Vec<u8>>,
        write_buf: BytesMut,
        read_buf: BytesMut,
        decoded: BytesMut,
        end_sent: bool,
    }
}

impl<S> VmessStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn client(
        inner: S,
        user_id: &uuid::Uuid,
        dest: &DestAddr,
        security: Security,
        options: Options,
    ) -> Result<Self, Error> {
        let keys = SessionKeys::generate(user_id);

        let mut header = Vec::with_capacity(128);
        seal_request(&keys, dest, security, options, &mut header)?;

        let encoder = FrameEncoder::new(security, options, &keys.request_key, &keys.request_iv, &keys.request_key);
        let response_decoder = ResponseDecoder::new(&keys);
        let body_decoder = FrameDecoder::new(
            security,
            options,
            &keys.response_key,
            &keys.response_iv,
            &keys.request_key,
        );

        Ok(Self {
            inner,
            encoder,
            read_state: ReadState::Head(response_decoder),
            pending_body_decoder: Some(body_decoder),
            header: Some(header),
            write_buf: BytesMut::new(),
            read_buf: BytesMut::with_capacity(READ_BUF_LEN),
            decoded: BytesMut::new(),
            end_sent: false,
        })
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S> AsyncRead for VmessStream<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();

        loop {
            if !this.decoded.is_empty() {
                let n = std::cmp::min(buf.remaining(), this.decoded.len());
                buf.put_slice(&this.decoded.split_to(n));
                return Poll::Ready(Ok(()));
            }

            if matches!(this.read_state, ReadState::Eof) {
                return Poll::Ready(Ok(()));
            }

            // Make what progress the buffered ciphertext allows.
            loop {
                match this.read_state {
                    ReadState::Head(decoder) => match decoder.decode(this.read_buf) {
                        Ok(Some(_head)) => {
                            let body = this
                                .pending_body_decoder
                                .take()
                                .expect("body decoder parked until the head is parsed");
                            *this.read_state = ReadState::Body(body);
                        }
                        Ok(None) => break,
                        Err(e) => return Poll::Ready(Err(e.into())),
                    },
                    ReadState::Body(decoder) => match decoder.decode(this.read_buf) {
                        Ok(Some(frame)) if frame.is_empty() => {
                            *this.read_state = ReadState::Eof;
                            break;
                        }
                        Ok(Some(frame)) => this.decoded.extend_from_slice(&frame),
                        Ok(None) => break,
                        Err(e) => return Poll::Ready(Err(e.into())),
                    },
                    ReadState::Eof => break,
                }
            }

            if !this.decoded.is_empty() || matches!(this.read_state, ReadState::Eof) {
                continue;
            }

            this.read_buf.reserve(READ_BUF_LEN);
            let mut inner_buf = ReadBuf::uninit(this.read_buf.spare_capacity_mut());
            ready!(this.inner.as_mut().poll_read(cx, &mut inner_buf))?;
            let filled = inner_buf.filled().len();

            if filled == 0 {
                if !this.read_buf.is_empty() {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream ended inside a frame",
                    )));
                }
                *this.read_state = ReadState::Eof;
                return Poll::Ready(Ok(()));
            }

            // SAFETY: poll_read filled (and thus initialised) `filled` bytes.
            unsafe {
                this.read_buf.set_len(this.read_buf.len() + filled);
            }
        }
    }
}

impl<S> AsyncWrite for VmessStream<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, io::Error>> {
        let mut this = self.project();

        while !this.write_buf.is_empty() {
            let n = ready!(this.inner.as_mut().poll_write(cx, this.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            this.write_buf.advance(n);
        }

        if let Some(header) = this.header.take() {
            this.write_buf.extend_from_slice(&header);
        }
        this.encoder.encode(buf, this.write_buf);

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

        // A flush before any write still pushes the request header out.
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
        if !*self.as_mut().project().end_sent {
            let this = self.as_mut().project();
            this.encoder.encode_end(this.write_buf);
            *this.end_sent = true;
        }

        ready!(self.as_mut().poll_flush(cx))?;
        self.project().inner.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use proxy_types::ToDestAddr as _;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    use super::*;
    use crate::crypto::{
        cmd_key, fnv1a, kdf12, kdf16, BodyAead, AEAD_OVERHEAD, LABEL_HEADER_IV, LABEL_HEADER_KEY, LABEL_HEADER_LEN_IV,
        LABEL_HEADER_LEN_KEY,
    };
    use crate::header::test_support::seal_response;

    const USER_ID: &str = "450bae28-b9da-67d0-16bc-4918dc8d79b5";

    /// Minimal server side: opens the request header, decodes request
    /// frames, answers with a sealed head plus framed `reply`.
    async fn vmess_server(mut io: tokio::io::DuplexStream, reply: &[u8]) -> (DestAddr, Vec<u8>) {
        let user_id = uuid::Uuid::parse_str(USER_ID).expect("test uuid");
        let ck = cmd_key(&user_id);

        // auth_id(16) ‖ sealed_len(18) ‖ nonce(8)
        let mut prefix = [0u8; 42];
        io.read_exact(&mut prefix).await.expect("request prefix");
        let auth_id: [u8; 16] = prefix[..16].try_into().expect("slice length");
        let nonce: [u8; 8] = prefix[34..42].try_into().expect("slice length");

        let len_key = kdf16(&ck, &[LABEL_HEADER_LEN_KEY, &auth_id, &nonce]);
        let len_iv = kdf12(&ck, &[LABEL_HEADER_LEN_IV, &auth_id, &nonce]);
        let opened_len = BodyAead::aes128(&len_key)
            .open(&len_iv, &prefix[16..34], &auth_id)
            .expect("sealed length opens");
        let header_len = usize::from(u16::from_be_bytes([opened_len[0], opened_len[1]]));

        let mut sealed_header = vec![0u8; header_len + AEAD_OVERHEAD];
        io.read_exact(&mut sealed_header).await.expect("sealed header");
        let header_key = kdf16(&ck, &[LABEL_HEADER_KEY, &auth_id, &nonce]);
        let header_iv = kdf12(&ck, &[LABEL_HEADER_IV, &auth_id, &nonce]);
        let header = BodyAead::aes128(&header_key)
            .open(&header_iv, &sealed_header, &auth_id)
            .expect("sealed header opens");

        // checksum covers everything before itself
        let checksum_at = header.len() - 4;
        assert_eq!(&header[checksum_at..], &fnv1a(&header[..checksum_at]).to_be_bytes());

        let request_iv: [u8; 16] = header[1..17].try_into().expect("slice length");
        let request_key: [u8; 16] = header[17..33].try_into().expect("slice length");
        let response_auth = header[33];
        let options = Options::from_bits_truncate(header[34]);
        assert_eq!(header[35] & 0x0F, 0x03, "aes-128-gcm request");

        let port = u16::from_be_bytes([header[38], header[39]]);
        let host_len = usize::from(header[41]);
        let host = core::str::from_utf8(&header[42..42 + host_len]).expect("utf8 host");
        let dest = DestAddr::Domain(host.to_owned(), port);

        let keys = crate::header::SessionKeys::assemble(&user_id, request_key, request_iv, response_auth);

        // request body frames
        let mut decoder = FrameDecoder::new(Security::Aes128Gcm, options, &keys.request_key, &keys.request_iv, &keys.request_key);
        let mut staging = BytesMut::new();
        let mut received = Vec::new();
        let mut tmp = [0u8; 4096];
        'outer: loop {
            let n = io.read(&mut tmp).await.expect("server read");
            assert!(n > 0, "client hung up early");
            staging.extend_from_slice(&tmp[..n]);
            while let Some(frame) = decoder.decode(&mut staging).expect("request frame") {
                received.extend_from_slice(&frame);
                if !received.is_empty() {
                    break 'outer;
                }
            }
        }

        // response: sealed head, then framed reply and the end sentinel
        let mut wire = seal_response(&keys, &[response_auth, 0x00, 0x00, 0x00]);
        let mut encoder = FrameEncoder::new(
            Security::Aes128Gcm,
            options,
            &keys.response_key,
            &keys.response_iv,
            &keys.request_key,
        );
        let mut framed = BytesMut::new();
        encoder.encode(reply, &mut framed);
        encoder.encode_end(&mut framed);
        wire.extend_from_slice(&framed);
        io.write_all(&wire).await.expect("server write");

        (dest, received)
    }

    #[tokio::test]
    async fn stream_round_trip() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let user_id = uuid::Uuid::parse_str(USER_ID).unwrap();
        let dest = "swift.org:443".to_dest_addr().unwrap();

        let server = tokio::spawn(async move { vmess_server(server_io, b"pong").await });

        let mut client = VmessStream::client(
            client_io,
            &user_id,
            &dest,
            Security::Aes128Gcm,
            Options::default() | Options::GLOBAL_PADDING | Options::AUTHENTICATED_LENGTH,
        )
        .unwrap();

        client.write_all(b"ping").await.unwrap();
        client.flush().await.unwrap();

        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");

        // After the end sentinel the stream reports EOF.
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let (seen_dest, seen_payload) = server.await.unwrap();
        assert_eq!(seen_dest, dest);
        assert_eq!(seen_payload, b"ping");
    }

    #[tokio::test]
    async fn flush_without_write_sends_the_header() {
        let (client_io, mut server_io) = tokio::io::duplex(64 * 1024);
        let user_id = uuid::Uuid::parse_str(USER_ID).unwrap();
        let dest = "swift.org:443".to_dest_addr().unwrap();

        let mut client =
            VmessStream::client(client_io, &user_id, &dest, Security::Aes128Gcm, Options::default()).unwrap();
        client.flush().await.unwrap();

        // auth id + sealed length are immediately on the wire.
        let mut prefix = [0u8; 42];
        server_io.read_exact(&mut prefix).await.unwrap();
    }
}
