//! Buffered copy loop derived from tokio's `io::copy` internals, with a
//! configurable buffer size and an explicit shutdown step so that EOF on
//! the reader half-closes the peer instead of leaving it dangling.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug)]
struct CopyBuffer {
    read_done: bool,
    need_flush: bool,
    pos: usize,
    cap: usize,
    amt: u64,
    buf: Box<[u8]>,
}

impl CopyBuffer {
    fn new(buffer_size: usize) -> Self {
        Self {
            read_done: false,
            need_flush: false,
            pos: 0,
            cap: 0,
            amt: 0,
            buf: vec![0; buffer_size].into_boxed_slice(),
        }
    }

    fn poll_fill_buf<R>(&mut self, cx: &mut Context<'_>, reader: Pin<&mut R>) -> Poll<io::Result<()>>
    where
        R: AsyncRead + ?Sized,
    {
        let mut buf = ReadBuf::new(&mut self.buf);
        buf.set_filled(self.cap);

        let res = reader.poll_read(cx, &mut buf);
        if let Poll::Ready(Ok(())) = res {
            let filled_len = buf.filled().len();
            self.read_done = self.cap == filled_len;
            self.cap = filled_len;
        }
        res
    }

    fn poll_write_buf<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) -> Poll<io::Result<usize>>
    where
        R: AsyncRead + ?Sized,
        W: AsyncWrite + ?Sized,
    {
        match writer.as_mut().poll_write(cx, &self.buf[self.pos..self.cap]) {
            Poll::Pending => {
                // The writer is applying backpressure. Top up the buffer
                // from the reader meanwhile so the next write is larger.
                if !self.read_done && self.cap < self.buf.len() {
                    ready!(self.poll_fill_buf(cx, reader.as_mut()))?;
                }
                Poll::Pending
            }
            res => res,
        }
    }

    fn poll_copy<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) -> Poll<io::Result<u64>>
    where
        R: AsyncRead + ?Sized,
        W: AsyncWrite + ?Sized,
    {
        loop {
            if self.pos == self.cap && !self.read_done {
                self.pos = 0;
                self.cap = 0;

                match self.poll_fill_buf(cx, reader.as_mut()) {
                    Poll::Ready(Ok(())) => (),
                    Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                    Poll::Pending => {
                        // Flush when the reader stalls, so bytes buffered in
                        // the writer are not held back indefinitely (the
                        // peer may be waiting on them to make progress).
                        if self.need_flush {
                            ready!(writer.as_mut().poll_flush(cx))?;
                            self.need_flush = false;
                        }

                        return Poll::Pending;
                    }
                }
            }

            while self.pos < self.cap {
                let written = ready!(self.poll_write_buf(cx, reader.as_mut(), writer.as_mut()))?;
                if written == 0 {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write zero byte into writer",
                    )));
                }
                self.pos += written;
                self.amt += written as u64;
                self.need_flush = true;
            }

            debug_assert!(self.pos <= self.cap, "writer returned length larger than input slice");

            if self.pos == self.cap && self.read_done {
                ready!(writer.as_mut().poll_flush(cx))?;
                return Poll::Ready(Ok(self.amt));
            }
        }
    }
}

enum TransferState {
    Running(CopyBuffer),
    ShuttingDown(u64),
    Done(u64),
}

impl TransferState {
    fn poll_transfer<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) -> Poll<io::Result<u64>>
    where
        R: AsyncRead + ?Sized,
        W: AsyncWrite + ?Sized,
    {
        loop {
            match self {
                TransferState::Running(buf) => {
                    let count = ready!(buf.poll_copy(cx, reader.as_mut(), writer.as_mut()))?;
                    *self = TransferState::ShuttingDown(count);
                }
                TransferState::ShuttingDown(count) => {
                    // Reader hit EOF: propagate as a half-close so the peer
                    // observes FIN while its own sending side stays open.
                    ready!(writer.as_mut().poll_shutdown(cx))?;
                    *self = TransferState::Done(*count);
                }
                TransferState::Done(count) => return Poll::Ready(Ok(*count)),
            }
        }
    }
}

/// Copies `reader` into `writer` until EOF, then shuts the writer down.
///
/// Returns the number of bytes transferred.
pub async fn forward<R, W>(mut reader: R, mut writer: W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut state = TransferState::Running(CopyBuffer::new(BUFFER_SIZE));
    std::future::poll_fn(|cx| state.poll_transfer(cx, Pin::new(&mut reader), Pin::new(&mut writer))).await
}

#[derive(Debug, Clone, Copy)]
pub struct RelayResult {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Ties two streams together and forwards bytes both ways.
///
/// EOF on one stream half-closes the other and lets the opposite
/// direction keep running. The relay completes when both directions are
/// done, or fails as soon as either direction reports an error (in which
/// case the caller is expected to drop both streams, closing them).
pub async fn relay<A, B>(a: &mut A, b: &mut B) -> io::Result<RelayResult>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut a_to_b = TransferState::Running(CopyBuffer::new(BUFFER_SIZE));
    let mut b_to_a = TransferState::Running(CopyBuffer::new(BUFFER_SIZE));

    std::future::poll_fn(|cx| {
        let forward_res = a_to_b.poll_transfer(cx, Pin::new(&mut *a), Pin::new(&mut *b))?;
        let backward_res = b_to_a.poll_transfer(cx, Pin::new(&mut *b), Pin::new(&mut *a))?;

        match (forward_res, backward_res) {
            (Poll::Ready(a_to_b), Poll::Ready(b_to_a)) => Poll::Ready(Ok(RelayResult { a_to_b, b_to_a })),
            _ => Poll::Pending,
        }
    })
    .await
}
