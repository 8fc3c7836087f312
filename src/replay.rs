//! Replay wrapper that prepends peeked bytes to a connection.
//!
//! The demultiplexer consumes the first read of every connection to sniff the
//! protocol. When the connection is then handed to a TLS acceptor or an HTTP
//! server, those bytes must appear again: [`ReplayStream`] drains the peek
//! buffer before delegating reads to the socket. The buffer came from the
//! shared peek pool and is returned exactly once, on the read that empties it
//! or on drop, whichever happens first.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::pool::BufferPool;

/// An `AsyncRead + AsyncWrite` stream that replays a pre-read buffer.
pub struct ReplayStream<S> {
    inner: S,
    buf: Vec<u8>,
    pos: usize,
    pool: Arc<BufferPool>,
    released: bool,
}

impl<S> ReplayStream<S> {
    /// Wraps `inner`, replaying `buf` before any further reads.
    ///
    /// `buf` must have been truncated to the number of peeked bytes and is
    /// owned by the wrapper from here on.
    pub fn new(inner: S, buf: Vec<u8>, pool: Arc<BufferPool>) -> Self {
        Self {
            inner,
            buf,
            pos: 0,
            pool,
            released: false,
        }
    }

    /// Unconsumed replay bytes.
    #[cfg(test)]
    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.put(std::mem::take(&mut self.buf));
            self.pos = 0;
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ReplayStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.buf.len() {
            let n = (this.buf.len() - this.pos).min(out.remaining());
            out.put_slice(&this.buf[this.pos..this.pos + n]);
            this.pos += n;
            if this.pos == this.buf.len() {
                this.release();
            }
            return Poll::Ready(Ok(()));
        }
        // Covers the degenerate empty-buffer case; no-op once released.
        this.release();
        Pin::new(&mut this.inner).poll_read(cx, out)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ReplayStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<S> Drop for ReplayStream<S> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::pool::BufferPool;

    fn pool() -> Arc<BufferPool> {
        Arc::new(BufferPool::new(16))
    }

    fn peeked(pool: &Arc<BufferPool>, data: &[u8]) -> Vec<u8> {
        let mut buf = pool.get();
        buf[..data.len()].copy_from_slice(data);
        buf.truncate(data.len());
        buf
    }

    #[tokio::test]
    async fn replays_buffer_then_inner() {
        let pool = pool();
        let buf = peeked(&pool, b"hello ");
        let mut stream = ReplayStream::new(Cursor::new(&b"world"[..]), buf, pool.clone());

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn partial_reads_drain_in_order() {
        let pool = pool();
        let buf = peeked(&pool, b"abcd");
        let mut stream = ReplayStream::new(Cursor::new(&b"ef"[..]), buf, pool.clone());

        let mut small = [0u8; 3];
        let n = stream.read(&mut small).await.unwrap();
        assert_eq!(&small[..n], b"abc");
        assert_eq!(stream.remaining(), 1);
        // Buffer not yet drained, so not yet released.
        assert_eq!(pool.outstanding(), 1);

        let n = stream.read(&mut small).await.unwrap();
        assert_eq!(&small[..n], b"d");
        assert_eq!(pool.outstanding(), 0);

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"ef");
    }

    #[tokio::test]
    async fn release_on_drop_before_drain() {
        let pool = pool();
        let buf = peeked(&pool, b"never read");
        let stream = ReplayStream::new(Cursor::new(&b""[..]), buf, pool.clone());
        assert_eq!(pool.outstanding(), 1);
        drop(stream);
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn release_happens_exactly_once() {
        let pool = pool();
        let buf = peeked(&pool, b"x");
        let mut stream = ReplayStream::new(Cursor::new(&b""[..]), buf, pool.clone());

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(pool.released(), 1);
        drop(stream);
        // Drop after the draining read must not double-release.
        assert_eq!(pool.released(), 1);
    }

    #[tokio::test]
    async fn empty_buffer_delegates_immediately() {
        let pool = pool();
        let buf = peeked(&pool, b"");
        let mut stream = ReplayStream::new(Cursor::new(&b"data"[..]), buf, pool.clone());

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"data");
        assert_eq!(pool.outstanding(), 0);
    }
}
