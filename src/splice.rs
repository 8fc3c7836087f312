//! Raw bidirectional forwarding between two streams.
//!
//! Used for TLS passthrough and for upgraded (WebSocket) tunnels. Each
//! direction runs on its own task with a pooled copy buffer; when one
//! direction sees EOF or an error, the write side of the peer is shut down
//! so the other direction can drain. Both streams are closed once both
//! halves complete.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::pool::BufferPool;

/// How long a passthrough dial may take before the client is dropped.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Dials `upstream_addr`, replays `initial` bytes, then splices.
///
/// On dial failure the client connection is closed without a response; the
/// peeked bytes never reach anyone else.
pub async fn forward(
    client: TcpStream,
    upstream_addr: &str,
    initial: &[u8],
    pool: Arc<BufferPool>,
) -> io::Result<(u64, u64)> {
    let mut upstream = match timeout(DIAL_TIMEOUT, TcpStream::connect(upstream_addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("dialing {upstream_addr} timed out"),
            ))
        }
    };

    if !initial.is_empty() {
        upstream.write_all(initial).await?;
    }

    let (up, down) = join(client, upstream, pool).await;
    Ok((up + initial.len() as u64, down))
}

/// Splices two streams until both directions finish.
///
/// Returns the byte counts copied a→b and b→a. Errors in either direction
/// end that half; the totals reflect what was copied before the failure.
pub async fn join<A, B>(a: A, b: B, pool: Arc<BufferPool>) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let up = tokio::spawn(copy_half(a_read, b_write, pool.clone()));
    let down = tokio::spawn(copy_half(b_read, a_write, pool));

    let up = up.await.map(|r| r.unwrap_or(0)).unwrap_or(0);
    let down = down.await.map(|r| r.unwrap_or(0)).unwrap_or(0);
    (up, down)
}

/// Copies one direction with a pooled buffer, then half-closes the writer.
async fn copy_half<R, W>(
    mut reader: ReadHalf<R>,
    mut writer: WriteHalf<W>,
    pool: Arc<BufferPool>,
) -> io::Result<u64>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    let mut buf = pool.get();
    let mut total = 0u64;
    let result = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break Ok(total),
            Ok(n) => match writer.write_all(&buf[..n]).await {
                Ok(()) => total += n as u64,
                Err(e) => break Err(e),
            },
            Err(e) => break Err(e),
        }
    };
    pool.put(buf);
    // Half-close so the peer can drain the other direction.
    let _ = writer.shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::COPY_BUF_SIZE;
    use tokio::net::TcpListener;

    async fn echo_listener() -> (TcpListener, std::net::SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[tokio::test]
    async fn forward_replays_initial_bytes_then_splices() {
        let pool = Arc::new(BufferPool::new(COPY_BUF_SIZE));
        let (backend, backend_addr) = echo_listener().await;

        // Backend records everything it receives and echoes it back.
        let backend_task = tokio::spawn(async move {
            let (mut stream, _) = backend.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
                stream.write_all(&buf[..n]).await.unwrap();
            }
            received
        });

        let (client_front, client_back) = {
            let (listener, addr) = echo_listener().await;
            let connect = TcpStream::connect(addr);
            let (accepted, connected) = tokio::join!(listener.accept(), connect);
            (connected.unwrap(), accepted.unwrap().0)
        };

        let splice_pool = pool.clone();
        let addr = backend_addr.to_string();
        let splice_task = tokio::spawn(async move {
            forward(client_back, &addr, b"peeked:", splice_pool).await
        });

        let mut client = client_front;
        client.write_all(b"body").await.unwrap();
        client.shutdown().await.unwrap();

        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"peeked:body");

        let received = backend_task.await.unwrap();
        assert_eq!(received, b"peeked:body");

        let (up, _down) = splice_task.await.unwrap().unwrap();
        assert_eq!(up, b"peeked:body".len() as u64);
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn forward_dial_failure_reports_error() {
        let pool = Arc::new(BufferPool::new(COPY_BUF_SIZE));
        let (listener, addr) = echo_listener().await;
        // Bind then drop so the port refuses connections.
        drop(listener);

        let (_front, back) = {
            let (l, a) = echo_listener().await;
            let connect = TcpStream::connect(a);
            let (accepted, connected) = tokio::join!(l.accept(), connect);
            (connected.unwrap(), accepted.unwrap().0)
        };

        let result = forward(back, &addr.to_string(), b"hello", pool.clone()).await;
        assert!(result.is_err());
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn join_propagates_half_close() {
        let pool = Arc::new(BufferPool::new(COPY_BUF_SIZE));
        let (l1, a1) = echo_listener().await;
        let (l2, a2) = echo_listener().await;

        let (c1, s1) = {
            let connect = TcpStream::connect(a1);
            let (accepted, connected) = tokio::join!(l1.accept(), connect);
            (connected.unwrap(), accepted.unwrap().0)
        };
        let (c2, s2) = {
            let connect = TcpStream::connect(a2);
            let (accepted, connected) = tokio::join!(l2.accept(), connect);
            (connected.unwrap(), accepted.unwrap().0)
        };

        let join_task = tokio::spawn(join(s1, c2, pool.clone()));

        let mut left = c1;
        let mut right = s2;

        left.write_all(b"one way").await.unwrap();
        left.shutdown().await.unwrap();

        // The half-close must travel through the splice so the right side
        // sees EOF after the payload.
        let mut got = Vec::new();
        right.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"one way");

        // The reverse direction still works after the forward one closed.
        right.write_all(b"reply").await.unwrap();
        right.shutdown().await.unwrap();
        let mut reply = Vec::new();
        left.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"reply");

        let (up, down) = join_task.await.unwrap();
        assert_eq!(up, b"one way".len() as u64);
        assert_eq!(down, b"reply".len() as u64);
        assert_eq!(pool.outstanding(), 0);
    }
}
