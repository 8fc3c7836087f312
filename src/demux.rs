//! Connection demultiplexing per listen socket.
//!
//! One demultiplexer runs per listener in either TLS or HTTP mode. Every
//! accepted connection gets its own task; the accept loop itself never waits
//! on per-connection work. The task peeks the first bytes, asks the routing
//! table whether the named host is a passthrough route, and either splices
//! the connection raw to the backend or replays the peeked bytes into the
//! terminating HTTP stack.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

use crate::peek;
use crate::pool::BufferPool;
use crate::proxy::ProxyEngine;
use crate::replay::ReplayStream;
use crate::router::RouterHandle;
use crate::splice;

/// Inbound TLS handshakes must finish within this window.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Which peeker a listener runs. TLS listeners carry the acceptor used when
/// a connection is terminated rather than passed through.
enum DemuxMode {
    Tls(TlsAcceptor),
    Http,
}

/// Accepts connections on one socket and routes each by its peeked name.
pub struct Demux {
    mode: DemuxMode,
    table: Arc<RouterHandle>,
    engine: Arc<ProxyEngine>,
    peek_pool: Arc<BufferPool>,
    copy_pool: Arc<BufferPool>,
}

impl Demux {
    /// Creates a TLS-mode demultiplexer terminating with `acceptor`.
    pub fn tls(
        table: Arc<RouterHandle>,
        engine: Arc<ProxyEngine>,
        acceptor: TlsAcceptor,
        peek_pool: Arc<BufferPool>,
        copy_pool: Arc<BufferPool>,
    ) -> Self {
        Self {
            mode: DemuxMode::Tls(acceptor),
            table,
            engine,
            peek_pool,
            copy_pool,
        }
    }

    /// Creates an HTTP-mode demultiplexer.
    pub fn http(
        table: Arc<RouterHandle>,
        engine: Arc<ProxyEngine>,
        peek_pool: Arc<BufferPool>,
        copy_pool: Arc<BufferPool>,
    ) -> Self {
        Self {
            mode: DemuxMode::Http,
            table,
            engine,
            peek_pool,
            copy_pool,
        }
    }

    /// Runs the accept loop until the listener fails.
    ///
    /// Accept errors are unrecoverable here and propagate to the caller so
    /// supervision can exit.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, tls = matches!(self.mode, DemuxMode::Tls(_)), "Listener started");

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let demux = self.clone();
            tokio::spawn(async move {
                demux.handle_connection(stream, peer_addr).await;
            });
        }
    }

    /// Peeks one connection and dispatches it.
    async fn handle_connection(&self, mut stream: TcpStream, peer_addr: SocketAddr) {
        let mut buf = self.peek_pool.get();
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => {
                self.peek_pool.put(buf);
                return;
            }
            Ok(n) => n,
        };

        let is_http = matches!(self.mode, DemuxMode::Http);
        let name = match &self.mode {
            DemuxMode::Tls(_) => peek::extract_sni(&buf[..n]),
            DemuxMode::Http => peek::extract_host(&buf[..n]),
        };
        let name = match name {
            Ok(name) => name,
            Err(e) => {
                debug!(peer = %peer_addr, error = %e, "Closing unclassifiable connection");
                self.peek_pool.put(buf);
                return;
            }
        };

        if let Some(upstream) = self.passthrough_target(&name, is_http) {
            debug!(peer = %peer_addr, host = %name, upstream = %upstream, "Passthrough");
            match splice::forward(stream, &upstream, &buf[..n], self.copy_pool.clone()).await {
                Ok((up, down)) => {
                    debug!(peer = %peer_addr, up, down, "Passthrough closed");
                }
                Err(e) => {
                    debug!(peer = %peer_addr, upstream = %upstream, error = %e, "Passthrough failed");
                }
            }
            self.peek_pool.put(buf);
            return;
        }

        // Terminate here: hand the socket onward with the peeked bytes
        // replayed in front of it. The replay wrapper owns the buffer now.
        buf.truncate(n);
        let replay = ReplayStream::new(stream, buf, self.peek_pool.clone());

        match &self.mode {
            DemuxMode::Tls(acceptor) => {
                match timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(replay)).await {
                    Ok(Ok(tls_stream)) => self.serve_http1(tls_stream, peer_addr).await,
                    Ok(Err(e)) => {
                        debug!(peer = %peer_addr, sni = %name, error = %e, "TLS handshake failed")
                    }
                    Err(_) => {
                        debug!(peer = %peer_addr, sni = %name, "TLS handshake timed out")
                    }
                }
            }
            DemuxMode::Http => self.serve_http1(replay, peer_addr).await,
        }
    }

    /// The `host:port` to splice to when `name` matches a passthrough route.
    fn passthrough_target(&self, name: &str, is_http: bool) -> Option<String> {
        let table = self.table.load();
        if !table.has_passthrough() {
            return None;
        }
        table
            .passthrough_for(name, is_http)
            .map(|(route, port)| format!("{}:{}", route.upstream_name, port))
    }

    /// Serves one terminated connection through the proxy engine.
    async fn serve_http1<S>(&self, stream: S, peer_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let engine = self.engine.clone();
        let service = service_fn(move |req| {
            let engine = engine.clone();
            async move { engine.handle(req, peer_addr).await }
        });

        if let Err(e) = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(io, service)
            .with_upgrades()
            .await
        {
            // Filter out common benign errors.
            let message = e.to_string();
            if !message.contains("connection closed")
                && !message.contains("broken pipe")
                && !message.contains("reset by peer")
            {
                debug!(peer = %peer_addr, error = %e, "Connection error");
            }
        }
    }
}
