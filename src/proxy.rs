//! Hyper-based reverse-proxy engine.
//!
//! The engine is the HTTP request handler behind every terminated listener.
//! Per request it consults the current routing table (a single keep-alive
//! connection may carry many hosts), answers redirects itself, and forwards
//! everything else to the matched backend over a shared upstream client:
//!
//! - Redirects get a `301` preserving path and raw query.
//! - Unmatched requests get `404 no route found`.
//! - Upstream failures get `502 Bad Gateway` with a short detail; nothing is
//!   retried.
//! - Connection upgrades (WebSocket) are written to the upstream directly
//!   and the two streams are spliced once the upstream answers `101`.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::uri::{Authority, PathAndQuery, Uri};
use http::{Request, Response, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::rt::{Read as RtRead, ReadBufCursor, Write as RtWrite};
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tower_service::Service;
use tracing::{debug, error};

use crate::manifest::Route;
use crate::pool::BufferPool;
use crate::router::RouterHandle;
use crate::splice;

/// Response body type used throughout the engine.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// The shared upstream client; one per process, pooled per authority.
pub type HttpClient = Client<CappedConnector, Incoming>;

/// Upstream connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// TCP keep-alive interval on upstream connections.
const KEEP_ALIVE: Duration = Duration::from_secs(30);
/// How long idle upstream connections are kept in the pool.
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);
/// Idle connections kept per upstream authority.
const MAX_IDLE_PER_HOST: usize = 100;
/// Upstream connections across all hosts combined; since pooled idle
/// connections hold their slot, the idle pool can never exceed this either.
const MAX_CONNS_TOTAL: usize = 100;
/// Upper bound on an upstream response head during an upgrade handshake.
const MAX_RESPONSE_HEAD: usize = 8192;

/// WebSocket headers strict upstreams expect in mixed-case form, keyed by
/// their case-insensitive name. Values and multiplicity are preserved; only
/// the spelling written to the upstream changes.
pub(crate) const SEC_WEBSOCKET_HEADERS: [(&str, &str); 5] = [
    ("sec-websocket-key", "Sec-WebSocket-Key"),
    ("sec-websocket-version", "Sec-WebSocket-Version"),
    ("sec-websocket-protocol", "Sec-WebSocket-Protocol"),
    ("sec-websocket-extensions", "Sec-WebSocket-Extensions"),
    ("sec-websocket-accept", "Sec-WebSocket-Accept"),
];

/// Hop-by-hop headers stripped from proxied requests and responses.
const HOP_BY_HOP_HEADERS: [HeaderName; 7] = [
    header::CONNECTION,
    HeaderName::from_static("proxy-connection"),
    HeaderName::from_static("keep-alive"),
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Which scheme the fronting listener speaks, used for redirect targets and
/// `X-Forwarded-Proto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerScheme {
    Http,
    Https,
}

impl ListenerScheme {
    fn as_str(self) -> &'static str {
        match self {
            ListenerScheme::Http => "http",
            ListenerScheme::Https => "https",
        }
    }
}

/// Builds the shared upstream client.
///
/// All engines forward through one client so upstream connections are pooled
/// process-wide: up to [`MAX_IDLE_PER_HOST`] idle per authority and
/// [`MAX_CONNS_TOTAL`] across all authorities combined.
pub fn build_client() -> HttpClient {
    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(CONNECT_TIMEOUT));
    connector.set_keepalive(Some(KEEP_ALIVE));
    connector.set_nodelay(true);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(IDLE_TIMEOUT)
        .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
        .http1_preserve_header_case(true)
        .build(CappedConnector::new(connector, MAX_CONNS_TOTAL))
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Connector enforcing the process-wide connection cap.
///
/// The client pool only caps idle connections per host; this wrapper makes
/// every established connection hold a semaphore permit for its lifetime,
/// released when the connection is dropped (the pool's idle eviction
/// included), so connections across all hosts never exceed the cap. Dials
/// beyond the cap wait for a slot.
#[derive(Clone, Debug)]
pub struct CappedConnector {
    inner: HttpConnector,
    permits: Arc<Semaphore>,
}

impl CappedConnector {
    fn new(inner: HttpConnector, cap: usize) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(cap)),
        }
    }
}

impl Service<Uri> for CappedConnector {
    type Response = CappedStream;
    type Error = BoxError;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<CappedStream, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), BoxError>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let permits = self.permits.clone();
        let connect = self.inner.call(dst);
        Box::pin(async move {
            // Claim the slot before dialing so the cap bounds sockets, not
            // just finished handshakes.
            let permit = permits
                .acquire_owned()
                .await
                .map_err(|e| Box::new(e) as BoxError)?;
            let stream = connect.await.map_err(|e| Box::new(e) as BoxError)?;
            Ok(CappedStream {
                inner: stream,
                _permit: permit,
            })
        })
    }
}

/// An upstream connection holding its slot in the process-wide cap.
pub struct CappedStream {
    inner: TokioIo<TcpStream>,
    _permit: OwnedSemaphorePermit,
}

impl RtRead for CappedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl RtWrite for CappedStream {
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

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }
}

impl Connection for CappedStream {
    fn connected(&self) -> Connected {
        self.inner.connected()
    }
}

/// Precomputed per-upstream forwarding state, cached by authority.
#[derive(Debug)]
struct Upstream {
    authority: Authority,
    host_header: HeaderValue,
}

impl Upstream {
    fn build(route: &Route) -> Option<Arc<Self>> {
        let authority: Authority = route.upstream_authority().parse().ok()?;
        let host_header = HeaderValue::from_str(authority.as_str()).ok()?;
        Some(Arc::new(Self {
            authority,
            host_header,
        }))
    }
}

/// The reverse-proxy request handler.
pub struct ProxyEngine {
    table: Arc<RouterHandle>,
    scheme: ListenerScheme,
    /// When set, every request is redirected to its HTTPS counterpart; used
    /// on the HTTP listener while TLS termination is on.
    https_redirect: bool,
    client: HttpClient,
    upstreams: RwLock<HashMap<String, Arc<Upstream>>>,
    copy_pool: Arc<BufferPool>,
}

impl ProxyEngine {
    /// Creates an engine serving requests from `table` behind a listener
    /// speaking `scheme`.
    pub fn new(
        table: Arc<RouterHandle>,
        scheme: ListenerScheme,
        client: HttpClient,
        copy_pool: Arc<BufferPool>,
    ) -> Self {
        Self {
            table,
            scheme,
            https_redirect: false,
            client,
            upstreams: RwLock::new(HashMap::new()),
            copy_pool,
        }
    }

    /// Turns the engine into an HTTPS-redirect responder for the `:80` side
    /// of a TLS-terminating deployment.
    pub fn with_https_redirect(mut self) -> Self {
        self.https_redirect = true;
        self
    }

    /// Drops all cached upstream state. Called when the routing table is
    /// replaced so stale authority bindings cannot survive a reload.
    pub fn clear_upstream_cache(&self) {
        self.upstreams
            .write()
            .expect("upstream cache lock poisoned")
            .clear();
    }

    /// Handles one inbound request.
    pub async fn handle(
        &self,
        mut req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>, hyper::Error> {
        let host = request_host(&req);

        if self.https_redirect {
            let target = match req.uri().path_and_query() {
                Some(pq) => format!("https://{host}{pq}"),
                None => format!("https://{host}/"),
            };
            return Ok(redirect_response(&target));
        }

        let table = self.table.load();

        if let Some(target) = table.redirect(&host) {
            let mut location = format!(
                "{}://{}{}",
                self.scheme.as_str(),
                target.host,
                req.uri().path()
            );
            if let Some(query) = req.uri().query() {
                location.push('?');
                location.push_str(query);
            }
            debug!(from = %host, location = %location, "Redirecting");
            return Ok(redirect_response(&location));
        }

        let Some(route) = table.match_route(&host, req.uri().path()) else {
            debug!(host = %host, path = %req.uri().path(), "No route found");
            return Ok(text_response(StatusCode::NOT_FOUND, "no route found"));
        };

        let outbound_path = rewrite_path(req.uri(), route);

        let Some(upstream) = self.upstream_for(route) else {
            error!(upstream = %route.upstream_authority(), "Invalid upstream authority");
            return Ok(bad_gateway(format_args!(
                "invalid upstream {}",
                route.upstream_authority()
            )));
        };

        let upgrade = upgrade_type(req.headers());
        strip_hop_by_hop(req.headers_mut());

        let host_header = if route.pass_host_header {
            HeaderValue::from_str(&host).unwrap_or_else(|_| upstream.host_header.clone())
        } else {
            upstream.host_header.clone()
        };
        set_forwarded_headers(req.headers_mut(), client_addr, &host, self.scheme);

        let response = match upgrade {
            Some(protocol) => {
                self.forward_upgrade(req, &upstream, outbound_path, host_header, &protocol)
                    .await
            }
            None => {
                self.forward(req, &upstream, outbound_path, host_header)
                    .await
            }
        };
        Ok(response)
    }

    /// Forwards a plain request through the pooled client.
    async fn forward(
        &self,
        mut req: Request<Incoming>,
        upstream: &Upstream,
        path: PathAndQuery,
        host_header: HeaderValue,
    ) -> Response<ProxyBody> {
        req.headers_mut().insert(header::HOST, host_header);

        let uri = match Uri::builder()
            .scheme("http")
            .authority(upstream.authority.clone())
            .path_and_query(path)
            .build()
        {
            Ok(uri) => uri,
            Err(e) => return bad_gateway(&e),
        };
        *req.uri_mut() = uri;

        match self.client.request(req).await {
            Ok(response) => {
                let mut response = response.map(BodyExt::boxed);
                strip_hop_by_hop(response.headers_mut());
                response
            }
            Err(e) => {
                error!(upstream = %upstream.authority, error = %e, "Upstream request failed");
                bad_gateway(&e)
            }
        }
    }

    /// Forwards a connection-upgrade request.
    ///
    /// The request head is written to a dedicated upstream connection with
    /// canonical `Sec-WebSocket-*` casing; on a `101` answer both streams
    /// are spliced with no further parsing.
    async fn forward_upgrade(
        &self,
        mut req: Request<Incoming>,
        upstream: &Upstream,
        path: PathAndQuery,
        host_header: HeaderValue,
        protocol: &str,
    ) -> Response<ProxyBody> {
        let client_upgrade = hyper::upgrade::on(&mut req);

        let mut upstream_stream = match timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect(upstream.authority.as_str()),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!(upstream = %upstream.authority, error = %e, "Upgrade dial failed");
                return bad_gateway(&e);
            }
            Err(_) => {
                error!(upstream = %upstream.authority, "Upgrade dial timed out");
                return bad_gateway(format_args!("dialing {} timed out", upstream.authority));
            }
        };

        let head = upgrade_request_head(&req, &path, &host_header, protocol);
        if let Err(e) = upstream_stream.write_all(&head).await {
            error!(upstream = %upstream.authority, error = %e, "Writing upgrade request failed");
            return bad_gateway(&e);
        }

        let (status, headers, buffered) = match read_response_head(&mut upstream_stream).await {
            Ok(parsed) => parsed,
            Err(e) => {
                error!(upstream = %upstream.authority, error = %e, "Reading upgrade response failed");
                return bad_gateway(&e);
            }
        };

        if status == StatusCode::SWITCHING_PROTOCOLS {
            let pool = self.copy_pool.clone();
            tokio::spawn(async move {
                match client_upgrade.await {
                    Ok(upgraded) => {
                        let mut client_io = TokioIo::new(upgraded);
                        if !buffered.is_empty() && client_io.write_all(&buffered).await.is_err() {
                            return;
                        }
                        let (up, down) = splice::join(client_io, upstream_stream, pool).await;
                        debug!(
                            client_to_upstream = up,
                            upstream_to_client = down,
                            "Tunnel closed"
                        );
                    }
                    Err(e) => debug!(error = %e, "Client-side upgrade failed"),
                }
            });

            let mut response = Response::builder()
                .status(StatusCode::SWITCHING_PROTOCOLS)
                .body(empty_body())
                .unwrap();
            *response.headers_mut() = headers;
            return response;
        }

        // The upstream declined to switch protocols; relay its answer.
        let body = match read_declined_body(&mut upstream_stream, &headers, buffered).await {
            Ok(body) => body,
            Err(e) => {
                error!(upstream = %upstream.authority, error = %e, "Reading upgrade refusal failed");
                return bad_gateway(&e);
            }
        };

        let mut response = Response::builder()
            .status(status)
            .body(full_body(body.into()))
            .unwrap();
        *response.headers_mut() = headers;
        strip_hop_by_hop(response.headers_mut());
        response
    }

    /// Returns the cached upstream entry for a route, creating it under a
    /// write lock on first use.
    fn upstream_for(&self, route: &Route) -> Option<Arc<Upstream>> {
        let key = route.upstream_authority();
        {
            let cache = self.upstreams.read().expect("upstream cache lock poisoned");
            if let Some(upstream) = cache.get(&key) {
                return Some(upstream.clone());
            }
        }

        let mut cache = self.upstreams.write().expect("upstream cache lock poisoned");
        // Double-check: another task may have built it while we waited.
        if let Some(upstream) = cache.get(&key) {
            return Some(upstream.clone());
        }
        let upstream = Upstream::build(route)?;
        cache.insert(key, upstream.clone());
        Some(upstream)
    }
}

/// The host a request is addressed to: URI authority first, `Host` header
/// otherwise. Any `:port` is kept; the routing table strips it.
fn request_host<B>(req: &Request<B>) -> String {
    if let Some(authority) = req.uri().authority() {
        return authority.as_str().to_string();
    }
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Applies prefix stripping to the request target, keeping the raw query.
fn rewrite_path(uri: &Uri, route: &Route) -> PathAndQuery {
    let path = uri.path();
    let stripped = if route.strip_prefix && route.path_prefix != "/" {
        let rest = path.strip_prefix(route.path_prefix.as_str()).unwrap_or(path);
        if rest.is_empty() {
            "/"
        } else {
            rest
        }
    } else {
        path
    };

    let target = match uri.query() {
        Some(query) => format!("{stripped}?{query}"),
        None => stripped.to_string(),
    };
    PathAndQuery::try_from(target).unwrap_or_else(|_| PathAndQuery::from_static("/"))
}

/// Detects a connection-upgrade request and returns the requested protocol.
fn upgrade_type(headers: &HeaderMap) -> Option<String> {
    let wants_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if !wants_upgrade {
        return None;
    }
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

/// Strips hop-by-hop headers: those named by `Connection` plus the standard
/// set. Upgrade-relevant headers are re-added explicitly on upgrade paths.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let connection_named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in connection_named {
        headers.remove(&name);
    }
    for name in &HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Sets the forwarding metadata on an outbound request.
fn set_forwarded_headers(
    headers: &mut HeaderMap,
    client_addr: SocketAddr,
    host: &str,
    scheme: ListenerScheme,
) {
    let client_ip = client_addr.ip().to_string();
    let forwarded_for = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{prior}, {client_ip}"),
        None => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Ok(value) = HeaderValue::from_str(host) {
        headers.insert(X_FORWARDED_HOST, value);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(scheme.as_str()));
}

/// Serializes an upgrade request head with canonical header casing.
fn upgrade_request_head<B>(
    req: &Request<B>,
    path: &PathAndQuery,
    host_header: &HeaderValue,
    protocol: &str,
) -> Vec<u8> {
    let mut head = Vec::with_capacity(512);
    head.extend_from_slice(format!("{} {} HTTP/1.1\r\n", req.method(), path).as_bytes());
    head.extend_from_slice(b"Host: ");
    head.extend_from_slice(host_header.as_bytes());
    head.extend_from_slice(b"\r\n");

    for (name, value) in req.headers() {
        if name == header::HOST {
            continue;
        }
        head.extend_from_slice(wire_header_name(name).as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }

    head.extend_from_slice(b"Connection: Upgrade\r\nUpgrade: ");
    head.extend_from_slice(protocol.as_bytes());
    head.extend_from_slice(b"\r\n\r\n");
    head
}

/// The spelling of a header name on the upstream wire.
///
/// `Sec-Websocket-*` spellings are renamed to the canonical `Sec-WebSocket-*`
/// form; everything else is title-cased per dash segment.
fn wire_header_name(name: &HeaderName) -> String {
    if let Some((_, canonical)) = SEC_WEBSOCKET_HEADERS
        .iter()
        .find(|(insensitive, _)| *insensitive == name.as_str())
    {
        return (*canonical).to_string();
    }
    title_case(name.as_str())
}

fn title_case(name: &str) -> String {
    name.split('-')
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Reads an HTTP/1.x response head from the upstream, returning the status,
/// headers, and any body bytes that arrived with the head.
async fn read_response_head(
    stream: &mut TcpStream,
) -> std::io::Result<(StatusCode, HeaderMap, Vec<u8>)> {
    use std::io::{Error, ErrorKind};

    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head_end = end + 4;
            let mut headers = [httparse::EMPTY_HEADER; 64];
            let mut parsed = httparse::Response::new(&mut headers);
            let status = match parsed.parse(&buf[..head_end]) {
                Ok(httparse::Status::Complete(_)) => {
                    let code = parsed
                        .code
                        .ok_or_else(|| Error::new(ErrorKind::InvalidData, "missing status"))?;
                    StatusCode::from_u16(code).map_err(|e| Error::new(ErrorKind::InvalidData, e))?
                }
                _ => return Err(Error::new(ErrorKind::InvalidData, "malformed response head")),
            };
            let mut map = HeaderMap::new();
            for h in parsed.headers.iter() {
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(h.name.as_bytes()),
                    HeaderValue::from_bytes(h.value),
                ) {
                    map.append(name, value);
                }
            }
            let leftover = buf.split_off(head_end);
            return Ok((status, map, leftover));
        }

        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(Error::new(ErrorKind::InvalidData, "response head too large"));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::new(
                ErrorKind::UnexpectedEof,
                "upstream closed before completing the response head",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Reads the body of a non-101 answer to an upgrade request.
///
/// Honors `Content-Length`, decodes `chunked`, and falls back to
/// read-to-close. The connection is dedicated and dropped afterwards.
async fn read_declined_body(
    stream: &mut TcpStream,
    headers: &HeaderMap,
    mut buffered: Vec<u8>,
) -> std::io::Result<Vec<u8>> {
    if let Some(length) = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
    {
        while buffered.len() < length {
            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            buffered.extend_from_slice(&chunk[..n]);
        }
        buffered.truncate(length);
        return Ok(buffered);
    }

    let chunked = headers
        .get(header::TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));
    if chunked {
        loop {
            if let Some(decoded) = decode_chunked(&buffered) {
                return Ok(decoded);
            }
            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                // Truncated chunked stream; salvage what decodes.
                return Ok(decode_chunked_partial(&buffered));
            }
            buffered.extend_from_slice(&chunk[..n]);
        }
    }

    // Close-delimited body.
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await?;
    buffered.extend_from_slice(&rest);
    Ok(buffered)
}

/// Decodes a complete chunked body; `None` while it is still incomplete.
fn decode_chunked(data: &[u8]) -> Option<Vec<u8>> {
    let mut decoded = Vec::new();
    let mut pos = 0;
    loop {
        let line_end = data[pos..].windows(2).position(|w| w == b"\r\n")? + pos;
        let size_str = std::str::from_utf8(&data[pos..line_end]).ok()?;
        let size = usize::from_str_radix(size_str.split(';').next()?.trim(), 16).ok()?;
        let chunk_start = line_end + 2;
        if size == 0 {
            return Some(decoded);
        }
        if chunk_start + size + 2 > data.len() {
            return None;
        }
        decoded.extend_from_slice(&data[chunk_start..chunk_start + size]);
        pos = chunk_start + size + 2;
    }
}

/// Best-effort decode of a truncated chunked body.
fn decode_chunked_partial(data: &[u8]) -> Vec<u8> {
    let mut decoded = Vec::new();
    let mut pos = 0;
    while let Some(offset) = data[pos..].windows(2).position(|w| w == b"\r\n") {
        let line_end = pos + offset;
        let Ok(size_str) = std::str::from_utf8(&data[pos..line_end]) else {
            break;
        };
        let Some(size) = size_str
            .split(';')
            .next()
            .and_then(|s| usize::from_str_radix(s.trim(), 16).ok())
        else {
            break;
        };
        let chunk_start = line_end + 2;
        if size == 0 || chunk_start + size > data.len() {
            break;
        }
        decoded.extend_from_slice(&data[chunk_start..chunk_start + size]);
        pos = chunk_start + size + 2;
        if pos > data.len() {
            break;
        }
    }
    decoded
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn full_body(data: Bytes) -> ProxyBody {
    Full::new(data).map_err(|never| match never {}).boxed()
}

fn redirect_response(location: &str) -> Response<ProxyBody> {
    let mut builder = Response::builder().status(StatusCode::MOVED_PERMANENTLY);
    if let Ok(value) = HeaderValue::from_str(location) {
        builder = builder.header(header::LOCATION, value);
    }
    builder.body(empty_body()).unwrap()
}

fn text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(Bytes::from(message.to_string())))
        .unwrap()
}

fn bad_gateway(detail: impl std::fmt::Display) -> Response<ProxyBody> {
    text_response(StatusCode::BAD_GATEWAY, &format!("Bad Gateway: {detail}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "203.0.113.7:51000".parse().unwrap()
    }

    #[test]
    fn websocket_header_set_is_pinned() {
        let expected = [
            ("sec-websocket-key", "Sec-WebSocket-Key"),
            ("sec-websocket-version", "Sec-WebSocket-Version"),
            ("sec-websocket-protocol", "Sec-WebSocket-Protocol"),
            ("sec-websocket-extensions", "Sec-WebSocket-Extensions"),
            ("sec-websocket-accept", "Sec-WebSocket-Accept"),
        ];
        assert_eq!(SEC_WEBSOCKET_HEADERS, expected);

        for (insensitive, canonical) in SEC_WEBSOCKET_HEADERS {
            let name = HeaderName::from_bytes(insensitive.as_bytes()).unwrap();
            assert_eq!(wire_header_name(&name), canonical);
        }
    }

    #[test]
    fn wire_names_are_title_cased() {
        let name = HeaderName::from_static("x-request-id");
        assert_eq!(wire_header_name(&name), "X-Request-Id");
        let name = HeaderName::from_static("authorization");
        assert_eq!(wire_header_name(&name), "Authorization");
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONNECTION,
            "keep-alive, x-custom-hop".parse().unwrap(),
        );
        headers.insert("x-custom-hop", "value".parse().unwrap());
        headers.insert("keep-alive", "timeout=5".parse().unwrap());
        headers.insert(header::TRANSFER_ENCODING, "chunked".parse().unwrap());
        headers.insert("x-keep-me", "yes".parse().unwrap());

        strip_hop_by_hop(&mut headers);

        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get("x-custom-hop").is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get(header::TRANSFER_ENCODING).is_none());
        assert_eq!(headers.get("x-keep-me").unwrap(), "yes");
    }

    #[test]
    fn upgrade_detection() {
        let mut headers = HeaderMap::new();
        assert!(upgrade_type(&headers).is_none());

        headers.insert(header::UPGRADE, "websocket".parse().unwrap());
        // Upgrade header without Connection: Upgrade is not an upgrade.
        assert!(upgrade_type(&headers).is_none());

        headers.insert(header::CONNECTION, "Upgrade".parse().unwrap());
        assert_eq!(upgrade_type(&headers).as_deref(), Some("websocket"));

        headers.insert(header::CONNECTION, "keep-alive, upgrade".parse().unwrap());
        assert_eq!(upgrade_type(&headers).as_deref(), Some("websocket"));
    }

    #[test]
    fn forwarded_headers_append_client() {
        let mut headers = HeaderMap::new();
        set_forwarded_headers(&mut headers, addr(), "example.com", ListenerScheme::Https);
        assert_eq!(headers.get(&X_FORWARDED_FOR).unwrap(), "203.0.113.7");
        assert_eq!(headers.get(&X_FORWARDED_HOST).unwrap(), "example.com");
        assert_eq!(headers.get(&X_FORWARDED_PROTO).unwrap(), "https");

        // A second proxy hop appends rather than replaces.
        set_forwarded_headers(&mut headers, addr(), "example.com", ListenerScheme::Http);
        assert_eq!(
            headers.get(&X_FORWARDED_FOR).unwrap(),
            "203.0.113.7, 203.0.113.7"
        );
        assert_eq!(headers.get(&X_FORWARDED_PROTO).unwrap(), "http");
    }

    #[test]
    fn rewrite_path_strips_prefix() {
        let route = Route {
            path_prefix: "/api".to_string(),
            strip_prefix: true,
            ..Route::default()
        };
        let uri: Uri = "http://example.com/api/users?q=1".parse().unwrap();
        assert_eq!(rewrite_path(&uri, &route).as_str(), "/users?q=1");

        let uri: Uri = "http://example.com/api".parse().unwrap();
        assert_eq!(rewrite_path(&uri, &route).as_str(), "/");
    }

    #[test]
    fn rewrite_path_without_strip() {
        let route = Route {
            path_prefix: "/api".to_string(),
            strip_prefix: false,
            ..Route::default()
        };
        let uri: Uri = "http://example.com/api/users".parse().unwrap();
        assert_eq!(rewrite_path(&uri, &route).as_str(), "/api/users");
    }

    #[test]
    fn rewrite_path_root_prefix_untouched() {
        let route = Route {
            path_prefix: "/".to_string(),
            strip_prefix: true,
            ..Route::default()
        };
        let uri: Uri = "http://example.com/users".parse().unwrap();
        assert_eq!(rewrite_path(&uri, &route).as_str(), "/users");
    }

    #[test]
    fn chunked_decoding() {
        let body = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        assert_eq!(decode_chunked(body).unwrap(), b"Wikipedia");

        // Incomplete stream is not yet decodable.
        let partial = b"4\r\nWiki\r\n5\r\npe";
        assert!(decode_chunked(partial).is_none());
        assert_eq!(decode_chunked_partial(partial), b"Wiki");
    }

    #[test]
    fn upgrade_head_canonicalizes_websocket_names() {
        let mut req = Request::builder()
            .method("GET")
            .uri("http://example.com/ws")
            .body(())
            .unwrap();
        req.headers_mut().insert(
            HeaderName::from_static("sec-websocket-key"),
            "dGhlIHNhbXBsZSBub25jZQ==".parse().unwrap(),
        );
        req.headers_mut().insert(
            HeaderName::from_static("sec-websocket-version"),
            "13".parse().unwrap(),
        );

        let path = PathAndQuery::from_static("/ws");
        let host = HeaderValue::from_static("backend:8080");
        let head = upgrade_request_head(&req, &path, &host, "websocket");
        let text = String::from_utf8(head).unwrap();

        assert!(text.starts_with("GET /ws HTTP/1.1\r\n"));
        assert!(text.contains("Host: backend:8080\r\n"));
        assert!(text.contains("Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n"));
        assert!(text.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(text.contains("Connection: Upgrade\r\nUpgrade: websocket\r\n"));
        assert!(!text.contains("Sec-Websocket-Key"));
    }

    #[tokio::test]
    async fn connection_cap_frees_slots_on_drop() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let uri: Uri = format!("http://{addr}").parse().unwrap();

        let mut connector = CappedConnector::new(HttpConnector::new(), 1);
        let first = connector.call(uri.clone()).await.unwrap();

        // The only slot is taken; a second dial parks until it frees.
        let mut second = connector.call(uri);
        assert!(timeout(Duration::from_millis(100), &mut second)
            .await
            .is_err());

        drop(first);
        timeout(Duration::from_secs(5), &mut second)
            .await
            .expect("slot was not released on drop")
            .unwrap();
    }

    #[test]
    fn request_host_prefers_authority() {
        let req = Request::builder()
            .uri("http://authority.example.com:8080/x")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req), "authority.example.com:8080");

        let mut req = Request::builder().uri("/x").body(()).unwrap();
        req.headers_mut()
            .insert(header::HOST, "header.example.com".parse().unwrap());
        assert_eq!(request_host(&req), "header.example.com");
    }

    #[test]
    fn error_responses() {
        let resp = bad_gateway("connection refused");
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);

        let resp = text_response(StatusCode::NOT_FOUND, "no route found");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = redirect_response("https://example.com/a?b=c");
        assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            resp.headers().get(header::LOCATION).unwrap(),
            "https://example.com/a?b=c"
        );
    }
}
