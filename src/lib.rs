//! # Gangway
//!
//! A lightweight L4/L7 reverse proxy that routes TCP connections and
//! HTTP(S) requests to backend services according to labels on a compose
//! manifest.
//!
//! ## Features
//!
//! - **Host and path routing**: longest-prefix matching with single-label
//!   wildcard hosts and a separate redirect map
//! - **SNI passthrough**: TLS connections for marked hosts are spliced raw
//!   to the backend without termination
//! - **TLS termination**: certificates resolved per SNI from an
//!   ACME-managed cache directory
//! - **Hot reload**: the routing table is replaced atomically on manifest
//!   changes without dropping in-flight connections
//! - **WebSocket support**: connection upgrades are tunneled, with header
//!   casing normalized for strict backends
//!
//! ## Modules
//!
//! - [`config`]: environment-driven bootstrap configuration
//! - [`demux`]: per-listener connection demultiplexing
//! - [`error`]: error types and handling
//! - [`logging`]: logging setup
//! - [`manifest`]: compose label parsing into routes
//! - [`peek`]: SNI and Host extraction from peeked bytes
//! - [`pool`]: shared buffer pools
//! - [`proxy`]: the reverse-proxy engine
//! - [`replay`]: replaying peeked bytes in front of a connection
//! - [`router`]: the routing table and its atomic handle
//! - [`splice`]: raw bidirectional forwarding
//! - [`tls`]: SNI-keyed certificate resolution
//! - [`watcher`]: manifest change watching

pub mod config;
pub mod demux;
pub mod error;
pub mod logging;
pub mod manifest;
pub mod peek;
pub mod pool;
pub mod proxy;
pub mod replay;
pub mod router;
pub mod splice;
pub mod tls;
pub mod watcher;

pub use config::AppConfig;
pub use demux::Demux;
pub use error::{ProxyError, Result};
pub use manifest::Route;
pub use proxy::{ListenerScheme, ProxyEngine};
pub use router::{RouterHandle, RoutingTable};
pub use tls::CertStore;
