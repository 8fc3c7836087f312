//! Gangway entry point.
//!
//! Bootstrap order: environment config, logging, manifest parse, routing
//! table, listeners. After startup the process reacts to manifest changes
//! (when watching is enabled) and to SIGHUP by re-parsing the manifest and
//! atomically publishing a fresh routing table; SIGINT/SIGTERM exit.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};

use gangway::config::AppConfig;
use gangway::demux::Demux;
use gangway::manifest;
use gangway::pool::{BufferPool, COPY_BUF_SIZE, PEEK_BUF_SIZE};
use gangway::proxy::{self, ListenerScheme, ProxyEngine};
use gangway::router::{RouterHandle, RoutingTable};
use gangway::tls::{self, CertStore};
use gangway::watcher;

/// Everything a reload touches: re-parse the manifest, publish the new
/// table, drop engine caches, refresh the certificate host policy.
struct Reloader {
    manifest_path: PathBuf,
    handle: Arc<RouterHandle>,
    cert_store: Option<Arc<CertStore>>,
    engines: Vec<Arc<ProxyEngine>>,
}

impl Reloader {
    fn run(&self) {
        let routes = match manifest::parse_file(&self.manifest_path) {
            Ok(routes) => routes,
            Err(e) => {
                // Keep serving the previous table.
                error!(error = %e, "Reload failed");
                return;
            }
        };
        let table = RoutingTable::new(routes);
        log_routes(&table);
        let hosts = table.hosts();
        self.handle.store(table);
        for engine in &self.engines {
            engine.clear_upstream_cache();
        }
        if let Some(cert_store) = &self.cert_store {
            cert_store.set_allowed_hosts(hosts);
        }
        info!("Routes reloaded");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from a .env file when present.
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: failed to load .env file: {e}");
        }
    }

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let _log_guard = match gangway::logging::init_logging(&config.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        manifest = %config.manifest_path.display(),
        http_port = config.http_port,
        https_enabled = config.https_enabled,
        watch = config.watch,
        "Starting gangway"
    );

    let routes = match manifest::parse_file(&config.manifest_path) {
        Ok(routes) => routes,
        Err(e) => {
            error!(error = %e, "Failed to parse manifest");
            std::process::exit(1);
        }
    };
    let table = RoutingTable::new(routes);
    log_routes(&table);

    let initial_hosts = table.hosts();
    let handle = Arc::new(RouterHandle::new(table));

    let peek_pool = Arc::new(BufferPool::new(PEEK_BUF_SIZE));
    let copy_pool = Arc::new(BufferPool::new(COPY_BUF_SIZE));
    let client = proxy::build_client();

    let cert_store = config
        .https_enabled
        .then(|| Arc::new(CertStore::new(&config.cert_dir, initial_hosts)));

    let mut servers = JoinSet::new();
    let mut engines: Vec<Arc<ProxyEngine>> = Vec::new();

    if let Some(cert_store) = &cert_store {
        // TLS listener terminates and serves the proxy engine; the HTTP
        // listener redirects to HTTPS apart from passthrough routes.
        let https_engine = Arc::new(ProxyEngine::new(
            handle.clone(),
            ListenerScheme::Https,
            client.clone(),
            copy_pool.clone(),
        ));
        engines.push(https_engine.clone());

        let acceptor = TlsAcceptor::from(tls::server_config(cert_store.clone()));
        let https_listener = TcpListener::bind(("0.0.0.0", config.https_port)).await?;
        let demux = Arc::new(Demux::tls(
            handle.clone(),
            https_engine,
            acceptor,
            peek_pool.clone(),
            copy_pool.clone(),
        ));
        servers.spawn(demux.serve(https_listener));

        let redirect_engine = Arc::new(
            ProxyEngine::new(
                handle.clone(),
                ListenerScheme::Http,
                client.clone(),
                copy_pool.clone(),
            )
            .with_https_redirect(),
        );
        engines.push(redirect_engine.clone());

        let http_listener = TcpListener::bind(("0.0.0.0", config.http_port)).await?;
        let demux = Arc::new(Demux::http(
            handle.clone(),
            redirect_engine,
            peek_pool.clone(),
            copy_pool.clone(),
        ));
        servers.spawn(demux.serve(http_listener));
    } else {
        let http_engine = Arc::new(ProxyEngine::new(
            handle.clone(),
            ListenerScheme::Http,
            client.clone(),
            copy_pool.clone(),
        ));
        engines.push(http_engine.clone());

        let http_listener = TcpListener::bind(("0.0.0.0", config.http_port)).await?;
        let demux = Arc::new(Demux::http(
            handle.clone(),
            http_engine,
            peek_pool.clone(),
            copy_pool.clone(),
        ));
        servers.spawn(demux.serve(http_listener));
    }

    // Shared reload path for the watcher and SIGHUP.
    let reloader = Arc::new(Reloader {
        manifest_path: config.manifest_path.clone(),
        handle: handle.clone(),
        cert_store: cert_store.clone(),
        engines,
    });

    let _watcher = if config.watch {
        let reloader = reloader.clone();
        match watcher::watch(&config.manifest_path, move || reloader.run()) {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(error = %e, "Failed to start manifest watcher");
                None
            }
        }
    } else {
        None
    };

    let mut hangup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
    tokio::spawn({
        let reloader = reloader.clone();
        async move {
            while hangup.recv().await.is_some() {
                info!("SIGHUP received, reloading");
                reloader.run();
            }
        }
    });

    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        Some(result) = servers.join_next() => {
            match result {
                Ok(Err(e)) => error!(error = %e, "Listener failed"),
                Err(e) => error!(error = %e, "Listener task panicked"),
                Ok(Ok(())) => {}
            }
            std::process::exit(1);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
        _ = terminate.recv() => {
            info!("Shutting down");
        }
    }

    Ok(())
}

fn log_routes(table: &RoutingTable) {
    let mut count = 0;
    for route in table.routes() {
        count += 1;
        info!(
            host = %route.host,
            path = %route.path_prefix,
            upstream = %route.upstream_authority(),
            passthrough = route.passthrough,
            "Route"
        );
        if !route.redirect_from.is_empty() {
            info!(host = %route.host, redirect_from = ?route.redirect_from, "Redirects");
        }
    }
    info!(count, "Loaded routes");
}
