//! TLS termination glue: certificate resolution by SNI.
//!
//! Certificates are acquired and renewed by an external ACME process that
//! drops them into a cache directory as `<hostname>.pem` files holding the
//! certificate chain followed by the private key. [`CertStore`] resolves a
//! server certificate per ClientHello from that directory, restricted to the
//! names the routing table currently serves; the allowed set is refreshed on
//! every reload.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tokio_rustls::rustls::crypto::aws_lc_rs::sign::any_supported_type;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::rustls::ServerConfig;
use tracing::{debug, warn};

use crate::error::{ProxyError, Result};

/// SNI-keyed certificate source backed by a PEM cache directory.
pub struct CertStore {
    cert_dir: PathBuf,
    allowed: RwLock<HashSet<String>>,
    cache: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl CertStore {
    /// Creates a store over `cert_dir` serving the given names.
    ///
    /// `hosts` is the output of the routing table's host enumeration:
    /// literal names, wildcard patterns, and redirect sources.
    pub fn new(cert_dir: impl Into<PathBuf>, hosts: Vec<String>) -> Self {
        Self {
            cert_dir: cert_dir.into(),
            allowed: RwLock::new(hosts.into_iter().collect()),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Replaces the set of names certificates may be served for.
    ///
    /// Called after every routing-table reload. Cached keys for names no
    /// longer served are dropped as well.
    pub fn set_allowed_hosts(&self, hosts: Vec<String>) {
        let hosts: HashSet<String> = hosts.into_iter().collect();
        {
            let mut cache = self.cache.write().expect("cert cache lock poisoned");
            cache.retain(|name, _| hosts.contains(name));
        }
        *self.allowed.write().expect("allowed hosts lock poisoned") = hosts;
    }

    /// Whether `name` is covered by a literal entry or a wildcard pattern.
    fn allows(&self, name: &str) -> bool {
        let allowed = match self.allowed.read() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        if allowed.contains(name) {
            return true;
        }
        match name.find('.') {
            Some(idx) => allowed.contains(&format!("*{}", &name[idx..])),
            None => false,
        }
    }

    /// Loads the certified key for `name`, consulting the cache first.
    pub(crate) fn lookup(&self, name: &str) -> Option<Arc<CertifiedKey>> {
        if let Some(key) = self.cache.read().ok()?.get(name) {
            return Some(key.clone());
        }

        match self.load_pem(name) {
            Ok(key) => {
                let key = Arc::new(key);
                if let Ok(mut cache) = self.cache.write() {
                    cache.insert(name.to_string(), key.clone());
                }
                Some(key)
            }
            Err(e) => {
                warn!(host = %name, error = %e, "No usable certificate");
                None
            }
        }
    }

    /// Reads `<cert_dir>/<name>.pem` into a certified key.
    fn load_pem(&self, name: &str) -> Result<CertifiedKey> {
        let path = self.cert_dir.join(format!("{name}.pem"));
        let file = File::open(&path)?;
        let mut reader = BufReader::new(file);

        let mut chain: Vec<CertificateDer<'static>> = Vec::new();
        let mut key: Option<PrivateKeyDer<'static>> = None;
        for item in rustls_pemfile::read_all(&mut reader) {
            match item.map_err(|e| ProxyError::certificate(name, e.to_string()))? {
                rustls_pemfile::Item::X509Certificate(cert) => chain.push(cert),
                rustls_pemfile::Item::Pkcs8Key(k) => key = Some(PrivateKeyDer::Pkcs8(k)),
                rustls_pemfile::Item::Pkcs1Key(k) => key = Some(PrivateKeyDer::Pkcs1(k)),
                rustls_pemfile::Item::Sec1Key(k) => key = Some(PrivateKeyDer::Sec1(k)),
                _ => {}
            }
        }

        if chain.is_empty() {
            return Err(ProxyError::certificate(name, "no certificate in PEM file"));
        }
        let key = key.ok_or_else(|| ProxyError::certificate(name, "no private key in PEM file"))?;
        let signing_key = any_supported_type(&key)
            .map_err(|e| ProxyError::certificate(name, e.to_string()))?;

        Ok(CertifiedKey::new(chain, signing_key))
    }
}

impl fmt::Debug for CertStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertStore")
            .field("cert_dir", &self.cert_dir)
            .finish_non_exhaustive()
    }
}

impl ResolvesServerCert for CertStore {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?;
        if !self.allows(name) {
            debug!(host = %name, "Rejecting TLS handshake for unknown host");
            return None;
        }
        self.lookup(name)
    }
}

/// Builds the rustls server configuration around a certificate store.
pub fn server_config(store: Arc<CertStore>) -> Arc<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(store);
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_self_signed(dir: &std::path::Path, host: &str) {
        let cert = rcgen::generate_simple_self_signed(vec![host.to_string()]).unwrap();
        let pem = format!("{}{}", cert.cert.pem(), cert.key_pair.serialize_pem());
        let mut file = File::create(dir.join(format!("{host}.pem"))).unwrap();
        file.write_all(pem.as_bytes()).unwrap();
    }

    #[test]
    fn loads_certificate_from_cache_dir() {
        let dir = tempfile::tempdir().unwrap();
        write_self_signed(dir.path(), "example.com");

        let store = CertStore::new(dir.path(), vec!["example.com".to_string()]);
        let key = store.lookup("example.com").unwrap();
        assert!(!key.cert.is_empty());

        // Second lookup is served from the in-memory cache.
        assert!(store.lookup("example.com").is_some());
    }

    #[test]
    fn missing_certificate_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertStore::new(dir.path(), vec!["example.com".to_string()]);
        assert!(store.lookup("example.com").is_none());
    }

    #[test]
    fn allowed_hosts_cover_wildcards() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertStore::new(
            dir.path(),
            vec!["example.com".to_string(), "*.tenant.com".to_string()],
        );

        assert!(store.allows("example.com"));
        assert!(store.allows("a.tenant.com"));
        assert!(!store.allows("a.b.tenant.com"));
        assert!(!store.allows("other.com"));
        assert!(!store.allows("localhost"));
    }

    #[test]
    fn reload_replaces_allowed_hosts_and_prunes_cache() {
        let dir = tempfile::tempdir().unwrap();
        write_self_signed(dir.path(), "old.com");

        let store = CertStore::new(dir.path(), vec!["old.com".to_string()]);
        assert!(store.lookup("old.com").is_some());

        store.set_allowed_hosts(vec!["new.com".to_string()]);
        assert!(!store.allows("old.com"));
        assert!(store.allows("new.com"));
        assert!(store.cache.read().unwrap().is_empty());
    }

    #[test]
    fn pem_without_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert = rcgen::generate_simple_self_signed(vec!["example.com".to_string()]).unwrap();
        let mut file = File::create(dir.path().join("example.com.pem")).unwrap();
        file.write_all(cert.cert.pem().as_bytes()).unwrap();

        let store = CertStore::new(dir.path(), vec!["example.com".to_string()]);
        assert!(store.lookup("example.com").is_none());
    }
}
