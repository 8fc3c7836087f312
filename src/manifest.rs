//! Route extraction from a compose manifest.
//!
//! Routing rules are declared as labels on compose services. A service
//! becomes a route when it carries both `gangway.host` and `gangway.port`;
//! the remaining labels are optional:
//!
//! ```yaml
//! services:
//!   api:
//!     image: example/api
//!     labels:
//!       gangway.host: "example.com"
//!       gangway.port: "8080"
//!       gangway.path: "/api"
//!       gangway.strip_prefix: "true"
//! ```
//!
//! Labels may be written as a YAML map or as a `key=value` list; both forms
//! are accepted. Services are visited in name order, so the resulting route
//! sequence is deterministic across reloads.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{ProxyError, Result};

/// Label marking the DNS name a service is reachable under.
pub const LABEL_HOST: &str = "gangway.host";
/// Label with the container port requests are forwarded to.
pub const LABEL_PORT: &str = "gangway.port";
/// Label with a path prefix the route is restricted to.
pub const LABEL_PATH: &str = "gangway.path";
/// Label with an override port for plain-HTTP passthrough traffic.
pub const LABEL_HTTP_PORT: &str = "gangway.http_port";
/// Label keeping the client's original Host header on forwarded requests.
pub const LABEL_PASS_HOST: &str = "gangway.passhost";
/// Label controlling path-prefix stripping (defaults to stripping).
pub const LABEL_STRIP_PREFIX: &str = "gangway.strip_prefix";
/// Label marking a service for raw TLS passthrough.
pub const LABEL_PASSTHROUGH: &str = "gangway.passthrough";
/// Label with a comma-separated list of domains to 301-redirect here.
pub const LABEL_REDIRECT_FROM: &str = "gangway.redirect_from";

/// A single routing rule extracted from service labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Literal DNS name or single-label wildcard (`*.example.com`).
    pub host: String,
    /// Path prefix the route matches, `/` by default.
    pub path_prefix: String,
    /// Backend service name.
    pub upstream_name: String,
    /// Backend port for HTTPS/TLS traffic and the HTTP default.
    pub upstream_port: u16,
    /// Override port for HTTP traffic under passthrough.
    pub upstream_http_port: Option<u16>,
    /// Preserve the client's Host header on the outbound request.
    pub pass_host_header: bool,
    /// Remove the path prefix before forwarding.
    pub strip_prefix: bool,
    /// Splice matching connections raw instead of terminating TLS.
    pub passthrough: bool,
    /// Domains that 301-redirect to this route's host.
    pub redirect_from: Vec<String>,
}

impl Default for Route {
    fn default() -> Self {
        Self {
            host: String::new(),
            path_prefix: "/".to_string(),
            upstream_name: String::new(),
            upstream_port: 0,
            upstream_http_port: None,
            pass_host_header: false,
            strip_prefix: false,
            passthrough: false,
            redirect_from: Vec::new(),
        }
    }
}

impl Route {
    /// The `host:port` authority of the backend for TLS traffic.
    pub fn upstream_authority(&self) -> String {
        format!("{}:{}", self.upstream_name, self.upstream_port)
    }
}

#[derive(Debug, Deserialize)]
struct ComposeFile {
    #[serde(default)]
    services: BTreeMap<String, ComposeService>,
}

#[derive(Debug, Default, Deserialize)]
struct ComposeService {
    #[serde(default)]
    labels: Labels,
}

/// Compose labels come in two shapes: a mapping or a `key=value` list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Labels {
    Map(BTreeMap<String, LabelValue>),
    List(Vec<String>),
}

impl Default for Labels {
    fn default() -> Self {
        Labels::Map(BTreeMap::new())
    }
}

/// Unquoted YAML label values may arrive as booleans or integers.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LabelValue {
    String(String),
    Bool(bool),
    Number(i64),
}

impl LabelValue {
    fn to_label_string(&self) -> String {
        match self {
            LabelValue::String(s) => s.clone(),
            LabelValue::Bool(b) => b.to_string(),
            LabelValue::Number(n) => n.to_string(),
        }
    }
}

impl Labels {
    fn get(&self, key: &str) -> Option<String> {
        match self {
            Labels::Map(map) => map.get(key).map(LabelValue::to_label_string),
            Labels::List(items) => items.iter().find_map(|item| {
                let (k, v) = item.split_once('=')?;
                (k == key).then(|| v.to_string())
            }),
        }
    }
}

/// Reads a compose file and extracts routes from labeled services.
pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<Vec<Route>> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ProxyError::ManifestNotFound {
            path: path.display().to_string(),
        });
    }
    let contents = fs::read_to_string(path)?;
    parse(&contents)
}

/// Parses compose YAML and extracts routes from labeled services.
pub fn parse(data: &str) -> Result<Vec<Route>> {
    let manifest: ComposeFile =
        serde_yaml::from_str(data).map_err(|e| ProxyError::manifest_parse(e.to_string()))?;

    let mut routes = Vec::new();
    for (name, service) in &manifest.services {
        if let Some(route) = extract_route(name, &service.labels)
            .map_err(|e| ProxyError::manifest_parse(format!("service {name}: {e}")))?
        {
            routes.push(route);
        }
    }
    Ok(routes)
}

/// Extracts a route from service labels; `None` when the service carries no
/// gangway labels at all.
fn extract_route(name: &str, labels: &Labels) -> std::result::Result<Option<Route>, String> {
    let host = labels.get(LABEL_HOST);
    let port = labels.get(LABEL_PORT);

    let (host, port) = match (host, port) {
        (None, None) => return Ok(None),
        (Some(_), None) => return Err(format!("missing required label {LABEL_PORT}")),
        (None, Some(_)) => return Err(format!("missing required label {LABEL_HOST}")),
        (Some(h), Some(p)) => (h, p),
    };

    let upstream_port: u16 = port
        .parse()
        .map_err(|_| format!("invalid port {port:?}"))?;

    let mut route = Route {
        host,
        upstream_name: name.to_string(),
        upstream_port,
        strip_prefix: true,
        ..Route::default()
    };

    if let Some(path) = labels.get(LABEL_PATH) {
        route.path_prefix = normalize_path_prefix(&path)?;
    }

    if let Some(http_port) = labels.get(LABEL_HTTP_PORT) {
        route.upstream_http_port = Some(
            http_port
                .parse()
                .map_err(|_| format!("invalid HTTP port {http_port:?}"))?,
        );
    }

    if let Some(passhost) = labels.get(LABEL_PASS_HOST) {
        route.pass_host_header = passhost == "true";
    }

    if let Some(strip) = labels.get(LABEL_STRIP_PREFIX) {
        route.strip_prefix = strip != "false";
    }

    if let Some(passthrough) = labels.get(LABEL_PASSTHROUGH) {
        route.passthrough = passthrough == "true";
    }

    if let Some(redirect_from) = labels.get(LABEL_REDIRECT_FROM) {
        route.redirect_from = redirect_from
            .split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_owned)
            .collect();
    }

    Ok(Some(route))
}

/// Path prefixes must start with `/`; a trailing `/` on a non-root prefix is
/// trimmed so that boundary matching owns the separator.
fn normalize_path_prefix(path: &str) -> std::result::Result<String, String> {
    if !path.starts_with('/') {
        return Err(format!("path prefix {path:?} must start with '/'"));
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        Ok("/".to_string())
    } else {
        Ok(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_labeled_service() {
        let yaml = r#"
services:
  api:
    image: example/api
    labels:
      gangway.host: "example.com"
      gangway.port: "8080"
      gangway.path: "/api"
      gangway.passhost: "true"
"#;
        let routes = parse(yaml).unwrap();
        assert_eq!(routes.len(), 1);
        let route = &routes[0];
        assert_eq!(route.host, "example.com");
        assert_eq!(route.upstream_name, "api");
        assert_eq!(route.upstream_port, 8080);
        assert_eq!(route.path_prefix, "/api");
        assert!(route.pass_host_header);
        assert!(route.strip_prefix); // default
        assert!(!route.passthrough);
    }

    #[test]
    fn unlabeled_services_are_skipped() {
        let yaml = r#"
services:
  db:
    image: postgres:16
  web:
    image: example/web
    labels:
      gangway.host: "example.com"
      gangway.port: "80"
"#;
        let routes = parse(yaml).unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].upstream_name, "web");
    }

    #[test]
    fn list_form_labels() {
        let yaml = r#"
services:
  web:
    labels:
      - "gangway.host=example.com"
      - "gangway.port=80"
      - "gangway.redirect_from=www.example.com, old.example.com"
"#;
        let routes = parse(yaml).unwrap();
        assert_eq!(routes[0].host, "example.com");
        assert_eq!(
            routes[0].redirect_from,
            vec!["www.example.com", "old.example.com"]
        );
    }

    #[test]
    fn unquoted_scalar_labels() {
        // YAML turns bare `true` and `8080` into non-string scalars.
        let yaml = r#"
services:
  mail:
    labels:
      gangway.host: mail.example.com
      gangway.port: 443
      gangway.http_port: 8080
      gangway.passthrough: true
"#;
        let routes = parse(yaml).unwrap();
        let route = &routes[0];
        assert_eq!(route.upstream_port, 443);
        assert_eq!(route.upstream_http_port, Some(8080));
        assert!(route.passthrough);
    }

    #[test]
    fn missing_counterpart_label_is_an_error() {
        let yaml = r#"
services:
  web:
    labels:
      gangway.host: "example.com"
"#;
        let err = parse(yaml).unwrap_err();
        assert!(err.to_string().contains("gangway.port"));

        let yaml = r#"
services:
  web:
    labels:
      gangway.port: "80"
"#;
        let err = parse(yaml).unwrap_err();
        assert!(err.to_string().contains("gangway.host"));
    }

    #[test]
    fn invalid_port_is_an_error() {
        let yaml = r#"
services:
  web:
    labels:
      gangway.host: "example.com"
      gangway.port: "http"
"#;
        assert!(parse(yaml).is_err());
    }

    #[test]
    fn strip_prefix_opt_out() {
        let yaml = r#"
services:
  web:
    labels:
      gangway.host: "example.com"
      gangway.port: "80"
      gangway.strip_prefix: "false"
"#;
        let routes = parse(yaml).unwrap();
        assert!(!routes[0].strip_prefix);
    }

    #[test]
    fn path_prefix_normalization() {
        assert_eq!(normalize_path_prefix("/api/").unwrap(), "/api");
        assert_eq!(normalize_path_prefix("/").unwrap(), "/");
        assert_eq!(normalize_path_prefix("/api/v2").unwrap(), "/api/v2");
        assert!(normalize_path_prefix("api").is_err());
    }

    #[test]
    fn services_visit_in_name_order() {
        let yaml = r#"
services:
  zeta:
    labels:
      gangway.host: "z.example.com"
      gangway.port: "80"
  alpha:
    labels:
      gangway.host: "a.example.com"
      gangway.port: "80"
"#;
        let routes = parse(yaml).unwrap();
        assert_eq!(routes[0].upstream_name, "alpha");
        assert_eq!(routes[1].upstream_name, "zeta");
    }

    #[test]
    fn wildcard_host_label() {
        let yaml = r#"
services:
  tenants:
    labels:
      gangway.host: "*.tenant.example.com"
      gangway.port: "3000"
"#;
        let routes = parse(yaml).unwrap();
        assert_eq!(routes[0].host, "*.tenant.example.com");
    }
}
