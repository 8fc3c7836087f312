//! Routing table and its atomically swappable handle.
//!
//! A [`RoutingTable`] is built once from a route sequence and never mutated
//! afterwards; reload builds a fresh table and publishes it through
//! [`RouterHandle`] with an atomic pointer swap. Readers load the current
//! table lock-free, so a request in flight keeps the table it started with
//! while new requests observe the replacement.
//!
//! Matching rules, in tie-breaking order: redirect before match, exact host
//! before wildcard host, longest path prefix within a group. Host comparison
//! is byte-exact after stripping a trailing `:port`; a wildcard pattern
//! `*.suffix` matches exactly one leading DNS label. Redirect-source
//! collisions resolve to the route listed last in the input sequence, not to
//! the match ordering.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::manifest::Route;

/// Immutable routing table indexing one route snapshot.
#[derive(Debug, Default)]
pub struct RoutingTable {
    /// Literal-host routes, longest path prefix first.
    exact: Vec<Route>,
    /// Wildcard-host routes, longest path prefix first.
    wildcard: Vec<Route>,
    /// Redirect source name to target route.
    redirects: HashMap<String, Route>,
    /// Whether any route wants raw passthrough.
    has_passthrough: bool,
}

impl RoutingTable {
    /// Builds a table from a route sequence.
    ///
    /// Routes are partitioned into exact and wildcard groups and each group
    /// is sorted by path-prefix length descending; the sort is stable, so
    /// routes with equally long prefixes keep their input order. Redirect
    /// sources are resolved against the sequence as received: when the same
    /// source appears on several routes, the route listed last wins, no
    /// matter where the groups place those routes for matching.
    pub fn new(routes: Vec<Route>) -> Self {
        // Built from the raw input order, before the match-order partition
        // and sort below can reorder routes.
        let mut redirects = HashMap::new();
        for route in &routes {
            for source in &route.redirect_from {
                redirects.insert(source.clone(), route.clone());
            }
        }

        let (mut exact, mut wildcard): (Vec<Route>, Vec<Route>) = routes
            .into_iter()
            .partition(|r| !r.host.starts_with("*."));

        exact.sort_by(|a, b| b.path_prefix.len().cmp(&a.path_prefix.len()));
        wildcard.sort_by(|a, b| b.path_prefix.len().cmp(&a.path_prefix.len()));

        let has_passthrough = exact
            .iter()
            .chain(wildcard.iter())
            .any(|r| r.passthrough);

        Self {
            exact,
            wildcard,
            redirects,
            has_passthrough,
        }
    }

    /// Finds the route for a request using longest-prefix matching.
    ///
    /// Exact hosts are consulted first; when none match and the host
    /// contains a dot, the wildcard pattern covering it is tried.
    pub fn match_route(&self, host: &str, path: &str) -> Option<&Route> {
        let host = strip_port(host);
        let path = if path.is_empty() { "/" } else { path };

        if let Some(route) = find_route(&self.exact, host, path) {
            return Some(route);
        }
        if let Some(pattern) = wildcard_pattern(host) {
            return find_route(&self.wildcard, &pattern, path);
        }
        None
    }

    /// Looks up the redirect target for a host, if any.
    pub fn redirect(&self, host: &str) -> Option<&Route> {
        self.redirects.get(strip_port(host))
    }

    /// Finds a passthrough route for a host, ignoring paths.
    ///
    /// Returns the route together with the port to dial: the HTTP override
    /// port when `is_http` is set and the route has one, the regular
    /// upstream port otherwise.
    pub fn passthrough_for(&self, host: &str, is_http: bool) -> Option<(&Route, u16)> {
        let host = strip_port(host);
        let route = self
            .exact
            .iter()
            .find(|r| r.passthrough && r.host == host)
            .or_else(|| {
                wildcard_pattern(host).and_then(|pattern| {
                    self.wildcard
                        .iter()
                        .find(|r| r.passthrough && r.host == pattern)
                })
            })?;

        let port = if is_http {
            route.upstream_http_port.unwrap_or(route.upstream_port)
        } else {
            route.upstream_port
        };
        Some((route, port))
    }

    /// All names this table serves: literal hosts, wildcard patterns, and
    /// redirect sources, each exactly once, sorted ascending. Used to decide
    /// which names certificates may be issued for.
    pub fn hosts(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        for route in self.exact.iter().chain(self.wildcard.iter()) {
            names.insert(route.host.clone());
            for source in &route.redirect_from {
                names.insert(source.clone());
            }
        }
        names.into_iter().collect()
    }

    /// Whether any route is configured for raw passthrough.
    pub fn has_passthrough(&self) -> bool {
        self.has_passthrough
    }

    /// All routes in match order, exact before wildcard.
    pub fn routes(&self) -> impl Iterator<Item = &Route> + '_ {
        self.exact.iter().chain(self.wildcard.iter())
    }
}

fn find_route<'a>(routes: &'a [Route], host: &str, path: &str) -> Option<&'a Route> {
    routes
        .iter()
        .find(|r| r.host == host && matches_path_prefix(path, &r.path_prefix))
}

/// Strips a trailing `:<digits>` port from a host.
fn strip_port(host: &str) -> &str {
    match host.rfind(':') {
        Some(idx)
            if idx + 1 < host.len()
                && host[idx + 1..].bytes().all(|b| b.is_ascii_digit()) =>
        {
            &host[..idx]
        }
        _ => host,
    }
}

/// The wildcard pattern that would cover `host`, e.g. `*.example.com` for
/// `www.example.com`. `None` when the host has no dot.
fn wildcard_pattern(host: &str) -> Option<String> {
    host.find('.').map(|idx| format!("*{}", &host[idx..]))
}

/// Path-boundary prefix check: `/api` matches `/api`, `/api/`, `/api/users`
/// but not `/apiv2`.
fn matches_path_prefix(path: &str, prefix: &str) -> bool {
    if !path.starts_with(prefix) {
        return false;
    }
    if prefix == "/" || prefix.ends_with('/') {
        return true;
    }
    if path.len() == prefix.len() {
        return true;
    }
    path.as_bytes()[prefix.len()] == b'/'
}

/// Shared handle to the currently published routing table.
///
/// `load` is lock-free and safe under arbitrary reader parallelism; `store`
/// atomically replaces the table, and the swap happens-before the next load
/// that observes it.
#[derive(Debug)]
pub struct RouterHandle {
    table: ArcSwap<RoutingTable>,
}

impl RouterHandle {
    /// Creates a handle publishing `table`.
    pub fn new(table: RoutingTable) -> Self {
        Self {
            table: ArcSwap::from_pointee(table),
        }
    }

    /// Returns the current table.
    pub fn load(&self) -> Arc<RoutingTable> {
        self.table.load_full()
    }

    /// Atomically replaces the published table.
    pub fn store(&self, table: RoutingTable) {
        self.table.store(Arc::new(table));
    }
}
