//! Route table: wildcard pattern matching, backend selection, path rewriting.
//!
//! Routes are declared in a JSON file and compiled once at load; matching
//! walks the table in declaration order and the first hit wins, so
//! administrators encode priority by listing more specific routes first.
//!
//! A pattern is a literal path with `*` wildcards. A trailing `/*` is
//! compiled to `(/.*)?` so `/api/users/*` matches both `/api/users` and
//! `/api/users/123`; any other `*` matches greedily. All other regex
//! metacharacters in the pattern are escaped.

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use regex::Regex;
use serde_json::Value;
use tracing::{info, warn};

/// Default backend call timeout when a route does not specify one.
pub const DEFAULT_ROUTE_TIMEOUT_MS: u64 = 5000;

/// How requests matching a route are spread across its backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBalancing {
    RoundRobin,
    Random,
    /// First backend always; also the fallback for unknown policy strings.
    Single,
}

impl LoadBalancing {
    fn parse(s: &str) -> Self {
        match s {
            "round_robin" => LoadBalancing::RoundRobin,
            "random" => LoadBalancing::Random,
            _ => LoadBalancing::Single,
        }
    }
}

/// One route entry, immutable after load.
#[derive(Debug)]
pub struct Route {
    /// Original pattern string, kept for logs and admin output.
    pub pattern: String,
    matcher: Regex,
    pub backends: Vec<String>,
    pub load_balancing: LoadBalancing,
    pub timeout_ms: u64,
    pub require_auth: bool,
    pub strip_prefix: String,
    /// Non-empty marks an internally handled route with no backends.
    pub handler: String,
    /// Per-route cache TTL override, seconds.
    pub cache_ttl: Option<u64>,
}

/// A successful match: the route, the chosen backend, and the path the
/// backend will see.
#[derive(Debug)]
pub struct RouteMatch<'a> {
    pub route: &'a Route,
    pub backend_url: Option<String>,
    pub rewritten_path: String,
}

/// Ordered route table with per-route round-robin cursors.
///
/// The cursors are the only mutable state; each advances atomically exactly
/// once per round-robin match, so n concurrent matches dispense n
/// consecutive backends.
pub struct RouteTable {
    routes: Vec<Route>,
    cursors: Vec<AtomicUsize>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            cursors: Vec::new(),
        }
    }

    /// Build a table from a `{"routes": [...]}` document.
    ///
    /// Invalid entries are logged and skipped; an unloadable entry must not
    /// take the gateway down with it.
    pub fn from_json(value: &Value) -> Self {
        let mut table = Self::new();

        let Some(entries) = value.get("routes").and_then(Value::as_array) else {
            warn!("Routes document has no top-level \"routes\" array");
            return table;
        };

        for entry in entries {
            match parse_route(entry) {
                Ok(route) => table.add_route(route),
                Err(reason) => {
                    warn!(entry = %entry, reason, "Skipping invalid route entry");
                }
            }
        }

        info!(count = table.len(), "Route table loaded");
        table
    }

    pub fn add_route(&mut self, route: Route) {
        self.routes.push(route);
        self.cursors.push(AtomicUsize::new(0));
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Every distinct backend URL across the table, for the health checker.
    pub fn all_backends(&self) -> Vec<String> {
        let mut backends: Vec<String> = self
            .routes
            .iter()
            .flat_map(|r| r.backends.iter().cloned())
            .collect();
        backends.sort();
        backends.dedup();
        backends
    }

    /// First route whose compiled matcher accepts the full path.
    pub fn match_route(&self, path: &str) -> Option<RouteMatch<'_>> {
        for (index, route) in self.routes.iter().enumerate() {
            if route.matcher.is_match(path) {
                let backend_url = if route.handler.is_empty() {
                    Some(self.select_backend(index))
                } else {
                    None
                };
                return Some(RouteMatch {
                    route,
                    backend_url,
                    rewritten_path: rewrite_path(path, route),
                });
            }
        }
        None
    }

    fn select_backend(&self, index: usize) -> String {
        let route = &self.routes[index];
        if route.backends.len() == 1 {
            return route.backends[0].clone();
        }

        match route.load_balancing {
            LoadBalancing::RoundRobin => {
                let cursor = self.cursors[index].fetch_add(1, Ordering::Relaxed);
                route.backends[cursor % route.backends.len()].clone()
            }
            LoadBalancing::Random => {
                let pick = rand::rng().random_range(0..route.backends.len());
                route.backends[pick].clone()
            }
            LoadBalancing::Single => route.backends[0].clone(),
        }
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_route(entry: &Value) -> Result<Route, &'static str> {
    let pattern = entry
        .get("path")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if pattern.is_empty() {
        return Err("missing path");
    }

    let mut backends = Vec::new();
    if let Some(backend) = entry.get("backend").and_then(Value::as_str) {
        backends.push(backend.to_string());
    } else if let Some(list) = entry.get("backends").and_then(Value::as_array) {
        backends.extend(list.iter().filter_map(Value::as_str).map(String::from));
    }

    let handler = entry
        .get("handler")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    // A route must lead somewhere: either a backend list or an internal
    // handler tag.
    if handler.is_empty() && backends.is_empty() {
        return Err("no backends and no handler");
    }

    let matcher = pattern_to_regex(pattern).map_err(|_| "unparseable pattern")?;

    Ok(Route {
        pattern: pattern.to_string(),
        matcher,
        backends,
        load_balancing: LoadBalancing::parse(
            entry
                .get("load_balancing")
                .and_then(Value::as_str)
                .unwrap_or("round_robin"),
        ),
        timeout_ms: entry
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_ROUTE_TIMEOUT_MS),
        require_auth: entry
            .get("require_auth")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        strip_prefix: entry
            .get("strip_prefix")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        handler,
        cache_ttl: entry.get("cache_ttl").and_then(Value::as_u64),
    })
}

/// Compile a wildcard pattern into an anchored regex.
fn pattern_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut escaped = String::with_capacity(pattern.len() + 8);
    for c in pattern.chars() {
        match c {
            '.' | '^' | '$' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '\\' => {
                escaped.push('\\');
                escaped.push(c);
            }
            _ => escaped.push(c),
        }
    }

    // Trailing /* is optional so the bare prefix also matches.
    let translated = match escaped.strip_suffix("/*") {
        Some(stem) => format!("{}(/.*)?", stem.replace('*', ".*")),
        None => escaped.replace('*', ".*"),
    };

    Regex::new(&format!("^{translated}$"))
}

/// Strip the configured prefix and re-anchor the remainder at `/`.
fn rewrite_path(path: &str, route: &Route) -> String {
    let mut rewritten = if !route.strip_prefix.is_empty() {
        match path.strip_prefix(route.strip_prefix.as_str()) {
            Some(rest) => rest.to_string(),
            None => path.to_string(),
        }
    } else {
        path.to_string()
    };

    if !rewritten.starts_with('/') {
        rewritten.insert(0, '/');
    }
    rewritten
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table(routes: Value) -> RouteTable {
        RouteTable::from_json(&json!({ "routes": routes }))
    }

    #[test]
    fn test_wildcard_matches_prefix_and_children() {
        let t = table(json!([
            {"path": "/api/users/*", "backend": "http://b:3000"}
        ]));

        let m = t.match_route("/api/users").unwrap();
        assert_eq!(m.backend_url.as_deref(), Some("http://b:3000"));

        let m = t.match_route("/api/users/123/profile").unwrap();
        assert_eq!(m.backend_url.as_deref(), Some("http://b:3000"));

        assert!(t.match_route("/api/products").is_none());
    }

    #[test]
    fn test_first_declared_match_wins() {
        let t = table(json!([
            {"path": "/api/users/admin", "backend": "http://admin:1"},
            {"path": "/api/users/*", "backend": "http://users:1"}
        ]));

        let m = t.match_route("/api/users/admin").unwrap();
        assert_eq!(m.backend_url.as_deref(), Some("http://admin:1"));

        let m = t.match_route("/api/users/42").unwrap();
        assert_eq!(m.backend_url.as_deref(), Some("http://users:1"));
    }

    #[test]
    fn test_round_robin_cycles_all_backends() {
        let t = table(json!([
            {"path": "/api/*", "backends": ["http://a:1", "http://b:1", "http://c:1"],
             "load_balancing": "round_robin"}
        ]));

        let picks: Vec<String> = (0..6)
            .map(|_| t.match_route("/api/x").unwrap().backend_url.unwrap())
            .collect();

        // Any n consecutive picks cover all n backends, and the sequence
        // repeats with period n.
        for i in 0..3 {
            assert_eq!(picks[i], picks[i + 3]);
        }
        let mut first_cycle = picks[..3].to_vec();
        first_cycle.sort();
        assert_eq!(first_cycle, vec!["http://a:1", "http://b:1", "http://c:1"]);
    }

    #[test]
    fn test_single_policy_always_first_backend() {
        let t = table(json!([
            {"path": "/api/*", "backends": ["http://a:1", "http://b:1"],
             "load_balancing": "single"}
        ]));
        for _ in 0..4 {
            assert_eq!(
                t.match_route("/api/x").unwrap().backend_url.as_deref(),
                Some("http://a:1")
            );
        }
    }

    #[test]
    fn test_unknown_policy_falls_back_to_first_backend() {
        let t = table(json!([
            {"path": "/api/*", "backends": ["http://a:1", "http://b:1"],
             "load_balancing": "least_connections"}
        ]));
        assert_eq!(
            t.match_route("/api/x").unwrap().backend_url.as_deref(),
            Some("http://a:1")
        );
    }

    #[test]
    fn test_random_policy_draws_from_configured_backends() {
        let t = table(json!([
            {"path": "/api/*", "backends": ["http://a:1", "http://b:1"],
             "load_balancing": "random"}
        ]));
        for _ in 0..20 {
            let picked = t.match_route("/api/x").unwrap().backend_url.unwrap();
            assert!(picked == "http://a:1" || picked == "http://b:1");
        }
    }

    #[test]
    fn test_strip_prefix_rewrites_path() {
        let t = table(json!([
            {"path": "/api/users/*", "backend": "http://b:1", "strip_prefix": "/api"}
        ]));

        let m = t.match_route("/api/users/123").unwrap();
        assert_eq!(m.rewritten_path, "/users/123");
    }

    #[test]
    fn test_strip_entire_path_reanchors_at_root() {
        let t = table(json!([
            {"path": "/api/*", "backend": "http://b:1", "strip_prefix": "/api"}
        ]));

        let m = t.match_route("/api").unwrap();
        assert_eq!(m.rewritten_path, "/");
    }

    #[test]
    fn test_no_strip_prefix_passes_path_through() {
        let t = table(json!([
            {"path": "/api/users/*", "backend": "http://b:1"}
        ]));
        let m = t.match_route("/api/users/7").unwrap();
        assert_eq!(m.rewritten_path, "/api/users/7");
    }

    #[test]
    fn test_metacharacters_in_pattern_are_literal() {
        let t = table(json!([
            {"path": "/api/v1.0/*", "backend": "http://b:1"}
        ]));
        assert!(t.match_route("/api/v1.0/things").is_some());
        // "." must not act as a regex wildcard.
        assert!(t.match_route("/api/v1x0/things").is_none());
    }

    #[test]
    fn test_interior_wildcard() {
        let t = table(json!([
            {"path": "/files/*/download", "backend": "http://b:1"}
        ]));
        assert!(t.match_route("/files/abc/download").is_some());
        assert!(t.match_route("/files/abc/view").is_none());
    }

    #[test]
    fn test_internal_handler_route_selects_no_backend() {
        let t = table(json!([
            {"path": "/status", "handler": "health"}
        ]));
        let m = t.match_route("/status").unwrap();
        assert!(m.backend_url.is_none());
        assert_eq!(m.route.handler, "health");
    }

    #[test]
    fn test_invalid_entries_are_skipped_not_fatal() {
        let t = table(json!([
            {"path": "", "backend": "http://b:1"},
            {"path": "/orphan"},
            {"path": "/ok", "backend": "http://b:1"}
        ]));
        assert_eq!(t.len(), 1);
        assert!(t.match_route("/ok").is_some());
    }

    #[test]
    fn test_route_defaults() {
        let t = table(json!([{"path": "/x", "backend": "http://b:1"}]));
        let route = &t.routes()[0];
        assert_eq!(route.timeout_ms, DEFAULT_ROUTE_TIMEOUT_MS);
        assert!(!route.require_auth);
        assert_eq!(route.load_balancing, LoadBalancing::RoundRobin);
        assert!(route.cache_ttl.is_none());
    }

    #[test]
    fn test_all_backends_deduplicates() {
        let t = table(json!([
            {"path": "/a/*", "backends": ["http://a:1", "http://b:1"]},
            {"path": "/b/*", "backends": ["http://b:1", "http://c:1"]}
        ]));
        assert_eq!(
            t.all_backends(),
            vec!["http://a:1", "http://b:1", "http://c:1"]
        );
    }

    #[test]
    fn test_no_routes_document() {
        let t = RouteTable::from_json(&json!({"not_routes": []}));
        assert!(t.is_empty());
        assert!(t.match_route("/anything").is_none());
    }
}
