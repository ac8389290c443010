pub mod supervisor;

pub use supervisor::RouterSupervisor;

use crate::config::types::{Route, Upstream};
use crate::plugin::PluginInstance;
use crate::upstream::RouteCursor;
use std::collections::HashMap;
use std::sync::Arc;

/// A validated route with its materialized plugin chain and runtime
/// selection state. Immutable once published; in-flight requests hold
/// an `Arc` to the route they matched and are unaffected by rebuilds.
pub struct CompiledRoute {
    pub route: Route,
    pub upstreams: Vec<Arc<Upstream>>,
    /// Enabled plugins in declaration order. Disabled entries are
    /// dropped at compile time — pass-through costs nothing per request.
    pub plugins: Vec<Arc<PluginInstance>>,
    pub cursor: RouteCursor,
}

/// The published routing table: an ordered route list matched by
/// longest path prefix. Swapped atomically by the Router Supervisor.
pub struct RoutingTable {
    routes: Vec<Arc<CompiledRoute>>,
}

impl RoutingTable {
    pub fn new(routes: Vec<Arc<CompiledRoute>>) -> Self {
        Self { routes }
    }

    /// Longest-prefix match over the route list.
    pub fn match_route(&self, path: &str) -> Option<Arc<CompiledRoute>> {
        self.routes
            .iter()
            .filter(|r| prefix_matches(&r.route.path_prefix, path))
            .max_by_key(|r| r.route.path_prefix.len())
            .cloned()
    }

    pub fn routes(&self) -> &[Arc<CompiledRoute>] {
        &self.routes
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn prefixes(&self) -> Vec<String> {
        self.routes
            .iter()
            .map(|r| r.route.path_prefix.clone())
            .collect()
    }

    /// Distinct upstream origins with the probe path of the first route
    /// that references each.
    pub fn upstream_probe_paths(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        for compiled in &self.routes {
            for upstream in &compiled.upstreams {
                map.entry(upstream.origin.clone())
                    .or_insert_with(|| compiled.route.health_probe_path.clone());
            }
        }
        map
    }

    /// Whether this table was built from the same validated route model.
    pub fn same_model(&self, routes: &[Route]) -> bool {
        self.routes.len() == routes.len()
            && self
                .routes
                .iter()
                .zip(routes.iter())
                .all(|(compiled, route)| &compiled.route == route)
    }
}

/// A prefix matches on a path-segment boundary: `/api/products`
/// matches `/api/products` and `/api/products/42`, never
/// `/api/products42`.
fn prefix_matches(prefix: &str, path: &str) -> bool {
    if !path.starts_with(prefix) {
        return false;
    }
    path.len() == prefix.len()
        || prefix.ends_with('/')
        || path.as_bytes()[prefix.len()] == b'/'
}

/// Strip the matched prefix from the request path, keeping the query.
/// The forwarded path is always absolute.
pub fn rewrite_path(prefix: &str, path: &str, query: Option<&str>) -> String {
    let suffix = &path[prefix.len().min(path.len())..];
    let mut rewritten = if suffix.is_empty() {
        "/".to_string()
    } else if suffix.starts_with('/') {
        suffix.to_string()
    } else {
        format!("/{}", suffix)
    };
    if let Some(q) = query {
        rewritten.push('?');
        rewritten.push_str(q);
    }
    rewritten
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{LbStrategy, RouteDefaults};
    use std::time::Duration;

    fn defaults() -> RouteDefaults {
        RouteDefaults {
            request_timeout: Duration::from_secs(25),
            max_retries: 3,
        }
    }

    fn compiled(prefix: &str, origins: &[&str]) -> Arc<CompiledRoute> {
        let raw: serde_yaml::Value = serde_yaml::from_str(&format!(
            "{{path_prefix: {}, upstreams: [{}]}}",
            prefix,
            origins
                .iter()
                .map(|o| format!("'{}'", o))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .unwrap();
        let route = crate::config::types::validate_route(&raw, &defaults()).unwrap();
        let upstreams = route.upstreams.iter().cloned().map(Arc::new).collect();
        Arc::new(CompiledRoute {
            route,
            upstreams,
            plugins: Vec::new(),
            cursor: RouteCursor::new(),
        })
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table = RoutingTable::new(vec![
            compiled("/api", &["http://generic:1"]),
            compiled("/api/products", &["http://products:1"]),
        ]);

        let m = table.match_route("/api/products/42").unwrap();
        assert_eq!(m.route.path_prefix, "/api/products");
        let m = table.match_route("/api/orders").unwrap();
        assert_eq!(m.route.path_prefix, "/api");
        assert!(table.match_route("/other").is_none());
    }

    #[test]
    fn test_prefix_respects_segment_boundary() {
        let table = RoutingTable::new(vec![compiled("/api/products", &["http://p:1"])]);
        assert!(table.match_route("/api/products").is_some());
        assert!(table.match_route("/api/products/42").is_some());
        assert!(table.match_route("/api/products42").is_none());
    }

    #[test]
    fn test_rewrite_path() {
        assert_eq!(rewrite_path("/api/products", "/api/products/42", None), "/42");
        assert_eq!(rewrite_path("/api/products", "/api/products", None), "/");
        assert_eq!(
            rewrite_path("/api/products", "/api/products/42", Some("page=2")),
            "/42?page=2"
        );
        assert_eq!(rewrite_path("/v1", "/v1/foo", Some("q=x")), "/foo?q=x");
    }

    #[test]
    fn test_upstream_probe_paths_dedupes() {
        let table = RoutingTable::new(vec![
            compiled("/a", &["http://shared:1", "http://only-a:1"]),
            compiled("/b", &["http://shared:1"]),
        ]);
        let map = table.upstream_probe_paths();
        assert_eq!(map.len(), 2);
        assert!(map.contains_key("http://shared:1"));
    }

    #[test]
    fn test_same_model_detects_identity() {
        let a = compiled("/a", &["http://u:1"]);
        let table = RoutingTable::new(vec![a.clone()]);
        assert!(table.same_model(std::slice::from_ref(&a.route)));

        let b = compiled("/b", &["http://u:1"]);
        assert!(!table.same_model(&[b.route.clone()]));
        assert_eq!(a.route.lb_strategy, LbStrategy::HealthAware);
    }
}
