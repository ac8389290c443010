use crate::config::types::RouteDefaults;
use crate::config::{self, Route};
use crate::plugin::PluginRegistry;
use crate::routing::{CompiledRoute, RoutingTable};
use crate::upstream::{CircuitBreakerRegistry, HealthMonitor, RouteCursor};
use anyhow::Result;
use arc_swap::ArcSwapOption;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Owns the published routing table and the component lifecycles tied
/// to it: plugin cache, health probes, and breaker state.
///
/// Readers load the table without locking; publication is a single
/// atomic swap, so a request observes either the old table or the new
/// one, never a torn view.
pub struct RouterSupervisor {
    table: ArcSwapOption<RoutingTable>,
    config_path: PathBuf,
    defaults: RouteDefaults,
    registry: Arc<PluginRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    health: Arc<HealthMonitor>,
    /// Set after the first rebuild attempt, successful or not.
    startup_attempted: AtomicBool,
}

impl RouterSupervisor {
    pub fn new(
        config_path: PathBuf,
        defaults: RouteDefaults,
        registry: Arc<PluginRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        health: Arc<HealthMonitor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            table: ArcSwapOption::const_empty(),
            config_path,
            defaults,
            registry,
            breakers,
            health,
            startup_attempted: AtomicBool::new(false),
        })
    }

    /// The currently published table, if any.
    pub fn table(&self) -> Option<Arc<RoutingTable>> {
        self.table.load_full()
    }

    pub fn startup_complete(&self) -> bool {
        self.startup_attempted.load(Ordering::Acquire)
    }

    /// Rebuild the routing table from the config file and publish it
    /// atomically. On any failure the previous table is retained.
    pub fn rebuild(&self) -> Result<()> {
        let result = self.try_rebuild();
        self.startup_attempted.store(true, Ordering::Release);
        if let Err(ref e) = result {
            error!("router: rebuild failed, keeping previous table: {}", e);
            metrics::counter!("config_reloads_total", "result" => "error").increment(1);
        }
        result
    }

    fn try_rebuild(&self) -> Result<()> {
        let loaded = config::load_routes(&self.config_path, &self.defaults)?;

        // Re-publishing an identical model would reset LB cursors for
        // no benefit; detect it and leave the table alone.
        if let Some(current) = self.table.load_full() {
            if current.same_model(&loaded.routes) {
                info!(
                    "router: config unchanged ({} routes), table not republished",
                    loaded.routes.len()
                );
                metrics::counter!("config_reloads_total", "result" => "unchanged").increment(1);
                return Ok(());
            }
        }

        self.registry.reset();

        let mut compiled: Vec<Arc<CompiledRoute>> = Vec::with_capacity(loaded.routes.len());
        for route in loaded.routes {
            match self.compile_route(route) {
                Ok(c) => compiled.push(Arc::new(c)),
                Err((prefix, reason)) => {
                    warn!("router: route {:?} rejected: {}", prefix, reason);
                }
            }
        }
        if compiled.is_empty() {
            anyhow::bail!("every route failed plugin materialization");
        }

        let new_table = Arc::new(RoutingTable::new(compiled));

        // Diff the upstream set: probes start for new origins
        // (optimistically healthy) and stop for removed ones; removed
        // breakers are discarded so a returning upstream starts fresh.
        let probe_paths = new_table.upstream_probe_paths();
        let active: HashSet<String> = probe_paths.keys().cloned().collect();
        for (origin, probe_path) in &probe_paths {
            self.health.watch(origin, probe_path);
        }
        for origin in self.health.watched().difference(&active) {
            self.health.forget(origin);
        }
        self.breakers.retain(&active);

        let route_count = new_table.route_count();
        let prefixes = new_table.prefixes();
        self.table.store(Some(new_table));

        metrics::gauge!("config_routes_total").set(route_count as f64);
        metrics::counter!("config_reloads_total", "result" => "success").increment(1);
        info!(
            "router: published routing table, routes={}, prefixes={:?}",
            route_count, prefixes
        );
        Ok(())
    }

    /// Materialize the plugin chain for one route. A plugin that fails
    /// to load rejects the route, not the whole table.
    fn compile_route(&self, route: Route) -> Result<CompiledRoute, (String, String)> {
        let mut plugins = Vec::new();
        for plugin in &route.plugins {
            if !plugin.enabled {
                continue;
            }
            match self.registry.load(&plugin.name, &plugin.params) {
                Ok(instance) => plugins.push(instance),
                Err(e) => {
                    return Err((route.path_prefix.clone(), e.to_string()));
                }
            }
        }
        let upstreams = route.upstreams.iter().cloned().map(Arc::new).collect();
        Ok(CompiledRoute {
            route,
            upstreams,
            plugins,
            cursor: RouteCursor::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::{BreakerConfig, HealthConfig};
    use std::io::Write;
    use std::time::Duration;

    fn write_config(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    fn supervisor(path: PathBuf) -> Arc<RouterSupervisor> {
        RouterSupervisor::new(
            path,
            RouteDefaults {
                request_timeout: Duration::from_secs(25),
                max_retries: 3,
            },
            Arc::new(PluginRegistry::builtin()),
            Arc::new(CircuitBreakerRegistry::new(BreakerConfig::default())),
            HealthMonitor::new(HealthConfig {
                interval: Duration::from_secs(3600),
                timeout: Duration::from_secs(1),
                unhealthy_threshold: 3,
                healthy_threshold: 2,
                pool_max_idle: 4,
            }),
        )
    }

    #[tokio::test]
    async fn test_initial_publish() {
        let path = write_config(
            "portico-sup-initial.yaml",
            "routes:\n  - path_prefix: /v1\n    upstreams: http://u1:8080\n",
        );
        let sup = supervisor(path);
        assert!(sup.table().is_none());
        assert!(!sup.startup_complete());

        sup.rebuild().unwrap();
        assert!(sup.startup_complete());
        let table = sup.table().unwrap();
        assert_eq!(table.route_count(), 1);
        assert_eq!(sup.health.watched().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_rebuild_retains_table() {
        let path = write_config(
            "portico-sup-retain.yaml",
            "routes:\n  - path_prefix: /v1\n    upstreams: http://u1:8080\n",
        );
        let sup = supervisor(path.clone());
        sup.rebuild().unwrap();
        let before = sup.table().unwrap();

        write_config("portico-sup-retain.yaml", "routes: []\n");
        assert!(sup.rebuild().is_err());
        let after = sup.table().unwrap();
        assert!(Arc::ptr_eq(&before, &after), "previous table must survive");
        // The attempt still counts for startup.
        assert!(sup.startup_complete());
    }

    #[tokio::test]
    async fn test_reload_swaps_upstreams_and_stops_old_probes() {
        let path = write_config(
            "portico-sup-swap.yaml",
            "routes:\n  - path_prefix: /v1\n    upstreams: http://u1:8080\n",
        );
        let sup = supervisor(path.clone());
        sup.rebuild().unwrap();
        assert!(sup.health.watched().contains("http://u1:8080"));

        write_config(
            "portico-sup-swap.yaml",
            "routes:\n  - path_prefix: /v1\n    upstreams: http://u2:9090\n",
        );
        sup.rebuild().unwrap();

        let watched = sup.health.watched();
        assert!(watched.contains("http://u2:9090"));
        assert!(!watched.contains("http://u1:8080"), "removed upstream forgotten");

        let table = sup.table().unwrap();
        let m = table.match_route("/v1/bar").unwrap();
        assert_eq!(m.upstreams[0].origin, "http://u2:9090");
    }

    #[tokio::test]
    async fn test_identical_reload_is_noop() {
        let path = write_config(
            "portico-sup-noop.yaml",
            "routes:\n  - path_prefix: /v1\n    upstreams: http://u1:8080\n",
        );
        let sup = supervisor(path);
        sup.rebuild().unwrap();
        let before = sup.table().unwrap();

        sup.rebuild().unwrap();
        let after = sup.table().unwrap();
        assert!(
            Arc::ptr_eq(&before, &after),
            "identical model must not be republished"
        );
    }

    #[tokio::test]
    async fn test_route_with_bad_plugin_is_rejected_alone() {
        let path = write_config(
            "portico-sup-plugin.yaml",
            concat!(
                "routes:\n",
                "  - path_prefix: /good\n",
                "    upstreams: http://u1:8080\n",
                "  - path_prefix: /bad\n",
                "    upstreams: http://u2:8080\n",
                "    plugins:\n",
                "      - name: central-auth\n",
                "        params: {}\n",
            ),
        );
        let sup = supervisor(path);
        sup.rebuild().unwrap();
        let table = sup.table().unwrap();
        assert_eq!(table.route_count(), 1);
        assert!(table.match_route("/good/x").is_some());
        assert!(table.match_route("/bad/x").is_none());
    }

    #[tokio::test]
    async fn test_plugin_chain_materialized() {
        let path = write_config(
            "portico-sup-chain.yaml",
            concat!(
                "routes:\n",
                "  - path_prefix: /api/orders\n",
                "    upstreams: http://orders:8080\n",
                "    plugins:\n",
                "      - name: central-auth\n",
                "        params: { auth_service_url: \"http://auth:9000\" }\n",
                "      - name: central-auth\n",
                "        enabled: false\n",
                "        params: { auth_service_url: \"http://other:9000\" }\n",
            ),
        );
        let sup = supervisor(path);
        sup.rebuild().unwrap();
        let table = sup.table().unwrap();
        let route = table.match_route("/api/orders").unwrap();
        // The disabled plugin is dropped at compile time.
        assert_eq!(route.plugins.len(), 1);
    }
}
