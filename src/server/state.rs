use crate::config::Settings;
use crate::limiter::{LimiterConfig, RateLimiter};
use crate::metrics::Metrics;
use crate::plugin::PluginRegistry;
use crate::proxy::context::BoxBody;
use crate::routing::RouterSupervisor;
use crate::upstream::{
    BreakerConfig, CircuitBreakerRegistry, HealthConfig, HealthMonitor,
};
use anyhow::Result;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared engine state, cheaply cloneable.
///
/// One engine instance per process, assembled at bootstrap and threaded
/// into every subsystem — no process-wide globals.
#[derive(Clone)]
pub struct GatewayState {
    pub settings: Arc<Settings>,
    pub metrics: Metrics,
    pub supervisor: Arc<RouterSupervisor>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub health: Arc<HealthMonitor>,
    pub limiter: Arc<RateLimiter>,
    pub http_client: Client<HttpsConnector<HttpConnector>, BoxBody>,
    pub started_at: Instant,
}

impl GatewayState {
    pub async fn new(settings: Settings) -> Result<Self> {
        let metrics = Metrics::install();

        let breakers = Arc::new(CircuitBreakerRegistry::new(BreakerConfig {
            window: settings.breaker_window,
            buckets: 10,
            error_threshold_pct: settings.breaker_error_threshold_pct,
            min_fires_in_window: 10,
            reset_timeout: settings.breaker_reset_timeout,
        }));
        // Transition events feed the state gauge; logging happens inside
        // the registry itself.
        breakers.on_transition(|upstream, kind| {
            metrics::gauge!(
                "circuit_breaker_state",
                "upstream" => upstream.to_string(),
            )
            .set(kind.gauge_value());
        });

        let health = HealthMonitor::new(HealthConfig {
            interval: settings.health_check_interval,
            timeout: settings.health_check_timeout,
            unhealthy_threshold: settings.health_unhealthy_threshold,
            healthy_threshold: settings.health_healthy_threshold,
            pool_max_idle: settings.max_free_sockets,
        });

        let limiter = RateLimiter::connect(
            LimiterConfig {
                window: settings.rate_limit_window,
                max: settings.rate_limit_max,
                strict_max: settings.rate_limit_strict_max,
                strict_prefixes: settings.rate_limit_strict_prefixes.clone(),
            },
            settings.rate_limit_store_url.as_deref(),
        )
        .await;

        let supervisor = RouterSupervisor::new(
            settings.config_path.clone(),
            settings.route_defaults(),
            Arc::new(PluginRegistry::builtin()),
            breakers.clone(),
            health.clone(),
        );

        let http_client = build_upstream_client(&settings);

        Ok(Self {
            settings: Arc::new(settings),
            metrics,
            supervisor,
            breakers,
            health,
            limiter,
            http_client,
            started_at: Instant::now(),
        })
    }
}

/// Pooled hyper client for upstream traffic, supporting both http and
/// https origins (rustls, ALPN-negotiated HTTP/2 on TLS).
fn build_upstream_client(
    settings: &Settings,
) -> Client<HttpsConnector<HttpConnector>, BoxBody> {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_keepalive(Some(Duration::from_secs(60)));
    http.set_connect_timeout(Some(settings.upstream_timeout));
    http.enforce_http(false);

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(60))
        .pool_max_idle_per_host(settings.max_sockets)
        .build(https)
}
