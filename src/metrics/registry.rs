use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// The recorder is process-global; every `Metrics` handle renders it.
static GLOBAL_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) can be used anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering `/metrics`.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Installing again (multiple engines in one test
    /// process) reuses the first recorder.
    pub fn install() -> Self {
        let handle = GLOBAL_HANDLE.get_or_init(Self::install_recorder).clone();
        Self { handle }
    }

    fn install_recorder() -> PrometheusHandle {
        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .build_recorder();
        let handle = recorder.handle();
        if metrics::set_global_recorder(recorder).is_err() {
            tracing::debug!("metrics: global recorder already installed");
        }

        // request path
        describe_counter!(
            "http_requests_total",
            Unit::Count,
            "Total HTTP requests processed"
        );
        describe_histogram!(
            "http_request_duration_seconds",
            Unit::Seconds,
            "Total request duration from the client's perspective"
        );
        describe_counter!(
            "http_request_errors_total",
            Unit::Count,
            "Requests completing with status >= 400"
        );
        describe_gauge!(
            "http_requests_in_flight",
            Unit::Count,
            "Requests currently being processed"
        );

        // upstream traffic
        describe_counter!(
            "upstream_requests_total",
            Unit::Count,
            "Forward attempts per upstream"
        );
        describe_histogram!(
            "upstream_request_duration_seconds",
            Unit::Seconds,
            "Upstream attempt duration"
        );
        describe_counter!(
            "upstream_retries_total",
            Unit::Count,
            "Retried forward attempts"
        );

        // circuit breaker
        describe_gauge!(
            "circuit_breaker_state",
            Unit::Count,
            "Breaker state per upstream: 0=closed 1=open 2=half_open"
        );
        describe_counter!(
            "circuit_breaker_rejected_total",
            Unit::Count,
            "Requests rejected by an open breaker"
        );

        // health
        describe_gauge!(
            "upstream_health_status",
            Unit::Count,
            "Upstream health: 1=healthy 0=unhealthy"
        );
        describe_counter!(
            "health_check_total",
            Unit::Count,
            "Health probe attempts"
        );

        // rate limiting
        describe_counter!(
            "rate_limit_rejected_total",
            Unit::Count,
            "Requests rejected by the rate limiter"
        );

        // config
        describe_gauge!(
            "config_routes_total",
            Unit::Count,
            "Routes currently published"
        );
        describe_counter!(
            "config_reloads_total",
            Unit::Count,
            "Config rebuild attempts"
        );

        // connections & process
        describe_gauge!(
            "connections_active",
            Unit::Count,
            "Active downstream connections"
        );
        describe_counter!(
            "connections_total",
            Unit::Count,
            "Connections accepted"
        );
        describe_gauge!(
            "process_start_time_seconds",
            Unit::Seconds,
            "Unix time the gateway process started"
        );

        let started = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        metrics::gauge!("process_start_time_seconds").set(started);

        handle
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
