use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
    /// Idle-socket cap for the probe client's connection pool.
    pub pool_max_idle: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
            pool_max_idle: 10,
        }
    }
}

/// Debounced health state for one monitored upstream. Written only by
/// its probe task; read by the load balancer and the health report.
pub struct UpstreamHealth {
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    /// Unix millis of the last completed probe. 0 = never probed.
    last_check_ms: AtomicU64,
}

impl UpstreamHealth {
    fn new() -> Self {
        Self {
            // Optimistic: a fresh upstream is assumed healthy until
            // probes prove otherwise.
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            last_check_ms: AtomicU64::new(0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub upstream: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_check_ms: u64,
}

/// Runs an independent periodic probe task per monitored upstream.
///
/// `watch` is idempotent; the Router Supervisor diffs the upstream set
/// on every rebuild, watching new origins and forgetting removed ones.
pub struct HealthMonitor {
    states: DashMap<String, Arc<UpstreamHealth>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    client: reqwest::Client,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Arc<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.pool_max_idle)
            .no_proxy()
            .build()
            .expect("failed to build health probe client");
        Arc::new(Self {
            states: DashMap::new(),
            tasks: Mutex::new(HashMap::new()),
            client,
            config,
        })
    }

    /// Start monitoring an upstream. Starting twice is a no-op.
    pub fn watch(self: &Arc<Self>, upstream: &str, probe_path: &str) {
        let mut tasks = self.tasks.lock().unwrap();
        if tasks.contains_key(upstream) {
            return;
        }

        self.states
            .entry(upstream.to_string())
            .or_insert_with(|| Arc::new(UpstreamHealth::new()));

        let monitor = self.clone();
        let origin = upstream.to_string();
        let url = format!("{}{}", upstream, probe_path);
        let interval = self.config.interval;

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let success = monitor.probe_once(&url).await;
                monitor.record_probe(&origin, success);
            }
        });

        tasks.insert(upstream.to_string(), handle);
        info!("health: watching upstream={}, probe={}", upstream, probe_path);
    }

    /// Stop monitoring an upstream and discard its state.
    pub fn forget(&self, upstream: &str) {
        if let Some(handle) = self.tasks.lock().unwrap().remove(upstream) {
            handle.abort();
        }
        self.states.remove(upstream);
        info!("health: stopped watching upstream={}", upstream);
    }

    /// Origins currently being monitored.
    pub fn watched(&self) -> HashSet<String> {
        self.tasks.lock().unwrap().keys().cloned().collect()
    }

    /// Stop every probe task (graceful shutdown).
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }

    /// A probe succeeds when the peer answers at all with a non-5xx
    /// status — 2xx/3xx/4xx all prove the process is alive.
    async fn probe_once(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(resp) => resp.status().as_u16() < 500,
            Err(e) => {
                debug!("health: probe error, url={}, error={}", url, e);
                false
            }
        }
    }

    /// Apply one probe outcome with debouncing. Returns the new healthy
    /// value when a transition occurred.
    pub fn record_probe(&self, upstream: &str, success: bool) -> Option<bool> {
        let state = match self.states.get(upstream) {
            Some(entry) => entry.value().clone(),
            None => return None,
        };

        state.last_check_ms.store(now_ms(), Ordering::Relaxed);

        metrics::counter!(
            "health_check_total",
            "upstream" => upstream.to_string(),
            "result" => if success { "success" } else { "failure" },
        )
        .increment(1);

        if success {
            state.consecutive_failures.store(0, Ordering::Relaxed);
            let streak = state.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
            if !state.healthy.load(Ordering::Acquire)
                && streak >= self.config.healthy_threshold
            {
                state.healthy.store(true, Ordering::Release);
                metrics::gauge!(
                    "upstream_health_status",
                    "upstream" => upstream.to_string(),
                )
                .set(1.0);
                info!(
                    "health: upstream recovered, upstream={}, consecutive_successes={}",
                    upstream, streak
                );
                return Some(true);
            }
        } else {
            state.consecutive_successes.store(0, Ordering::Relaxed);
            let streak = state.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if state.healthy.load(Ordering::Acquire)
                && streak >= self.config.unhealthy_threshold
            {
                state.healthy.store(false, Ordering::Release);
                metrics::gauge!(
                    "upstream_health_status",
                    "upstream" => upstream.to_string(),
                )
                .set(0.0);
                warn!(
                    "health: upstream marked unhealthy, upstream={}, consecutive_failures={}",
                    upstream, streak
                );
                return Some(false);
            }
        }
        None
    }

    /// Unknown upstreams are optimistically healthy.
    pub fn is_healthy(&self, upstream: &str) -> bool {
        self.states
            .get(upstream)
            .map(|entry| entry.value().healthy.load(Ordering::Acquire))
            .unwrap_or(true)
    }

    pub fn monitored_count(&self) -> usize {
        self.states.len()
    }

    pub fn any_healthy(&self) -> bool {
        self.states
            .iter()
            .any(|entry| entry.value().healthy.load(Ordering::Acquire))
    }

    pub fn snapshot(&self) -> Vec<HealthSnapshot> {
        self.states
            .iter()
            .map(|entry| {
                let s = entry.value();
                HealthSnapshot {
                    upstream: entry.key().clone(),
                    healthy: s.healthy.load(Ordering::Acquire),
                    consecutive_failures: s.consecutive_failures.load(Ordering::Relaxed),
                    consecutive_successes: s.consecutive_successes.load(Ordering::Relaxed),
                    last_check_ms: s.last_check_ms.load(Ordering::Relaxed),
                }
            })
            .collect()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> HealthConfig {
        HealthConfig {
            interval: Duration::from_secs(3600),
            timeout: Duration::from_secs(1),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
            pool_max_idle: 4,
        }
    }

    #[tokio::test]
    async fn test_initially_optimistic() {
        let monitor = HealthMonitor::new(fast_config());
        monitor.watch("http://a:80", "/health");
        assert!(monitor.is_healthy("http://a:80"));
        // Never-watched upstreams are healthy too.
        assert!(monitor.is_healthy("http://unknown:80"));
    }

    #[tokio::test]
    async fn test_unhealthy_after_threshold_failures() {
        let monitor = HealthMonitor::new(fast_config());
        monitor.watch("http://a:80", "/health");

        assert_eq!(monitor.record_probe("http://a:80", false), None);
        assert_eq!(monitor.record_probe("http://a:80", false), None);
        assert!(monitor.is_healthy("http://a:80"), "not yet at threshold");

        assert_eq!(monitor.record_probe("http://a:80", false), Some(false));
        assert!(!monitor.is_healthy("http://a:80"));
    }

    #[tokio::test]
    async fn test_recovery_needs_healthy_threshold() {
        let monitor = HealthMonitor::new(fast_config());
        monitor.watch("http://a:80", "/health");
        for _ in 0..3 {
            monitor.record_probe("http://a:80", false);
        }
        assert!(!monitor.is_healthy("http://a:80"));

        assert_eq!(monitor.record_probe("http://a:80", true), None);
        assert!(!monitor.is_healthy("http://a:80"), "one success is not enough");
        assert_eq!(monitor.record_probe("http://a:80", true), Some(true));
        assert!(monitor.is_healthy("http://a:80"));
    }

    #[tokio::test]
    async fn test_failure_resets_success_streak() {
        let monitor = HealthMonitor::new(fast_config());
        monitor.watch("http://a:80", "/health");
        for _ in 0..3 {
            monitor.record_probe("http://a:80", false);
        }

        monitor.record_probe("http://a:80", true);
        monitor.record_probe("http://a:80", false);
        monitor.record_probe("http://a:80", true);
        assert!(
            !monitor.is_healthy("http://a:80"),
            "interrupted streak must not recover"
        );
        monitor.record_probe("http://a:80", true);
        assert!(monitor.is_healthy("http://a:80"));
    }

    #[tokio::test]
    async fn test_watch_is_idempotent() {
        let monitor = HealthMonitor::new(fast_config());
        monitor.watch("http://a:80", "/health");
        monitor.watch("http://a:80", "/health");
        assert_eq!(monitor.watched().len(), 1);
    }

    #[tokio::test]
    async fn test_forget_discards_state() {
        let monitor = HealthMonitor::new(fast_config());
        monitor.watch("http://a:80", "/health");
        for _ in 0..3 {
            monitor.record_probe("http://a:80", false);
        }
        assert!(!monitor.is_healthy("http://a:80"));

        monitor.forget("http://a:80");
        assert_eq!(monitor.monitored_count(), 0);
        // Reappearing upstream starts optimistic again.
        monitor.watch("http://a:80", "/health");
        assert!(monitor.is_healthy("http://a:80"));
    }

    #[tokio::test]
    async fn test_snapshot_reports_counters() {
        let monitor = HealthMonitor::new(fast_config());
        monitor.watch("http://a:80", "/health");
        monitor.record_probe("http://a:80", false);
        monitor.record_probe("http://a:80", false);

        let snap = monitor.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].consecutive_failures, 2);
        assert!(snap[0].healthy);
        assert!(snap[0].last_check_ms > 0);
    }
}
