use crate::error::GatewayError;
use dashmap::DashMap;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Circuit breaker state machine: Closed → Open → HalfOpen → Closed/Open.
///
/// Per-upstream granularity — each origin gets its own breaker so a
/// single failing upstream can be isolated without affecting the rest
/// of a route's candidate set.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<UpstreamBreaker>>,
    config: BreakerConfig,
    observers: RwLock<Vec<TransitionObserver>>,
}

type TransitionObserver = Box<dyn Fn(&str, BreakerStateKind) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Rolling statistics window.
    pub window: Duration,
    /// Number of sub-buckets the window is split into.
    pub buckets: usize,
    /// Failure percentage within the window that trips the breaker.
    pub error_threshold_pct: f64,
    /// Minimum fires in the window before the breaker may trip — a
    /// full bucket's worth of traffic.
    pub min_fires_in_window: u64,
    /// How long the breaker stays open before permitting a trial.
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            buckets: 10,
            error_threshold_pct: 50.0,
            min_fires_in_window: 10,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerStateKind {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerStateKind {
    fn from_raw(raw: u8) -> Self {
        match raw {
            STATE_OPEN => Self::Open,
            STATE_HALF_OPEN => Self::HalfOpen,
            _ => Self::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Gauge encoding: 0=closed, 1=open, 2=half_open.
    pub fn gauge_value(&self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::Open => 1.0,
            Self::HalfOpen => 2.0,
        }
    }
}

/// Result of checking the breaker before a forward attempt.
pub enum BreakerCheck {
    /// Breaker is closed — proceed normally.
    Allowed,
    /// Breaker is half-open and this caller won the single trial slot.
    Trial,
    /// Breaker is open — reject without network I/O.
    Rejected,
}

/// Per-upstream breaker state.
struct UpstreamBreaker {
    state: AtomicU8,
    window: Mutex<RollingWindow>,
    opened_at: Mutex<Option<Instant>>,
    /// Half-open permits exactly one in-flight trial.
    trial_in_flight: AtomicBool,
    config: BreakerConfig,
}

/// Time-bucketed fire/failure counters over the breaker window.
struct RollingWindow {
    buckets: Vec<WindowBucket>,
    bucket_span: Duration,
    started: Instant,
}

#[derive(Clone, Copy, Default)]
struct WindowBucket {
    index: u64,
    fires: u64,
    failures: u64,
}

impl RollingWindow {
    fn new(window: Duration, buckets: usize) -> Self {
        let buckets = buckets.max(10);
        Self {
            buckets: vec![WindowBucket::default(); buckets],
            bucket_span: window / buckets as u32,
            started: Instant::now(),
        }
    }

    fn current_index(&self) -> u64 {
        (self.started.elapsed().as_nanos() / self.bucket_span.as_nanos().max(1)) as u64
    }

    fn record(&mut self, failure: bool) {
        let index = self.current_index();
        let slot = (index as usize) % self.buckets.len();
        let bucket = &mut self.buckets[slot];
        if bucket.index != index {
            bucket.index = index;
            bucket.fires = 0;
            bucket.failures = 0;
        }
        bucket.fires += 1;
        if failure {
            bucket.failures += 1;
        }
    }

    /// (fires, failures) over the live window.
    fn totals(&self) -> (u64, u64) {
        let index = self.current_index();
        let span = self.buckets.len() as u64;
        let oldest = index.saturating_sub(span - 1);
        let mut fires = 0;
        let mut failures = 0;
        for bucket in &self.buckets {
            if bucket.index >= oldest && bucket.index <= index {
                fires += bucket.fires;
                failures += bucket.failures;
            }
        }
        (fires, failures)
    }

    fn reset(&mut self) {
        for bucket in self.buckets.iter_mut() {
            *bucket = WindowBucket::default();
        }
    }
}

impl UpstreamBreaker {
    fn new(config: BreakerConfig) -> Self {
        let window = RollingWindow::new(config.window, config.buckets);
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            window: Mutex::new(window),
            opened_at: Mutex::new(None),
            trial_in_flight: AtomicBool::new(false),
            config,
        }
    }

    fn check(&self) -> (BreakerCheck, Option<BreakerStateKind>) {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => (BreakerCheck::Allowed, None),
            STATE_OPEN => {
                let elapsed = {
                    let opened_at = self.opened_at.lock().unwrap();
                    opened_at.map(|at| at.elapsed())
                };
                if elapsed.is_some_and(|e| e >= self.config.reset_timeout) {
                    // One caller wins the transition and the trial slot.
                    if self
                        .state
                        .compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        self.trial_in_flight.store(true, Ordering::Release);
                        return (BreakerCheck::Trial, Some(BreakerStateKind::HalfOpen));
                    }
                }
                (BreakerCheck::Rejected, None)
            }
            STATE_HALF_OPEN => {
                // A trial slot frees up only if the previous one was
                // dropped before resolving (client cancellation).
                if self
                    .trial_in_flight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    (BreakerCheck::Trial, None)
                } else {
                    (BreakerCheck::Rejected, None)
                }
            }
            _ => (BreakerCheck::Allowed, None),
        }
    }

    fn record_success(&self) -> Option<BreakerStateKind> {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => {
                self.window.lock().unwrap().record(false);
                None
            }
            STATE_HALF_OPEN => {
                // The trial succeeded — close immediately.
                self.state.store(STATE_CLOSED, Ordering::Release);
                self.trial_in_flight.store(false, Ordering::Release);
                *self.opened_at.lock().unwrap() = None;
                self.window.lock().unwrap().reset();
                Some(BreakerStateKind::Closed)
            }
            _ => None,
        }
    }

    fn record_failure(&self) -> Option<BreakerStateKind> {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => {
                let should_trip = {
                    let mut window = self.window.lock().unwrap();
                    window.record(true);
                    let (fires, failures) = window.totals();
                    let pct = if fires == 0 {
                        0.0
                    } else {
                        failures as f64 * 100.0 / fires as f64
                    };
                    fires >= self.config.min_fires_in_window
                        && pct >= self.config.error_threshold_pct
                };
                if should_trip
                    && self
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    *self.opened_at.lock().unwrap() = Some(Instant::now());
                    return Some(BreakerStateKind::Open);
                }
                None
            }
            STATE_HALF_OPEN => {
                // The trial failed — back to open.
                self.state.store(STATE_OPEN, Ordering::Release);
                *self.opened_at.lock().unwrap() = Some(Instant::now());
                self.trial_in_flight.store(false, Ordering::Release);
                Some(BreakerStateKind::Open)
            }
            _ => None,
        }
    }

    fn is_open(&self) -> bool {
        if self.state.load(Ordering::Acquire) != STATE_OPEN {
            return false;
        }
        let opened_at = self.opened_at.lock().unwrap();
        match *opened_at {
            // Past the reset window the next check() permits a trial.
            Some(at) => at.elapsed() < self.config.reset_timeout,
            None => false,
        }
    }
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Register a state-transition observer (logging, metrics). Called
    /// with the upstream origin and the state just entered.
    pub fn on_transition(&self, observer: impl Fn(&str, BreakerStateKind) + Send + Sync + 'static) {
        self.observers.write().unwrap().push(Box::new(observer));
    }

    fn notify(&self, upstream: &str, kind: BreakerStateKind) {
        match kind {
            BreakerStateKind::Open => {
                warn!("breaker: opened, upstream={}", upstream);
            }
            BreakerStateKind::HalfOpen => {
                info!("breaker: half-open, permitting trial, upstream={}", upstream);
            }
            BreakerStateKind::Closed => {
                info!("breaker: closed, upstream recovered, upstream={}", upstream);
            }
        }
        for observer in self.observers.read().unwrap().iter() {
            observer(upstream, kind);
        }
    }

    fn get_or_create(&self, upstream: &str) -> Arc<UpstreamBreaker> {
        if let Some(entry) = self.breakers.get(upstream) {
            return entry.value().clone();
        }
        self.breakers
            .entry(upstream.to_string())
            .or_insert_with(|| Arc::new(UpstreamBreaker::new(self.config.clone())))
            .clone()
    }

    /// Check whether a forward to `upstream` is allowed right now.
    pub fn check(&self, upstream: &str) -> BreakerCheck {
        let breaker = self.get_or_create(upstream);
        let (check, transition) = breaker.check();
        if let Some(kind) = transition {
            self.notify(upstream, kind);
        }
        check
    }

    /// Run `fut` under the breaker for `upstream`.
    ///
    /// An open breaker short-circuits to `CircuitOpen` without polling
    /// the future. Otherwise the outcome is classified: 5xx statuses and
    /// errors count as failures, everything else (including 4xx) as
    /// success. A dropped future records nothing — cancellations are
    /// never breaker failures.
    pub async fn execute<B, F>(
        &self,
        upstream: &str,
        fut: F,
    ) -> Result<http::Response<B>, GatewayError>
    where
        F: Future<Output = Result<http::Response<B>, GatewayError>>,
    {
        match self.check(upstream) {
            BreakerCheck::Allowed | BreakerCheck::Trial => {}
            BreakerCheck::Rejected => {
                metrics::counter!(
                    "circuit_breaker_rejected_total",
                    "upstream" => upstream.to_string(),
                )
                .increment(1);
                return Err(GatewayError::CircuitOpen {
                    upstream: upstream.to_string(),
                });
            }
        }

        match fut.await {
            Ok(resp) => {
                if resp.status().as_u16() >= 500 {
                    self.record_failure(upstream);
                } else {
                    self.record_success(upstream);
                }
                Ok(resp)
            }
            Err(err) => {
                self.record_failure(upstream);
                Err(err)
            }
        }
    }

    /// Fire-and-forget success signal.
    pub fn record_success(&self, upstream: &str) {
        let breaker = self.get_or_create(upstream);
        if let Some(kind) = breaker.record_success() {
            self.notify(upstream, kind);
        }
    }

    /// Fire-and-forget failure signal.
    pub fn record_failure(&self, upstream: &str) {
        let breaker = self.get_or_create(upstream);
        if let Some(kind) = breaker.record_failure() {
            self.notify(upstream, kind);
        }
    }

    /// Whether the breaker is open (and still within its reset window).
    /// Half-open is not open: it permits a trial request.
    pub fn is_open(&self, upstream: &str) -> bool {
        self.breakers
            .get(upstream)
            .map(|b| b.value().is_open())
            .unwrap_or(false)
    }

    pub fn state_of(&self, upstream: &str) -> Option<BreakerStateKind> {
        self.breakers
            .get(upstream)
            .map(|b| BreakerStateKind::from_raw(b.value().state.load(Ordering::Acquire)))
    }

    /// Snapshot of every tracked breaker, for the health report.
    pub fn snapshot(&self) -> Vec<(String, BreakerStateKind)> {
        self.breakers
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    BreakerStateKind::from_raw(entry.value().state.load(Ordering::Acquire)),
                )
            })
            .collect()
    }

    /// Upstreams whose breaker is currently open.
    pub fn open_upstreams(&self) -> Vec<String> {
        self.breakers
            .iter()
            .filter(|entry| entry.value().is_open())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Drop breakers for upstreams no longer in the routing table.
    /// A returning upstream starts fresh (closed, empty window).
    pub fn retain(&self, active: &HashSet<String>) {
        self.breakers.retain(|k, _| active.contains(k));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Response;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            window: Duration::from_millis(200),
            buckets: 10,
            error_threshold_pct: 50.0,
            min_fires_in_window: 4,
            reset_timeout: Duration::from_millis(50),
        }
    }

    fn trip(reg: &CircuitBreakerRegistry, upstream: &str, n: usize) {
        for _ in 0..n {
            reg.record_failure(upstream);
        }
    }

    #[test]
    fn test_starts_closed() {
        let reg = CircuitBreakerRegistry::new(fast_config());
        assert!(matches!(reg.check("http://a:80"), BreakerCheck::Allowed));
        assert!(!reg.is_open("http://a:80"));
    }

    #[test]
    fn test_trips_on_error_rate() {
        let reg = CircuitBreakerRegistry::new(fast_config());
        trip(&reg, "http://a:80", 5);
        assert!(reg.is_open("http://a:80"));
        assert!(matches!(reg.check("http://a:80"), BreakerCheck::Rejected));
    }

    #[test]
    fn test_trips_immediately_on_consecutive_failures() {
        // Default window shape, fresh breaker: ten consecutive 5xx
        // within the first second must open it.
        let reg = CircuitBreakerRegistry::new(BreakerConfig::default());
        let start = std::time::Instant::now();
        for _ in 0..10 {
            reg.record_failure("http://u:8080");
        }
        assert!(reg.is_open("http://u:8080"));
        assert!(matches!(reg.check("http://u:8080"), BreakerCheck::Rejected));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_does_not_trip_below_min_fires() {
        let reg = CircuitBreakerRegistry::new(fast_config());
        for _ in 0..3 {
            reg.record_failure("http://a:80");
        }
        assert!(!reg.is_open("http://a:80"));
    }

    #[test]
    fn test_does_not_trip_below_error_threshold() {
        let reg = CircuitBreakerRegistry::new(fast_config());
        for _ in 0..12 {
            reg.record_success("http://a:80");
        }
        for _ in 0..4 {
            reg.record_failure("http://a:80");
        }
        // 4 failures out of 16 fires = 25%, below the 50% threshold.
        assert!(!reg.is_open("http://a:80"));
    }

    #[test]
    fn test_half_open_single_trial_then_close() {
        let reg = CircuitBreakerRegistry::new(fast_config());
        trip(&reg, "http://a:80", 5);

        std::thread::sleep(Duration::from_millis(60));
        // First caller after the reset timeout wins the trial.
        assert!(matches!(reg.check("http://a:80"), BreakerCheck::Trial));
        // Concurrent callers are rejected while the trial is in flight.
        assert!(matches!(reg.check("http://a:80"), BreakerCheck::Rejected));

        reg.record_success("http://a:80");
        assert!(matches!(reg.check("http://a:80"), BreakerCheck::Allowed));
        assert_eq!(reg.state_of("http://a:80"), Some(BreakerStateKind::Closed));
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let reg = CircuitBreakerRegistry::new(fast_config());
        trip(&reg, "http://a:80", 5);

        std::thread::sleep(Duration::from_millis(60));
        assert!(matches!(reg.check("http://a:80"), BreakerCheck::Trial));
        reg.record_failure("http://a:80");

        assert_eq!(reg.state_of("http://a:80"), Some(BreakerStateKind::Open));
        assert!(matches!(reg.check("http://a:80"), BreakerCheck::Rejected));
    }

    #[tokio::test]
    async fn test_execute_short_circuits_without_polling() {
        let reg = CircuitBreakerRegistry::new(fast_config());
        trip(&reg, "http://a:80", 5);

        let polled = std::sync::Arc::new(AtomicBool::new(false));
        let polled_clone = polled.clone();
        let result = reg
            .execute("http://a:80", async move {
                polled_clone.store(true, Ordering::SeqCst);
                Ok(Response::new(String::new()))
            })
            .await;

        assert!(matches!(result, Err(GatewayError::CircuitOpen { .. })));
        assert!(!polled.load(Ordering::SeqCst), "open breaker must not poll");
    }

    #[tokio::test]
    async fn test_execute_classifies_statuses() {
        let reg = CircuitBreakerRegistry::new(fast_config());

        // 4xx is a client fault, not an upstream failure.
        for _ in 0..10 {
            let resp = Response::builder().status(404).body(String::new()).unwrap();
            let _ = reg.execute("http://a:80", async { Ok(resp) }).await;
        }
        assert!(!reg.is_open("http://a:80"));

        // 5xx counts as failure and trips the breaker.
        for _ in 0..10 {
            let resp = Response::builder().status(500).body(String::new()).unwrap();
            let _ = reg.execute("http://b:80", async { Ok(resp) }).await;
        }
        assert!(reg.is_open("http://b:80"));
    }

    #[test]
    fn test_retain_discards_removed_upstreams() {
        let reg = CircuitBreakerRegistry::new(fast_config());
        trip(&reg, "http://a:80", 5);
        assert!(reg.is_open("http://a:80"));

        let active: HashSet<String> = ["http://b:80".to_string()].into_iter().collect();
        reg.retain(&active);

        // Reappearing upstream starts fresh.
        assert!(!reg.is_open("http://a:80"));
        assert!(matches!(reg.check("http://a:80"), BreakerCheck::Allowed));
    }

    #[test]
    fn test_transition_observer_fires() {
        let reg = CircuitBreakerRegistry::new(fast_config());
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        reg.on_transition(move |upstream, kind| {
            seen_clone
                .lock()
                .unwrap()
                .push((upstream.to_string(), kind));
        });

        trip(&reg, "http://a:80", 5);
        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1, BreakerStateKind::Open);
    }

    #[test]
    fn test_rolling_window_expires_old_failures() {
        let cfg = BreakerConfig {
            window: Duration::from_millis(100),
            buckets: 10,
            error_threshold_pct: 50.0,
            min_fires_in_window: 4,
            reset_timeout: Duration::from_secs(30),
        };
        let reg = CircuitBreakerRegistry::new(cfg);
        std::thread::sleep(Duration::from_millis(15));
        for _ in 0..3 {
            reg.record_failure("http://a:80");
        }
        // Let the window roll past those failures entirely.
        std::thread::sleep(Duration::from_millis(150));
        reg.record_failure("http://a:80");
        // Only 1 fire remains in the live window — below min_fires.
        assert!(!reg.is_open("http://a:80"));
    }
}
