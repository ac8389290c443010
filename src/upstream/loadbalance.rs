use crate::config::types::{LbStrategy, Upstream};
use crate::upstream::health::HealthMonitor;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Per-route selection state. The cursor is advanced only by request
/// tasks under the route's single-writer discipline (atomic increment);
/// the latch tracks whether the all-unhealthy failover warning has been
/// logged for the current transition.
pub struct RouteCursor {
    counter: AtomicU64,
    failover_warned: AtomicBool,
}

impl RouteCursor {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            failover_warned: AtomicBool::new(false),
        }
    }

    fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    pub fn position(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

impl Default for RouteCursor {
    fn default() -> Self {
        Self::new()
    }
}

/// Stateless upstream selection over a candidate list.
///
/// Returns `None` only for an empty candidate list (a route-build-time
/// error upstreamed here as a defensive no-candidate answer).
pub fn select(
    strategy: LbStrategy,
    candidates: &[Arc<Upstream>],
    cursor: &RouteCursor,
    health: &HealthMonitor,
) -> Option<Arc<Upstream>> {
    if candidates.is_empty() {
        return None;
    }
    match strategy {
        LbStrategy::RoundRobin => Some(round_robin(candidates, cursor)),
        LbStrategy::Random => Some(random(candidates)),
        LbStrategy::HealthAware => Some(health_aware(candidates, cursor, health)),
    }
}

fn round_robin(candidates: &[Arc<Upstream>], cursor: &RouteCursor) -> Arc<Upstream> {
    let idx = (cursor.next() % candidates.len() as u64) as usize;
    candidates[idx].clone()
}

fn random(candidates: &[Arc<Upstream>]) -> Arc<Upstream> {
    let idx = rand::thread_rng().gen_range(0..candidates.len());
    candidates[idx].clone()
}

/// Round-robin among the healthy sublist. When every candidate is
/// unhealthy, fail over to the full list and log a warning once per
/// transition into that state.
fn health_aware(
    candidates: &[Arc<Upstream>],
    cursor: &RouteCursor,
    health: &HealthMonitor,
) -> Arc<Upstream> {
    let healthy: Vec<&Arc<Upstream>> = candidates
        .iter()
        .filter(|u| health.is_healthy(&u.origin))
        .collect();

    if healthy.is_empty() {
        if !cursor.failover_warned.swap(true, Ordering::AcqRel) {
            warn!(
                "lb: no healthy upstream among {} candidates, failing over to full set",
                candidates.len()
            );
        }
        return round_robin(candidates, cursor);
    }

    cursor.failover_warned.store(false, Ordering::Release);
    let idx = (cursor.next() % healthy.len() as u64) as usize;
    healthy[idx].clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::health::HealthConfig;

    fn upstreams(origins: &[&str]) -> Vec<Arc<Upstream>> {
        origins
            .iter()
            .map(|o| Arc::new(Upstream::parse(o).unwrap()))
            .collect()
    }

    fn monitor() -> Arc<HealthMonitor> {
        HealthMonitor::new(HealthConfig {
            interval: std::time::Duration::from_secs(3600),
            timeout: std::time::Duration::from_secs(1),
            unhealthy_threshold: 1,
            healthy_threshold: 1,
            pool_max_idle: 4,
        })
    }

    #[tokio::test]
    async fn test_round_robin_cycles() {
        let cands = upstreams(&["http://a:1", "http://b:2", "http://c:3"]);
        let cursor = RouteCursor::new();
        let health = monitor();

        let picks: Vec<String> = (0..6)
            .map(|_| {
                select(LbStrategy::RoundRobin, &cands, &cursor, &health)
                    .unwrap()
                    .origin
                    .clone()
            })
            .collect();
        assert_eq!(picks[0], "http://a:1");
        assert_eq!(picks[1], "http://b:2");
        assert_eq!(picks[2], "http://c:3");
        assert_eq!(picks[3], "http://a:1");
        assert_eq!(cursor.position(), 6);
    }

    #[tokio::test]
    async fn test_random_stays_in_candidate_set() {
        let cands = upstreams(&["http://a:1", "http://b:2"]);
        let cursor = RouteCursor::new();
        let health = monitor();
        for _ in 0..50 {
            let pick = select(LbStrategy::Random, &cands, &cursor, &health).unwrap();
            assert!(cands.iter().any(|c| c.origin == pick.origin));
        }
    }

    #[tokio::test]
    async fn test_empty_candidates() {
        let cursor = RouteCursor::new();
        let health = monitor();
        assert!(select(LbStrategy::RoundRobin, &[], &cursor, &health).is_none());
    }

    #[tokio::test]
    async fn test_health_aware_prefers_healthy() {
        let cands = upstreams(&["http://a:1", "http://b:2"]);
        let cursor = RouteCursor::new();
        let health = monitor();
        health.watch("http://a:1", "/health");
        health.record_probe("http://a:1", false);
        assert!(!health.is_healthy("http://a:1"));

        // All traffic lands on the healthy candidate; cursor still advances.
        for _ in 0..4 {
            let pick = select(LbStrategy::HealthAware, &cands, &cursor, &health).unwrap();
            assert_eq!(pick.origin, "http://b:2");
        }
        assert_eq!(cursor.position(), 4);
    }

    #[tokio::test]
    async fn test_health_aware_failover_when_none_healthy() {
        let cands = upstreams(&["http://a:1", "http://b:2"]);
        let cursor = RouteCursor::new();
        let health = monitor();
        for origin in ["http://a:1", "http://b:2"] {
            health.watch(origin, "/health");
            health.record_probe(origin, false);
        }

        // Falls back to the full set rather than refusing to pick.
        let first = select(LbStrategy::HealthAware, &cands, &cursor, &health).unwrap();
        let second = select(LbStrategy::HealthAware, &cands, &cursor, &health).unwrap();
        assert_ne!(first.origin, second.origin);
        assert!(cursor.failover_warned.load(Ordering::Acquire));

        // Recovery clears the warn latch.
        health.record_probe("http://a:1", true);
        let _ = select(LbStrategy::HealthAware, &cands, &cursor, &health).unwrap();
        assert!(!cursor.failover_warned.load(Ordering::Acquire));
    }
}
