use dashmap::DashMap;
use http::HeaderMap;
use redis::AsyncCommands;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Observability paths that are never rate limited.
const EXEMPT_PATHS: [&str; 5] = ["/health", "/metrics", "/livez", "/readyz", "/startupz"];

/// Redis key namespace for the shared store.
const SHARED_KEY_PREFIX: &str = "portico:rl";

/// Maximum accepted length for a client-identity header value.
const MAX_KEY_HEADER_BYTES: usize = 128;

/// Entries older than this many windows are evicted by the GC task.
const GC_STALE_WINDOWS: u64 = 2;
const GC_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct LimiterConfig {
    pub window: Duration,
    pub max: u64,
    /// Tighter ceiling for sensitive endpoints.
    pub strict_max: u64,
    /// Path prefixes the strict profile applies to.
    pub strict_prefixes: Vec<String>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max: 100,
            strict_max: 10,
            strict_prefixes: vec!["/api/v1/auth".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LimiterDecision {
    pub allowed: bool,
    pub retry_after_secs: u64,
}

/// Fixed-window rate limiter keyed by client identity.
///
/// When a shared store URL is configured the limiter attempts a redis
/// connection at startup; on failure it falls back to in-process
/// counters for the remainder of the process lifetime (no background
/// reconnection).
pub struct RateLimiter {
    config: LimiterConfig,
    windows: DashMap<String, Arc<Mutex<Window>>>,
    shared: RwLock<Option<redis::aio::ConnectionManager>>,
}

struct Window {
    index: u64,
    count: u64,
}

impl RateLimiter {
    /// Resolve the backing store and build the limiter.
    pub async fn connect(config: LimiterConfig, store_url: Option<&str>) -> Arc<Self> {
        let shared = match store_url {
            Some(url) => match Self::try_connect_shared(url).await {
                Some(conn) => {
                    info!("limiter: using shared store");
                    Some(conn)
                }
                None => {
                    warn!(
                        "limiter: shared store unavailable, falling back to in-process counters"
                    );
                    None
                }
            },
            None => None,
        };

        let limiter = Arc::new(Self {
            config,
            windows: DashMap::new(),
            shared: RwLock::new(shared),
        });
        limiter.start_gc();
        limiter
    }

    /// In-process limiter, used directly by tests and as the fallback.
    pub fn in_process(config: LimiterConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            windows: DashMap::new(),
            shared: RwLock::new(None),
        })
    }

    async fn try_connect_shared(url: &str) -> Option<redis::aio::ConnectionManager> {
        let client = match redis::Client::open(url) {
            Ok(c) => c,
            Err(e) => {
                warn!("limiter: invalid shared store URL: {}", e);
                return None;
            }
        };
        match tokio::time::timeout(Duration::from_secs(2), client.get_connection_manager()).await
        {
            Ok(Ok(conn)) => Some(conn),
            Ok(Err(e)) => {
                warn!("limiter: shared store connect failed: {}", e);
                None
            }
            Err(_) => {
                warn!("limiter: shared store connect timed out");
                None
            }
        }
    }

    pub fn is_exempt(path: &str) -> bool {
        EXEMPT_PATHS.contains(&path)
    }

    pub fn window_secs(&self) -> u64 {
        self.config.window.as_secs().max(1)
    }

    fn ceiling_for(&self, path: &str) -> u64 {
        if self
            .config
            .strict_prefixes
            .iter()
            .any(|p| path.starts_with(p.as_str()))
        {
            self.config.strict_max
        } else {
            self.config.max
        }
    }

    fn current_window_index(&self) -> u64 {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        now_ms / self.config.window.as_millis().max(1) as u64
    }

    /// Count one request against `key` and decide.
    pub async fn check(&self, key: &str, path: &str) -> LimiterDecision {
        let retry_after_secs = self.window_secs();
        if Self::is_exempt(path) {
            return LimiterDecision {
                allowed: true,
                retry_after_secs,
            };
        }

        let max = self.ceiling_for(path);
        let index = self.current_window_index();

        let shared = self.shared.read().unwrap().clone();
        let count = match shared {
            Some(conn) => match self.incr_shared(conn, key, index).await {
                Some(n) => n,
                // A runtime store error fails open; fallback stays
                // reserved for startup.
                None => 0,
            },
            None => self.incr_local(key, index),
        };

        let allowed = count <= max;
        if !allowed {
            metrics::counter!("rate_limit_rejected_total").increment(1);
            debug!("limiter: rejected, key={}, count={}, max={}", key, count, max);
        }
        LimiterDecision {
            allowed,
            retry_after_secs,
        }
    }

    fn incr_local(&self, key: &str, index: u64) -> u64 {
        let window = if let Some(entry) = self.windows.get(key) {
            entry.value().clone()
        } else {
            self.windows
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Window { index, count: 0 })))
                .clone()
        };

        let mut w = window.lock().unwrap();
        if w.index != index {
            w.index = index;
            w.count = 0;
        }
        w.count += 1;
        w.count
    }

    async fn incr_shared(
        &self,
        mut conn: redis::aio::ConnectionManager,
        key: &str,
        index: u64,
    ) -> Option<u64> {
        let store_key = format!("{}:{}:{}", SHARED_KEY_PREFIX, key, index);
        let count: u64 = match conn.incr(&store_key, 1u64).await {
            Ok(n) => n,
            Err(e) => {
                warn!("limiter: shared store INCR failed, allowing: {}", e);
                return None;
            }
        };
        if count == 1 {
            // Keys expire one window after they stop being current.
            let ttl = (self.window_secs() * 2) as i64;
            if let Err(e) = conn.expire::<_, ()>(&store_key, ttl).await {
                warn!("limiter: shared store EXPIRE failed: {}", e);
            }
        }
        Some(count)
    }

    /// Derive the client identity for limiting: the first entry of a
    /// trusted forwarded-for header, else the socket peer address.
    /// Oversized header values are rejected and the fallback key used.
    pub fn client_key(trust_proxy: bool, headers: &HeaderMap, peer_ip: IpAddr) -> String {
        if trust_proxy {
            if let Some(value) = headers.get("x-forwarded-for") {
                if value.as_bytes().len() <= MAX_KEY_HEADER_BYTES {
                    if let Ok(s) = value.to_str() {
                        if let Some(first) = s.split(',').next() {
                            let first = first.trim();
                            if !first.is_empty() {
                                return first.to_string();
                            }
                        }
                    }
                }
            }
        }
        peer_ip.to_string()
    }

    /// Close the shared store connection during graceful shutdown.
    pub fn shutdown(&self) {
        if self.shared.write().unwrap().take().is_some() {
            info!("limiter: closed shared store connection");
        }
    }

    /// Periodically evict windows that can no longer be current.
    fn start_gc(self: &Arc<Self>) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(GC_INTERVAL_SECS));
            loop {
                interval.tick().await;
                let current = limiter.current_window_index();
                limiter.windows.retain(|_, w| {
                    w.lock().unwrap().index + GC_STALE_WINDOWS >= current
                });
            }
        });
    }
}
