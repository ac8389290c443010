pub mod types;
pub mod watcher;

pub use types::*;

use anyhow::Result;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Runtime mode tag. Affects error-body verbosity and the default log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Development,
    Production,
    Test,
}

impl RunMode {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "development" => Some(Self::Development),
            "production" => Some(Self::Production),
            "test" => Some(Self::Test),
            _ => None,
        }
    }
}

/// Engine tuning resolved from the environment at startup.
///
/// Every variable is validated; an invalid or out-of-range value logs a
/// warning and falls back to the default (never fatal).
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub run_mode: RunMode,
    pub trust_proxy: bool,

    pub cors_origins: Vec<String>,
    pub cors_credentials: bool,

    pub request_body_limit: u64,
    pub compression_threshold: u64,

    pub rate_limit_window: Duration,
    pub rate_limit_max: u64,
    pub rate_limit_strict_max: u64,
    pub rate_limit_strict_prefixes: Vec<String>,
    pub rate_limit_store_url: Option<String>,

    pub request_timeout: Duration,
    pub upstream_timeout: Duration,
    pub shutdown_timeout: Duration,

    pub max_retries: u32,
    pub retry_initial_delay: Duration,
    pub retry_max_delay: Duration,
    pub retry_factor: f64,

    pub breaker_window: Duration,
    pub breaker_error_threshold_pct: f64,
    pub breaker_reset_timeout: Duration,

    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    pub health_unhealthy_threshold: u32,
    pub health_healthy_threshold: u32,

    pub max_sockets: usize,
    pub max_free_sockets: usize,

    pub config_path: std::path::PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 3000,
            run_mode: RunMode::Development,
            trust_proxy: false,
            cors_origins: vec!["*".to_string()],
            cors_credentials: false,
            request_body_limit: 10 * 1024 * 1024,
            compression_threshold: 1024,
            rate_limit_window: Duration::from_secs(60),
            rate_limit_max: 100,
            rate_limit_strict_max: 10,
            rate_limit_strict_prefixes: vec!["/api/v1/auth".to_string()],
            rate_limit_store_url: None,
            request_timeout: Duration::from_secs(30),
            upstream_timeout: Duration::from_secs(25),
            shutdown_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_initial_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(10),
            retry_factor: 2.0,
            breaker_window: Duration::from_secs(60),
            breaker_error_threshold_pct: 50.0,
            breaker_reset_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
            health_unhealthy_threshold: 3,
            health_healthy_threshold: 2,
            max_sockets: 100,
            max_free_sockets: 10,
            config_path: std::path::PathBuf::from("gateway.yaml"),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let d = Settings::default();

        let port = env_u64("PORT", d.port as u64, 1, 65535) as u16;

        let run_mode = match std::env::var("RUN_MODE") {
            Ok(v) => RunMode::parse(&v).unwrap_or_else(|| {
                warn!("config: invalid RUN_MODE {:?}, using development", v);
                RunMode::Development
            }),
            Err(_) => d.run_mode,
        };

        let trust_proxy = env_bool("TRUST_PROXY", d.trust_proxy);

        let cors_origins = match std::env::var("CORS_ORIGIN") {
            Ok(v) if !v.trim().is_empty() => v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            _ => d.cors_origins.clone(),
        };
        let cors_credentials = env_bool("CORS_CREDENTIALS", d.cors_credentials);

        let request_body_limit = match std::env::var("REQUEST_BODY_LIMIT") {
            Ok(v) => match parse_size(&v) {
                Some(n) if n > 0 => n,
                _ => {
                    warn!(
                        "config: invalid REQUEST_BODY_LIMIT {:?}, using {} bytes",
                        v, d.request_body_limit
                    );
                    d.request_body_limit
                }
            },
            Err(_) => d.request_body_limit,
        };

        let rate_limit_strict_prefixes = match std::env::var("RATE_LIMIT_STRICT_PATHS") {
            Ok(v) => v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| s.starts_with('/'))
                .collect(),
            Err(_) => d.rate_limit_strict_prefixes.clone(),
        };

        let rate_limit_store_url = std::env::var("RATE_LIMIT_STORE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let config_path = std::env::var("GATEWAY_CONFIG_PATH")
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|_| d.config_path.clone());

        Self {
            port,
            run_mode,
            trust_proxy,
            cors_origins,
            cors_credentials,
            request_body_limit,
            compression_threshold: env_u64("COMPRESSION_THRESHOLD", d.compression_threshold, 0, u64::MAX),
            rate_limit_window: env_duration_ms("RATE_LIMIT_WINDOW_MS", d.rate_limit_window),
            rate_limit_max: env_u64("RATE_LIMIT_MAX", d.rate_limit_max, 1, u64::MAX),
            rate_limit_strict_max: env_u64("RATE_LIMIT_STRICT_MAX", d.rate_limit_strict_max, 1, u64::MAX),
            rate_limit_strict_prefixes,
            rate_limit_store_url,
            request_timeout: env_duration_ms("REQUEST_TIMEOUT_MS", d.request_timeout),
            upstream_timeout: env_duration_ms("UPSTREAM_TIMEOUT_MS", d.upstream_timeout),
            shutdown_timeout: env_duration_ms("SHUTDOWN_TIMEOUT_MS", d.shutdown_timeout),
            max_retries: env_u64("MAX_RETRIES", d.max_retries as u64, 0, 100) as u32,
            retry_initial_delay: env_duration_ms("RETRY_INITIAL_DELAY_MS", d.retry_initial_delay),
            retry_max_delay: env_duration_ms("RETRY_MAX_DELAY_MS", d.retry_max_delay),
            retry_factor: env_f64("RETRY_FACTOR", d.retry_factor, 1.0, 100.0),
            breaker_window: env_duration_ms("CIRCUIT_BREAKER_TIMEOUT_MS", d.breaker_window),
            breaker_error_threshold_pct: env_f64(
                "CIRCUIT_BREAKER_ERROR_THRESHOLD",
                d.breaker_error_threshold_pct,
                1.0,
                100.0,
            ),
            breaker_reset_timeout: env_duration_ms(
                "CIRCUIT_BREAKER_RESET_TIMEOUT_MS",
                d.breaker_reset_timeout,
            ),
            health_check_interval: env_duration_ms("HEALTH_CHECK_INTERVAL_MS", d.health_check_interval),
            health_check_timeout: env_duration_ms("HEALTH_CHECK_TIMEOUT_MS", d.health_check_timeout),
            health_unhealthy_threshold: env_u64(
                "HEALTH_CHECK_UNHEALTHY_THRESHOLD",
                d.health_unhealthy_threshold as u64,
                1,
                1000,
            ) as u32,
            health_healthy_threshold: env_u64(
                "HEALTH_CHECK_HEALTHY_THRESHOLD",
                d.health_healthy_threshold as u64,
                1,
                1000,
            ) as u32,
            max_sockets: env_u64("MAX_SOCKETS", d.max_sockets as u64, 1, 100_000) as usize,
            max_free_sockets: env_u64("MAX_FREE_SOCKETS", d.max_free_sockets as u64, 1, 100_000)
                as usize,
            config_path,
        }
    }

    /// Defaults a route inherits when the config file omits a field.
    pub fn route_defaults(&self) -> RouteDefaults {
        RouteDefaults {
            request_timeout: self.upstream_timeout,
            max_retries: self.max_retries,
        }
    }

    /// The engine-wide retry policy from the environment.
    pub fn retry_policy(&self) -> crate::upstream::RetryPolicy {
        crate::upstream::RetryPolicy {
            initial: self.retry_initial_delay,
            factor: self.retry_factor,
            max_delay: self.retry_max_delay,
            max_retries: self.max_retries,
        }
    }

    /// Whether internal error messages may be shown to clients.
    pub fn verbose_errors(&self) -> bool {
        self.run_mode != RunMode::Production
    }
}

fn env_u64(name: &str, default: u64, min: u64, max: u64) -> u64 {
    match std::env::var(name) {
        Ok(v) => match v.trim().parse::<u64>() {
            Ok(n) if n >= min && n <= max => n,
            _ => {
                warn!("config: invalid {} {:?}, using {}", name, v, default);
                default
            }
        },
        Err(_) => default,
    }
}

fn env_f64(name: &str, default: f64, min: f64, max: f64) -> f64 {
    match std::env::var(name) {
        Ok(v) => match v.trim().parse::<f64>() {
            Ok(n) if n.is_finite() && n >= min && n <= max => n,
            _ => {
                warn!("config: invalid {} {:?}, using {}", name, v, default);
                default
            }
        },
        Err(_) => default,
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.trim(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}

fn env_duration_ms(name: &str, default: Duration) -> Duration {
    match std::env::var(name) {
        Ok(v) => match v.trim().parse::<u64>() {
            Ok(n) if n > 0 => Duration::from_millis(n),
            _ => {
                warn!("config: invalid {} {:?}, using {:?}", name, v, default);
                default
            }
        },
        Err(_) => default,
    }
}

/// Parse a byte-size string: a bare integer is bytes, "kb"/"mb"/"gb"
/// suffixes (case-insensitive) are binary multiples.
pub fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim().to_ascii_lowercase();
    let (digits, multiplier) = if let Some(v) = s.strip_suffix("gb") {
        (v, 1024 * 1024 * 1024)
    } else if let Some(v) = s.strip_suffix("mb") {
        (v, 1024 * 1024)
    } else if let Some(v) = s.strip_suffix("kb") {
        (v, 1024)
    } else if let Some(v) = s.strip_suffix('b') {
        (v, 1)
    } else {
        (s.as_str(), 1)
    };
    let n: u64 = digits.trim().parse().ok()?;
    n.checked_mul(multiplier)
}

/// Result of loading the route file.
pub struct LoadedRoutes {
    pub version: Option<String>,
    pub routes: Vec<Route>,
    /// Number of route documents rejected during validation.
    pub rejected: usize,
}

/// Load and validate the route file. Individual invalid routes are
/// dropped with a logged reason; a document with zero valid routes is
/// a hard error so the caller retains the previous table.
pub fn load_routes(path: &Path, defaults: &RouteDefaults) -> Result<LoadedRoutes> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read {}: {}", path.display(), e))?;

    let file: GatewayFile = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
        Some("json") => serde_json::from_str(&content)?,
        Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .yaml or .json"),
        None => serde_yaml::from_str(&content)?,
    };

    let mut routes: Vec<Route> = Vec::with_capacity(file.routes.len());
    let mut rejected = 0usize;

    for (idx, raw) in file.routes.iter().enumerate() {
        match validate_route(raw, defaults) {
            Ok(route) => routes.push(route),
            Err(reason) => {
                warn!("config: route #{} rejected: {}", idx, reason);
                rejected += 1;
            }
        }
    }

    if routes.is_empty() {
        anyhow::bail!(
            "no valid routes in {} ({} rejected)",
            path.display(),
            rejected
        );
    }

    info!(
        "config: loaded {} routes from {} ({} rejected)",
        routes.len(),
        path.display(),
        rejected
    );

    Ok(LoadedRoutes {
        version: file.version,
        routes,
        rejected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024"), Some(1024));
        assert_eq!(parse_size("10mb"), Some(10 * 1024 * 1024));
        assert_eq!(parse_size("512KB"), Some(512 * 1024));
        assert_eq!(parse_size("1gb"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_size("64b"), Some(64));
        assert_eq!(parse_size("lots"), None);
        assert_eq!(parse_size(""), None);
    }

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.port, 3000);
        assert_eq!(s.rate_limit_max, 100);
        assert_eq!(s.rate_limit_strict_max, 10);
        assert_eq!(s.request_body_limit, 10 * 1024 * 1024);
        assert!(s.verbose_errors());
    }

    fn write_temp(name: &str, content: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_routes_keeps_valid_drops_invalid() {
        let path = write_temp(
            "portico-config-mixed.yaml",
            r#"
version: "1"
routes:
  - path_prefix: /api/products
    upstreams: http://products:8080
  - path_prefix: ""
    upstreams: http://broken:1
  - path_prefix: /api/orders
    upstreams: ["http://orders-a:1", "http://orders-b:2"]
"#,
        );
        let loaded = load_routes(&path, &Settings::default().route_defaults()).unwrap();
        assert_eq!(loaded.routes.len(), 2);
        assert_eq!(loaded.rejected, 1);
        assert_eq!(loaded.version.as_deref(), Some("1"));
    }

    #[test]
    fn test_load_routes_all_invalid_is_error() {
        let path = write_temp(
            "portico-config-bad.yaml",
            r#"
routes:
  - path_prefix: ""
    upstreams: http://u:1
"#,
        );
        assert!(load_routes(&path, &Settings::default().route_defaults()).is_err());
    }

    #[test]
    fn test_load_routes_json() {
        let path = write_temp(
            "portico-config.json",
            r#"{"routes":[{"path_prefix":"/v1","upstreams":"http://u:1"}]}"#,
        );
        let loaded = load_routes(&path, &Settings::default().route_defaults()).unwrap();
        assert_eq!(loaded.routes[0].path_prefix, "/v1");
    }
}
