use serde::Deserialize;
use std::time::Duration;

fn default_probe_path() -> String {
    "/health".to_string()
}

fn default_true() -> bool {
    true
}

/// Top-level route file. `version` is informational only.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayFile {
    #[serde(default)]
    pub version: Option<String>,

    /// Raw route documents. Each entry is validated individually so one
    /// malformed route does not poison the rest of the table.
    pub routes: Vec<serde_yaml::Value>,
}

/// Raw per-route document as written in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteEntry {
    pub path_prefix: String,

    /// A single origin string or a sequence of origin strings.
    pub upstreams: serde_yaml::Value,

    #[serde(default = "default_probe_path")]
    pub health_probe_path: String,

    /// Humantime duration string ("30s", "1500ms"). Inherits the global
    /// upstream timeout when absent.
    #[serde(default)]
    pub request_timeout: Option<String>,

    #[serde(default = "default_true")]
    pub retry_enabled: bool,

    #[serde(default)]
    pub max_retries: Option<i64>,

    #[serde(default)]
    pub lb_strategy: Option<String>,

    #[serde(default)]
    pub plugins: Vec<PluginEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PluginEntry {
    pub name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub params: serde_json::Value,
}

/// Load-balancing strategy for a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LbStrategy {
    RoundRobin,
    Random,
    HealthAware,
}

impl LbStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "round_robin" => Some(Self::RoundRobin),
            "random" => Some(Self::Random),
            "health_aware" => Some(Self::HealthAware),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::Random => "random",
            Self::HealthAware => "health_aware",
        }
    }
}

/// A parsed upstream origin: scheme + authority, no path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Upstream {
    /// Normalized "scheme://authority".
    pub origin: String,
    pub scheme: String,
    /// "host" or "host:port".
    pub authority: String,
}

impl Upstream {
    /// Parse an absolute origin URL. Rejects missing scheme/host,
    /// non-HTTP schemes, and URLs carrying a path or query.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err("empty upstream URL".to_string());
        }

        let uri: http::Uri = trimmed
            .parse()
            .map_err(|e| format!("unparseable upstream URL {:?}: {}", raw, e))?;

        let scheme = match uri.scheme_str() {
            Some("http") => "http",
            Some("https") => "https",
            Some(other) => return Err(format!("unsupported upstream scheme {:?}", other)),
            None => return Err(format!("upstream URL {:?} is not absolute", raw)),
        };

        let authority = uri
            .authority()
            .ok_or_else(|| format!("upstream URL {:?} has no host", raw))?
            .to_string();

        if !matches!(uri.path(), "" | "/") || uri.query().is_some() {
            return Err(format!("upstream URL {:?} must be an origin without a path", raw));
        }

        Ok(Self {
            origin: format!("{}://{}", scheme, authority),
            scheme: scheme.to_string(),
            authority,
        })
    }
}

/// A fully validated route, immutable once published.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub path_prefix: String,
    pub upstreams: Vec<Upstream>,
    pub health_probe_path: String,
    pub request_timeout: Duration,
    pub retry_enabled: bool,
    pub max_retries: u32,
    pub lb_strategy: LbStrategy,
    pub plugins: Vec<PluginConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PluginConfig {
    pub name: String,
    pub enabled: bool,
    pub params: serde_json::Value,
}

/// Defaults a route inherits from the environment.
#[derive(Debug, Clone, Copy)]
pub struct RouteDefaults {
    pub request_timeout: Duration,
    pub max_retries: u32,
}

/// Coerce the `upstreams` field: a string becomes a one-element list,
/// a sequence is filtered down to its string entries, anything else
/// yields an empty list.
pub fn coerce_upstreams(value: &serde_yaml::Value) -> Vec<String> {
    match value {
        serde_yaml::Value::String(s) => vec![s.clone()],
        serde_yaml::Value::Sequence(seq) => seq
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect(),
        _ => Vec::new(),
    }
}

/// Validate one raw route document into a `Route`.
///
/// Any defect in a required field or an unambiguously invalid optional
/// field rejects the whole route with a reason; the caller decides
/// whether to keep going with the remaining routes.
pub fn validate_route(
    raw: &serde_yaml::Value,
    defaults: &RouteDefaults,
) -> Result<Route, String> {
    let entry: RouteEntry = serde_yaml::from_value(raw.clone())
        .map_err(|e| format!("malformed route: {}", e))?;

    let path_prefix = entry.path_prefix.trim().to_string();
    if path_prefix.is_empty() {
        return Err("path_prefix must be a non-empty string".to_string());
    }
    if !path_prefix.starts_with('/') {
        return Err(format!("path_prefix {:?} must start with '/'", path_prefix));
    }

    let raw_upstreams = coerce_upstreams(&entry.upstreams);
    if raw_upstreams.is_empty() {
        return Err("route has no upstream URLs".to_string());
    }
    let mut upstreams = Vec::with_capacity(raw_upstreams.len());
    for raw_url in &raw_upstreams {
        upstreams.push(Upstream::parse(raw_url)?);
    }

    let health_probe_path = {
        let p = entry.health_probe_path.trim();
        if p.is_empty() {
            return Err("health_probe_path must not be empty".to_string());
        }
        if !p.starts_with('/') {
            return Err(format!("health_probe_path {:?} must start with '/'", p));
        }
        p.to_string()
    };

    let request_timeout = match &entry.request_timeout {
        Some(s) => {
            let d = humantime::parse_duration(s)
                .map_err(|e| format!("invalid request_timeout {:?}: {}", s, e))?;
            if d.is_zero() {
                return Err(format!("request_timeout {:?} must be positive", s));
            }
            d
        }
        None => defaults.request_timeout,
    };

    let max_retries = match entry.max_retries {
        Some(n) if n < 0 => {
            return Err(format!("max_retries {} must be non-negative", n));
        }
        Some(n) => u32::try_from(n).map_err(|_| format!("max_retries {} out of range", n))?,
        None => defaults.max_retries,
    };

    let lb_strategy = match entry.lb_strategy.as_deref() {
        Some(s) => LbStrategy::parse(s)
            .ok_or_else(|| format!("unknown lb_strategy {:?}", s))?,
        None => LbStrategy::HealthAware,
    };

    let plugins = entry
        .plugins
        .into_iter()
        .map(|p| PluginConfig {
            name: p.name,
            enabled: p.enabled,
            params: p.params,
        })
        .collect();

    Ok(Route {
        path_prefix,
        upstreams,
        health_probe_path,
        request_timeout,
        retry_enabled: entry.retry_enabled,
        max_retries,
        lb_strategy,
        plugins,
    })
}
