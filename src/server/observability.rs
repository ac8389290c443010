use crate::proxy::context::{json_response, now_rfc3339, BoxBody};
use crate::server::GatewayState;
use crate::upstream::BreakerStateKind;
use http::StatusCode;
use hyper::Response;

/// Dispatch the static observability endpoints. Returns `None` when the
/// path belongs to the routing table instead.
pub fn handle(path: &str, state: &GatewayState) -> Option<Response<BoxBody>> {
    match path {
        "/livez" => Some(livez(state)),
        "/readyz" => Some(readyz(state)),
        "/startupz" => Some(startupz(state)),
        "/health" => Some(health(state)),
        "/metrics" => Some(metrics_page(state)),
        _ => None,
    }
}

/// Liveness: the process is up and serving.
fn livez(state: &GatewayState) -> Response<BoxBody> {
    json_response(
        StatusCode::OK,
        &serde_json::json!({
            "status": "alive",
            "timestamp": now_rfc3339(),
            "pid": std::process::id(),
            "uptime_seconds": state.started_at.elapsed().as_secs(),
        }),
    )
}

/// Readiness: a table is published, no breaker is open, and — when
/// anything is monitored — at least one upstream is healthy.
fn readyz(state: &GatewayState) -> Response<BoxBody> {
    let table_published = state.supervisor.table().is_some();
    let open_breakers = state.breakers.open_upstreams();
    let monitored = state.health.monitored_count();
    let upstreams_ok = monitored == 0 || state.health.any_healthy();

    let mut issues: Vec<String> = Vec::new();
    if !table_published {
        issues.push("no routing table published".to_string());
    }
    for upstream in &open_breakers {
        issues.push(format!("circuit breaker open: {}", upstream));
    }
    if !upstreams_ok {
        issues.push("no healthy upstream".to_string());
    }

    let checks = serde_json::json!({
        "routing_table": if table_published { "ok" } else { "missing" },
        "circuit_breakers": if open_breakers.is_empty() { "ok" } else { "open" },
        "upstreams": if upstreams_ok { "ok" } else { "unhealthy" },
    });

    if issues.is_empty() {
        json_response(
            StatusCode::OK,
            &serde_json::json!({
                "status": "ready",
                "checks": checks,
                "timestamp": now_rfc3339(),
            }),
        )
    } else {
        json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &serde_json::json!({
                "status": "not_ready",
                "checks": checks,
                "issues": issues,
                "timestamp": now_rfc3339(),
            }),
        )
    }
}

/// Startup: 200 once the first rebuild attempt has completed, whether
/// or not it published a table.
fn startupz(state: &GatewayState) -> Response<BoxBody> {
    if state.supervisor.startup_complete() {
        json_response(
            StatusCode::OK,
            &serde_json::json!({
                "status": "started",
                "timestamp": now_rfc3339(),
            }),
        )
    } else {
        json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &serde_json::json!({
                "status": "starting",
                "timestamp": now_rfc3339(),
            }),
        )
    }
}

/// Detailed health report: degraded when any breaker is open or any
/// monitored upstream is unhealthy.
fn health(state: &GatewayState) -> Response<BoxBody> {
    let breakers = state.breakers.snapshot();
    let upstreams = state.health.snapshot();

    let any_open = breakers
        .iter()
        .any(|(_, kind)| *kind == BreakerStateKind::Open);
    let any_unhealthy = upstreams.iter().any(|s| !s.healthy);
    let degraded = any_open || any_unhealthy;

    let breakers_json: serde_json::Map<String, serde_json::Value> = breakers
        .into_iter()
        .map(|(upstream, kind)| {
            (
                upstream,
                serde_json::Value::String(kind.as_str().to_string()),
            )
        })
        .collect();

    let upstreams_json: Vec<serde_json::Value> = upstreams
        .iter()
        .map(|s| {
            serde_json::json!({
                "upstream": s.upstream,
                "healthy": s.healthy,
                "consecutiveFailures": s.consecutive_failures,
                "consecutiveSuccesses": s.consecutive_successes,
                "lastCheckMs": s.last_check_ms,
            })
        })
        .collect();

    let (rss_kb, peak_kb) = process_memory_kb();
    let body = serde_json::json!({
        "status": if degraded { "degraded" } else { "healthy" },
        "memory": {
            "rssKb": rss_kb,
            "peakRssKb": peak_kb,
        },
        "circuitBreakers": breakers_json,
        "upstreams": upstreams_json,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "timestamp": now_rfc3339(),
    });

    let status = if degraded {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    json_response(status, &body)
}

fn metrics_page(state: &GatewayState) -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
        .body(crate::proxy::context::full_body(state.metrics.render()))
        .unwrap()
}

/// Resident set figures from `/proc/self/status`; zeros on platforms
/// without procfs.
fn process_memory_kb() -> (u64, u64) {
    match std::fs::read_to_string("/proc/self/status") {
        Ok(content) => parse_proc_status(&content),
        Err(_) => (0, 0),
    }
}

fn parse_proc_status(content: &str) -> (u64, u64) {
    let mut rss = 0;
    let mut peak = 0;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            rss = parse_kb(rest);
        } else if let Some(rest) = line.strip_prefix("VmHWM:") {
            peak = parse_kb(rest);
        }
    }
    (rss, peak)
}

fn parse_kb(rest: &str) -> u64 {
    rest.trim()
        .trim_end_matches("kB")
        .trim()
        .parse()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proc_status() {
        let sample = "\
Name:\tportico-gateway
VmPeak:\t  123456 kB
VmHWM:\t   98765 kB
VmRSS:\t   54321 kB
Threads:\t8
";
        assert_eq!(parse_proc_status(sample), (54321, 98765));
    }

    #[test]
    fn test_parse_proc_status_missing_fields() {
        assert_eq!(parse_proc_status("Name:\tx\n"), (0, 0));
    }

    #[test]
    fn test_parse_kb_handles_whitespace() {
        assert_eq!(parse_kb("   54321 kB"), 54321);
        assert_eq!(parse_kb("garbage"), 0);
    }
}
