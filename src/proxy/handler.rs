use crate::config::types::Upstream;
use crate::error::{transport_error, GatewayError};
use crate::plugin::PluginResult;
use crate::proxy::context::{empty_body, full_body, BoxBody, RequestContext};
use crate::routing::{rewrite_path, CompiledRoute};
use crate::server::GatewayState;
use crate::upstream::{loadbalance, RetryPolicy};
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONNECTION, HOST, TRANSFER_ENCODING};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Per-attempt backoff inside the proxy loop is bounded to 1 s — the
/// shorter per-request budget, distinct from the engine-wide retry
/// policy defaults.
const ATTEMPT_BACKOFF_CAP: Duration = Duration::from_secs(1);

/// Forward a request through a matched route:
///
/// 1. plugin chain (short-circuit on any written response)
/// 2. breaker-aware upstream selection with failover
/// 3. prefix rewrite + hop-header hygiene
/// 4. forward under the breaker, bounded by the route timeout
/// 5. on retryable failure, back off and reselect excluding the
///    failing upstream where possible
/// 6. stream the upstream response back without buffering
pub async fn handle_proxy(
    req: Request<Incoming>,
    route: Arc<CompiledRoute>,
    ctx: &mut RequestContext,
    state: &GatewayState,
) -> Response<BoxBody> {
    let (parts, body) = req.into_parts();
    let method = parts.method;
    let uri = parts.uri;
    let mut headers = parts.headers;

    // Plugin chain runs against the original client request.
    for plugin in &route.plugins {
        if let PluginResult::Respond(resp) = plugin
            .on_request(ctx, &method, &uri, &mut headers)
            .await
        {
            debug!(
                correlation_id = %ctx.correlation_id,
                route = %route.route.path_prefix,
                "proxy: plugin short-circuited"
            );
            return resp;
        }
    }

    let suffix = rewrite_path(&route.route.path_prefix, uri.path(), uri.query());

    prepare_forward_headers(&mut headers, ctx);

    let max_retries = if route.route.retry_enabled {
        route.route.max_retries
    } else {
        0
    };

    // Retries need a replayable body. A chunked request without a
    // Content-Length bypassed the frontend size precheck, so it is
    // buffered too and the cap enforced on the actual bytes. Only a
    // length-checked, no-retry body streams straight through.
    let content_length = headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let must_buffer = max_retries > 0 || content_length.is_none();
    let (body_bytes, mut streaming_body): (Option<Bytes>, Option<BoxBody>) = if must_buffer {
        match body.collect().await {
            Ok(collected) => {
                let bytes = collected.to_bytes();
                if bytes.len() as u64 > state.settings.request_body_limit {
                    return ctx.error_response(&GatewayError::PayloadTooLarge);
                }
                (Some(bytes), None)
            }
            Err(e) => {
                warn!(
                    correlation_id = %ctx.correlation_id,
                    "proxy: failed to read request body: {}", e
                );
                return ctx
                    .error_response(&GatewayError::InvalidRequest("unreadable body".into()));
            }
        }
    } else {
        (None, Some(body.boxed()))
    };

    let backoff = {
        let mut policy = state.settings.retry_policy();
        policy.max_delay = policy.max_delay.min(ATTEMPT_BACKOFF_CAP);
        policy.max_retries = max_retries;
        policy
    };
    // The retry loop never outlives the route's request timeout.
    let deadline = Instant::now() + route.route.request_timeout;

    let mut tried: Vec<String> = Vec::new();
    let mut last_err: Option<GatewayError> = None;

    for attempt in 0..=max_retries {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            let err = last_err.unwrap_or(GatewayError::UpstreamTimeout);
            return ctx.error_response(&err);
        }

        let upstream = match pick_candidate(&route, &tried, state) {
            Some(u) => u,
            None => {
                return ctx.error_response(&GatewayError::NoUpstreamAvailable);
            }
        };
        ctx.upstream.clear();
        ctx.upstream.push_str(&upstream.origin);

        let upstream_req = match build_upstream_request(
            &method,
            &upstream,
            &suffix,
            &headers,
            &body_bytes,
            &mut streaming_body,
        ) {
            Ok(r) => r,
            Err(err) => return ctx.error_response(&err),
        };

        let attempt_start = Instant::now();
        let client = state.http_client.clone();
        let result = state
            .breakers
            .execute(&upstream.origin, async move {
                match tokio::time::timeout(remaining, client.request(upstream_req)).await {
                    Ok(Ok(resp)) => Ok(resp),
                    Ok(Err(e)) => Err(transport_error(&e)),
                    Err(_) => Err(GatewayError::UpstreamTimeout),
                }
            })
            .await;

        record_attempt_metrics(&upstream.origin, &result, attempt_start.elapsed());

        match result {
            Ok(resp) if resp.status().as_u16() >= 500 => {
                // Breaker failure was recorded by execute. Retry if
                // budget remains, otherwise pass the 5xx through.
                let err = GatewayError::UpstreamStatus(resp.status().as_u16());
                if attempt < max_retries
                    && sleep_backoff(&backoff, attempt, deadline, ctx, &err).await
                {
                    tried.push(upstream.origin.clone());
                    last_err = Some(err);
                    continue;
                }
                return build_downstream_response(resp);
            }
            Ok(resp) => {
                return build_downstream_response(resp);
            }
            Err(err) => {
                if err.is_retryable()
                    && attempt < max_retries
                    && sleep_backoff(&backoff, attempt, deadline, ctx, &err).await
                {
                    tried.push(upstream.origin.clone());
                    last_err = Some(err);
                    continue;
                }
                return ctx.error_response(&err);
            }
        }
    }

    let err = last_err.unwrap_or(GatewayError::NoUpstreamAvailable);
    ctx.error_response(&err)
}

/// Back off before the next attempt, staying inside the loop deadline.
/// Returns `false` when no budget remains for another attempt.
async fn sleep_backoff(
    policy: &RetryPolicy,
    attempt: u32,
    deadline: Instant,
    ctx: &RequestContext,
    err: &GatewayError,
) -> bool {
    let delay = policy.delay_for(attempt);
    if Instant::now() + delay >= deadline {
        return false;
    }
    metrics::counter!(
        "upstream_retries_total",
        "route" => ctx.route_prefix.clone(),
    )
    .increment(1);
    debug!(
        correlation_id = %ctx.correlation_id,
        upstream = %ctx.upstream,
        attempt = attempt + 1,
        delay_ms = delay.as_millis() as u64,
        "proxy: retrying after error: {}", err
    );
    tokio::time::sleep(delay).await;
    true
}

/// Selection for one attempt: exclude already-tried upstreams when
/// alternatives remain, then exclude open breakers. If the breaker
/// filter empties the set, fail over to the unfiltered pool — the
/// forward itself still runs under the breaker, so an open circuit
/// surfaces as a retryable CIRCUIT_OPEN rather than a network attempt.
pub(crate) fn pick_candidate(
    route: &CompiledRoute,
    tried: &[String],
    state: &GatewayState,
) -> Option<Arc<Upstream>> {
    let not_tried: Vec<Arc<Upstream>> = route
        .upstreams
        .iter()
        .filter(|u| !tried.iter().any(|t| t == &u.origin))
        .cloned()
        .collect();
    let pool = if not_tried.is_empty() {
        route.upstreams.clone()
    } else {
        not_tried
    };

    let closed: Vec<Arc<Upstream>> = pool
        .iter()
        .filter(|u| !state.breakers.is_open(&u.origin))
        .cloned()
        .collect();
    let candidates = if closed.is_empty() { pool } else { closed };

    loadbalance::select(
        route.route.lb_strategy,
        &candidates,
        &route.cursor,
        &state.health,
    )
}

fn build_upstream_request(
    method: &http::Method,
    upstream: &Upstream,
    suffix: &str,
    headers: &http::HeaderMap,
    body_bytes: &Option<Bytes>,
    streaming_body: &mut Option<BoxBody>,
) -> Result<Request<BoxBody>, GatewayError> {
    let uri = format!("{}{}", upstream.origin, suffix);

    let mut outbound = headers.clone();
    outbound.insert(
        HOST,
        HeaderValue::from_str(&upstream.authority)
            .map_err(|_| GatewayError::InvalidRequest("bad upstream authority".into()))?,
    );

    let body: BoxBody = if let Some(bytes) = body_bytes {
        full_body(bytes.clone())
    } else {
        streaming_body.take().unwrap_or_else(empty_body)
    };

    let mut builder = Request::builder().method(method.clone()).uri(&uri);
    for (name, value) in &outbound {
        builder = builder.header(name, value);
    }
    builder
        .body(body)
        .map_err(|e| GatewayError::Internal(format!("failed to build upstream request: {}", e)))
}

/// Strip hop-by-hop headers, append the client to `X-Forwarded-For`,
/// and stamp the correlation id onto the outbound request.
fn prepare_forward_headers(headers: &mut http::HeaderMap, ctx: &RequestContext) {
    remove_hop_headers(headers);

    let client_ip = ctx.client_ip.to_string();
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    static XRI: HeaderName = HeaderName::from_static("x-real-ip");
    static XRID: HeaderName = HeaderName::from_static("x-request-id");

    if let Some(existing) = headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        let mut combined = String::with_capacity(existing.len() + 2 + client_ip.len());
        combined.push_str(existing);
        combined.push_str(", ");
        combined.push_str(&client_ip);
        if let Ok(v) = HeaderValue::from_str(&combined) {
            headers.insert(XFF.clone(), v);
        }
    } else if let Ok(v) = HeaderValue::from_str(&client_ip) {
        headers.insert(XFF.clone(), v);
    }

    if let Ok(v) = HeaderValue::from_str(&client_ip) {
        headers.insert(XRI.clone(), v);
    }

    if let Ok(v) = HeaderValue::from_str(&ctx.correlation_id) {
        headers.insert(XRID.clone(), v);
    }
}

fn remove_hop_headers(headers: &mut http::HeaderMap) {
    let fixed: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailer"),
        HeaderName::from_static("trailers"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];
    for h in fixed {
        headers.remove(h);
    }
    let proxy_headers: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with("proxy-"))
        .cloned()
        .collect();
    for h in proxy_headers {
        headers.remove(h);
    }
}

fn record_attempt_metrics(
    upstream: &str,
    result: &Result<Response<Incoming>, GatewayError>,
    elapsed: Duration,
) {
    let status_label = match result {
        Ok(resp) => {
            let mut buf = itoa::Buffer::new();
            buf.format(resp.status().as_u16()).to_owned()
        }
        Err(err) => err.transport_code().unwrap_or("error").to_owned(),
    };
    metrics::counter!(
        "upstream_requests_total",
        "upstream" => upstream.to_string(),
        "status_code" => status_label,
    )
    .increment(1);
    metrics::histogram!(
        "upstream_request_duration_seconds",
        "upstream" => upstream.to_string(),
    )
    .record(elapsed.as_secs_f64());
}

/// Re-frame the upstream response for the client, streaming the body.
fn build_downstream_response(upstream_resp: Response<Incoming>) -> Response<BoxBody> {
    let (parts, body) = upstream_resp.into_parts();
    let mut builder = Response::builder().status(parts.status);
    for (name, value) in &parts.headers {
        builder = builder.header(name, value);
    }
    builder.body(body.boxed()).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_hop_headers() {
        let mut headers = http::HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert("upgrade", HeaderValue::from_static("h2c"));
        headers.insert("te", HeaderValue::from_static("trailers"));
        headers.insert("proxy-authorization", HeaderValue::from_static("Basic x"));
        headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        headers.insert("accept", HeaderValue::from_static("application/json"));

        remove_hop_headers(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("accept"));
    }

    #[test]
    fn test_forward_headers_append_xff_and_correlation() {
        let ctx = RequestContext::new(
            "GET".into(),
            "/x".into(),
            "192.0.2.1".parse().unwrap(),
            "cid-42".into(),
            true,
        );

        let mut headers = http::HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9"));
        prepare_forward_headers(&mut headers, &ctx);

        assert_eq!(
            headers.get("x-forwarded-for").unwrap(),
            "203.0.113.9, 192.0.2.1"
        );
        assert_eq!(headers.get("x-real-ip").unwrap(), "192.0.2.1");
        assert_eq!(headers.get("x-request-id").unwrap(), "cid-42");

        let mut fresh = http::HeaderMap::new();
        prepare_forward_headers(&mut fresh, &ctx);
        assert_eq!(fresh.get("x-forwarded-for").unwrap(), "192.0.2.1");
    }

    #[test]
    fn test_backoff_cap_is_one_second() {
        let policy = RetryPolicy {
            initial: Duration::from_millis(100),
            factor: 2.0,
            max_delay: ATTEMPT_BACKOFF_CAP,
            max_retries: 10,
        };
        // 100ms·2^6 = 6.4s uncapped; the per-attempt budget clamps it.
        assert_eq!(policy.backoff(6), Duration::from_secs(1));
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
    }
}
