use crate::error::GatewayError;
use crate::limiter::RateLimiter;
use crate::proxy::context::{json_response, now_rfc3339, BoxBody, RequestContext};
use crate::proxy::handle_proxy;
use crate::server::{observability, GatewayState};
use bytes::Bytes;
use http::header::{
    HeaderName, HeaderValue, ACCEPT_ENCODING, ACCESS_CONTROL_ALLOW_CREDENTIALS,
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_MAX_AGE, ACCESS_CONTROL_REQUEST_HEADERS, ACCESS_CONTROL_REQUEST_METHOD,
    CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, ORIGIN, STRICT_TRANSPORT_SECURITY,
    TRANSFER_ENCODING, VARY, X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS,
};
use http::{Method, StatusCode};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::{Request, Response};
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Header names consulted, in order, for an inbound correlation id.
const CORRELATION_HEADERS: [&str; 3] = ["x-request-id", "x-correlation-id", "x-trace-id"];
const MAX_CORRELATION_ID_LEN: usize = 128;

const CORS_METHODS: &str = "GET, POST, PUT, DELETE, PATCH, OPTIONS";

/// The fixed global middleware chain. Order is load-bearing: the body
/// cap and rate limiter run before any routing work, the deadline wraps
/// dispatch, and headers/compression/metrics/logging run on the way out.
pub async fn handle_request(
    req: Request<Incoming>,
    state: GatewayState,
    peer: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let origin = req
        .headers()
        .get(ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let accept_encoding = req
        .headers()
        .get(ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let suppress_compression = req.headers().contains_key("x-no-compression");

    let correlation_id = correlation_id_from(req.headers());
    let client_ip = client_ip_from(state.settings.trust_proxy, req.headers(), peer);

    metrics::gauge!("http_requests_in_flight").increment(1.0);

    let mut ctx = RequestContext::new(
        method.to_string(),
        path.clone(),
        client_ip,
        correlation_id.clone(),
        state.settings.verbose_errors(),
    );

    let mut resp = if method == Method::OPTIONS
        && req.headers().contains_key(ACCESS_CONTROL_REQUEST_METHOD)
    {
        preflight_response(&state, req.headers(), origin.as_deref())
    } else {
        // Per-request deadline: if dispatch has not produced a response
        // by now, answer 504 and close the connection.
        match tokio::time::timeout(
            state.settings.request_timeout,
            dispatch(req, &state, &mut ctx),
        )
        .await
        {
            Ok(resp) => resp,
            Err(_) => {
                let mut resp = ctx.error_response(&GatewayError::UpstreamTimeout);
                resp.headers_mut()
                    .insert(CONNECTION, HeaderValue::from_static("close"));
                resp
            }
        }
    };

    apply_security_headers(resp.headers_mut());
    apply_cors_headers(resp.headers_mut(), &state, origin.as_deref());
    if let Ok(v) = HeaderValue::from_str(&correlation_id) {
        resp.headers_mut()
            .insert(HeaderName::from_static("x-request-id"), v);
    }

    if !suppress_compression {
        resp = maybe_compress(
            resp,
            accept_encoding.as_deref(),
            state.settings.compression_threshold,
        );
    }

    let status = resp.status().as_u16();
    finalize_metrics(&method, &ctx, status, start);
    access_log(&ctx, &method, &path, status, start);

    Ok(resp)
}

async fn dispatch(
    req: Request<Incoming>,
    state: &GatewayState,
    ctx: &mut RequestContext,
) -> Response<BoxBody> {
    let path = ctx.path.clone();

    // Oversize bodies are rejected before any routing work.
    if let Some(content_length) = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        if content_length > state.settings.request_body_limit {
            return ctx.error_response(&GatewayError::PayloadTooLarge);
        }
    }

    let key = RateLimiter::client_key(state.settings.trust_proxy, req.headers(), ctx.client_ip);
    let decision = state.limiter.check(&key, &path).await;
    if !decision.allowed {
        return ctx.error_response(&GatewayError::RateLimited {
            retry_after_secs: decision.retry_after_secs,
        });
    }

    if let Some(resp) = observability::handle(&path, state) {
        return resp;
    }

    let table = match state.supervisor.table() {
        Some(t) => t,
        None => return ctx.error_response(&GatewayError::NotConfigured),
    };

    match table.match_route(&path) {
        Some(route) => {
            ctx.route_prefix = route.route.path_prefix.clone();
            handle_proxy(req, route, ctx, state).await
        }
        None => {
            debug!(
                correlation_id = %ctx.correlation_id,
                path = %path,
                "no route matched"
            );
            json_response(
                StatusCode::NOT_FOUND,
                &serde_json::json!({
                    "error": "Not Found",
                    "message": format!("No route matches {}", path),
                    "timestamp": now_rfc3339(),
                }),
            )
        }
    }
}

/// First non-empty trimmed value from the correlation header set (at
/// most 128 bytes), otherwise a fresh UUID.
fn correlation_id_from(headers: &http::HeaderMap) -> String {
    for name in CORRELATION_HEADERS {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            let trimmed = value.trim();
            if !trimmed.is_empty() && trimmed.len() <= MAX_CORRELATION_ID_LEN {
                return trimmed.to_string();
            }
        }
    }
    uuid::Uuid::new_v4().to_string()
}

/// The real client IP: the left-most trusted forwarded-for entry when
/// proxy trust is enabled, else the TCP peer.
fn client_ip_from(trust_proxy: bool, headers: &http::HeaderMap, peer: SocketAddr) -> IpAddr {
    if trust_proxy {
        if let Some(ip) = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|s| s.trim().parse::<IpAddr>().ok())
        {
            return ip;
        }
    }
    peer.ip()
}

fn apply_security_headers(headers: &mut http::HeaderMap) {
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(X_FRAME_OPTIONS, HeaderValue::from_static("SAMEORIGIN"));
    headers.insert(
        STRICT_TRANSPORT_SECURITY,
        HeaderValue::from_static("max-age=31536000"),
    );
}

fn origin_allowed(allowed: &[String], origin: &str) -> bool {
    allowed.iter().any(|o| o == "*" || o == origin)
}

fn apply_cors_headers(headers: &mut http::HeaderMap, state: &GatewayState, origin: Option<&str>) {
    let Some(origin) = origin else { return };
    if !origin_allowed(&state.settings.cors_origins, origin) {
        return;
    }

    let wildcard = state.settings.cors_origins.iter().any(|o| o == "*");
    let allow_origin = if wildcard && !state.settings.cors_credentials {
        HeaderValue::from_static("*")
    } else {
        match HeaderValue::from_str(origin) {
            Ok(v) => v,
            Err(_) => return,
        }
    };
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin);
    headers.append(VARY, HeaderValue::from_static("origin"));
    if state.settings.cors_credentials {
        headers.insert(
            ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
    }
}

fn preflight_response(
    state: &GatewayState,
    req_headers: &http::HeaderMap,
    origin: Option<&str>,
) -> Response<BoxBody> {
    let mut resp = Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(crate::proxy::context::empty_body())
        .unwrap();

    apply_cors_headers(resp.headers_mut(), state, origin);
    if resp.headers().contains_key(ACCESS_CONTROL_ALLOW_ORIGIN) {
        resp.headers_mut().insert(
            ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(CORS_METHODS),
        );
        let allow_headers = req_headers
            .get(ACCESS_CONTROL_REQUEST_HEADERS)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("*"));
        resp.headers_mut()
            .insert(ACCESS_CONTROL_ALLOW_HEADERS, allow_headers);
        resp.headers_mut()
            .insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
    }
    resp
}

fn finalize_metrics(method: &Method, ctx: &RequestContext, status: u16, start: Instant) {
    let mut buf = itoa::Buffer::new();
    let status_str = buf.format(status).to_owned();

    metrics::counter!(
        "http_requests_total",
        "method" => method.to_string(),
        "route" => ctx.route_prefix.clone(),
        "status_code" => status_str.clone(),
    )
    .increment(1);
    metrics::histogram!(
        "http_request_duration_seconds",
        "route" => ctx.route_prefix.clone(),
    )
    .record(start.elapsed().as_secs_f64());
    if status >= 400 {
        let error_type = if status >= 500 {
            "server_error"
        } else {
            "client_error"
        };
        metrics::counter!(
            "http_request_errors_total",
            "method" => method.to_string(),
            "route" => ctx.route_prefix.clone(),
            "status_code" => status_str,
            "error_type" => error_type,
        )
        .increment(1);
    }
    metrics::gauge!("http_requests_in_flight").decrement(1.0);
}

/// One structured access-log line per request, level tied to the
/// status class.
fn access_log(ctx: &RequestContext, method: &Method, path: &str, status: u16, start: Instant) {
    let latency_ms = start.elapsed().as_millis() as u64;
    if status >= 500 {
        error!(
            correlation_id = %ctx.correlation_id,
            client_ip = %ctx.client_ip,
            method = %method,
            path = %path,
            status = status,
            route = %ctx.route_prefix,
            upstream = %ctx.upstream,
            latency_ms = latency_ms,
            "access"
        );
    } else if status >= 400 {
        warn!(
            correlation_id = %ctx.correlation_id,
            client_ip = %ctx.client_ip,
            method = %method,
            path = %path,
            status = status,
            route = %ctx.route_prefix,
            upstream = %ctx.upstream,
            latency_ms = latency_ms,
            "access"
        );
    } else {
        info!(
            correlation_id = %ctx.correlation_id,
            client_ip = %ctx.client_ip,
            method = %method,
            path = %path,
            status = status,
            route = %ctx.route_prefix,
            upstream = %ctx.upstream,
            latency_ms = latency_ms,
            "access"
        );
    }
}

// ---------------------------------------------------------------------------
// Streaming response compression (gzip / brotli).
// ---------------------------------------------------------------------------

/// Negotiate the best encoding from the client's `Accept-Encoding`.
/// Quality values are honored: `br;q=0` will not select brotli.
fn negotiate_encoding(accept_encoding: &str) -> Option<&'static str> {
    let mut br_ok = false;
    let mut gzip_ok = false;

    for part in accept_encoding.split(',') {
        let part = part.trim();
        let mut tokens = part.splitn(2, ';');
        let encoding = tokens.next().unwrap_or("").trim().to_ascii_lowercase();

        let q: f32 = tokens
            .next()
            .and_then(|params| {
                params.split(';').find_map(|p| {
                    let p = p.trim();
                    p.strip_prefix("q=")
                        .and_then(|v| v.trim().parse::<f32>().ok())
                })
            })
            .unwrap_or(1.0);
        if q <= 0.0 {
            continue;
        }

        match encoding.as_str() {
            "br" => br_ok = true,
            "gzip" => gzip_ok = true,
            "*" => {
                br_ok = true;
                gzip_ok = true;
            }
            _ => {}
        }
    }

    if br_ok {
        Some("br")
    } else if gzip_ok {
        Some("gzip")
    } else {
        None
    }
}

/// Compress the response body on the fly when the client accepts it,
/// the upstream has not already encoded, and the body is not known to
/// be under the threshold.
fn maybe_compress(
    resp: Response<BoxBody>,
    accept_encoding: Option<&str>,
    threshold: u64,
) -> Response<BoxBody> {
    let Some(accept_encoding) = accept_encoding else {
        return resp;
    };
    if resp.headers().contains_key(CONTENT_ENCODING) {
        return resp;
    }
    if let Some(len) = resp
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        if len < threshold {
            return resp;
        }
    }
    let Some(encoding) = negotiate_encoding(accept_encoding) else {
        return resp;
    };

    let version = resp.version();
    let (mut parts, body) = resp.into_parts();

    let body_reader = tokio_util::io::StreamReader::new(BodyStream(body));
    let buf_reader = tokio::io::BufReader::new(body_reader);

    let compressed_body: BoxBody = match encoding {
        "gzip" => {
            let encoder = async_compression::tokio::bufread::GzipEncoder::new(buf_reader);
            wrap_encoder_as_body(encoder)
        }
        "br" => {
            let encoder = async_compression::tokio::bufread::BrotliEncoder::with_quality(
                buf_reader,
                async_compression::Level::Fastest,
            );
            wrap_encoder_as_body(encoder)
        }
        _ => unreachable!(),
    };

    parts
        .headers
        .insert(CONTENT_ENCODING, HeaderValue::from_static(encoding));
    // Compressed size is unknown for a streaming body.
    parts.headers.remove(CONTENT_LENGTH);
    if version == http::Version::HTTP_11 || version == http::Version::HTTP_10 {
        parts
            .headers
            .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    }

    Response::from_parts(parts, compressed_body)
}

/// Wrap an `AsyncRead` compression encoder into a streaming body.
fn wrap_encoder_as_body<R>(encoder: R) -> BoxBody
where
    R: tokio::io::AsyncRead + Send + Sync + 'static,
{
    use tokio::io::AsyncReadExt;

    let encoder = Box::pin(encoder);
    let stream = futures_util::stream::unfold(encoder, |mut enc| async move {
        let mut buf = vec![0u8; 8192];
        match enc.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                let frame: Result<Frame<Bytes>, hyper::Error> = Ok(Frame::data(Bytes::from(buf)));
                Some((frame, enc))
            }
            Err(_) => None,
        }
    });
    BodyExt::boxed(StreamBody::new(stream))
}

/// Bridge between hyper's body framing and tokio's I/O traits so the
/// compression encoders can consume the body as a byte stream.
struct BodyStream(BoxBody);

impl futures_util::Stream for BodyStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use hyper::body::Body;

        loop {
            match std::pin::Pin::new(&mut self.0).poll_frame(cx) {
                std::task::Poll::Ready(Some(Ok(frame))) => {
                    if let Ok(data) = frame.into_data() {
                        return std::task::Poll::Ready(Some(Ok(data)));
                    }
                    continue;
                }
                std::task::Poll::Ready(Some(Err(e))) => {
                    return std::task::Poll::Ready(Some(Err(std::io::Error::other(
                        e.to_string(),
                    ))));
                }
                std::task::Poll::Ready(None) => return std::task::Poll::Ready(None),
                std::task::Poll::Pending => return std::task::Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::context::full_body;

    #[test]
    fn test_correlation_id_echoes_first_match() {
        let mut headers = http::HeaderMap::new();
        headers.insert("x-trace-id", HeaderValue::from_static("trace-1"));
        headers.insert("x-correlation-id", HeaderValue::from_static("corr-1"));
        assert_eq!(correlation_id_from(&headers), "corr-1");

        headers.insert("x-request-id", HeaderValue::from_static("  req-1  "));
        assert_eq!(correlation_id_from(&headers), "req-1");
    }

    #[test]
    fn test_correlation_id_generated_when_absent_or_oversized() {
        let headers = http::HeaderMap::new();
        let generated = correlation_id_from(&headers);
        assert_eq!(generated.len(), 36);

        let mut headers = http::HeaderMap::new();
        let oversized = "x".repeat(200);
        headers.insert(
            "x-request-id",
            HeaderValue::from_str(&oversized).unwrap(),
        );
        let id = correlation_id_from(&headers);
        assert_ne!(id, oversized);
        assert_eq!(id.len(), 36);
    }

    #[test]
    fn test_client_ip_respects_trust_proxy() {
        let peer: SocketAddr = "192.0.2.1:50000".parse().unwrap();
        let mut headers = http::HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.5, 10.0.0.1"),
        );

        assert_eq!(
            client_ip_from(true, &headers, peer),
            "203.0.113.5".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            client_ip_from(false, &headers, peer),
            "192.0.2.1".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_origin_allowed() {
        let wildcard = vec!["*".to_string()];
        assert!(origin_allowed(&wildcard, "https://any.example"));

        let fixed = vec!["https://app.example".to_string()];
        assert!(origin_allowed(&fixed, "https://app.example"));
        assert!(!origin_allowed(&fixed, "https://evil.example"));
    }

    #[test]
    fn test_security_headers() {
        let mut headers = http::HeaderMap::new();
        apply_security_headers(&mut headers);
        assert_eq!(headers.get(X_CONTENT_TYPE_OPTIONS).unwrap(), "nosniff");
        assert_eq!(headers.get(X_FRAME_OPTIONS).unwrap(), "SAMEORIGIN");
        assert_eq!(
            headers.get(STRICT_TRANSPORT_SECURITY).unwrap(),
            "max-age=31536000"
        );
    }

    #[test]
    fn test_negotiate_encoding() {
        assert_eq!(negotiate_encoding("gzip, br"), Some("br"));
        assert_eq!(negotiate_encoding("gzip"), Some("gzip"));
        assert_eq!(negotiate_encoding("gzip;q=1, br;q=0"), Some("gzip"));
        assert_eq!(negotiate_encoding("identity"), None);
        assert_eq!(negotiate_encoding("*"), Some("br"));
    }

    #[test]
    fn test_maybe_compress_skips_small_bodies() {
        let resp = Response::builder()
            .header(CONTENT_LENGTH, "10")
            .body(full_body("tiny body!"))
            .unwrap();
        let out = maybe_compress(resp, Some("gzip"), 1024);
        assert!(!out.headers().contains_key(CONTENT_ENCODING));
    }

    #[test]
    fn test_maybe_compress_skips_already_encoded() {
        let resp = Response::builder()
            .header(CONTENT_ENCODING, "gzip")
            .body(full_body(vec![0u8; 4096]))
            .unwrap();
        let out = maybe_compress(resp, Some("gzip"), 1024);
        // Unchanged: upstream already chose an encoding.
        assert_eq!(out.headers().get(CONTENT_ENCODING).unwrap(), "gzip");
        assert!(out.headers().get(TRANSFER_ENCODING).is_none());
    }

    #[test]
    fn test_maybe_compress_encodes_large_bodies() {
        let resp = Response::builder()
            .header(CONTENT_LENGTH, "4096")
            .body(full_body(vec![0u8; 4096]))
            .unwrap();
        let out = maybe_compress(resp, Some("gzip"), 1024);
        assert_eq!(out.headers().get(CONTENT_ENCODING).unwrap(), "gzip");
        assert!(out.headers().get(CONTENT_LENGTH).is_none());
    }
}
