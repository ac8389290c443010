use crate::error::GatewayError;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, RETRY_AFTER};
use http_body_util::{BodyExt, Full};
use std::net::IpAddr;
use std::time::{Instant, SystemTime};
use tracing::{error, warn};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// RFC-3339 timestamp stamped onto every JSON error body.
pub fn now_rfc3339() -> String {
    humantime::format_rfc3339_millis(SystemTime::now()).to_string()
}

/// Build a JSON response with the standard `{error, message, timestamp}`
/// shape.
pub fn json_response(
    status: http::StatusCode,
    body: &serde_json::Value,
) -> hyper::Response<BoxBody> {
    hyper::Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(full_body(body.to_string()))
        .unwrap()
}

/// Per-request context flowing through the middleware chain, plugin
/// chain, and proxy pipeline.
pub struct RequestContext {
    pub method: String,
    pub path: String,
    pub client_ip: IpAddr,
    pub correlation_id: String,
    /// Matched route prefix; empty until route match.
    pub route_prefix: String,
    /// Upstream origin of the most recent forward attempt.
    pub upstream: String,
    pub start: Instant,
    /// Whether internal error details may reach the client.
    pub verbose_errors: bool,
}

impl RequestContext {
    pub fn new(
        method: String,
        path: String,
        client_ip: IpAddr,
        correlation_id: String,
        verbose_errors: bool,
    ) -> Self {
        Self {
            method,
            path,
            client_ip,
            correlation_id,
            route_prefix: String::new(),
            upstream: String::new(),
            start: Instant::now(),
            verbose_errors,
        }
    }

    /// Single exit point for error paths: one structured log entry plus
    /// the JSON error body.
    pub fn error_response(&self, err: &GatewayError) -> hyper::Response<BoxBody> {
        let status = err.status();

        let log_code = err.transport_code().unwrap_or(err.label());
        if status.is_server_error() {
            error!(
                correlation_id = %self.correlation_id,
                method = %self.method,
                path = %self.path,
                upstream = %self.upstream,
                status = status.as_u16(),
                code = log_code,
                "request failed: {}",
                err
            );
        } else {
            warn!(
                correlation_id = %self.correlation_id,
                method = %self.method,
                path = %self.path,
                upstream = %self.upstream,
                status = status.as_u16(),
                code = log_code,
                "request rejected: {}",
                err
            );
        }

        match err {
            GatewayError::RateLimited { retry_after_secs } => {
                let body = serde_json::json!({
                    "error": err.label(),
                    "message": format!(
                        "Rate limit exceeded, retry in {} seconds",
                        retry_after_secs
                    ),
                    "retryAfter": retry_after_secs,
                    "timestamp": now_rfc3339(),
                });
                let mut resp = json_response(status, &body);
                resp.headers_mut().insert(
                    RETRY_AFTER,
                    http::HeaderValue::from_str(&retry_after_secs.to_string()).unwrap(),
                );
                resp
            }
            GatewayError::Internal(_) if !self.verbose_errors => {
                let body = serde_json::json!({
                    "error": err.label(),
                    "message": "An unexpected error occurred",
                    "timestamp": now_rfc3339(),
                });
                json_response(status, &body)
            }
            _ => {
                let body = serde_json::json!({
                    "error": err.label(),
                    "message": err.to_string(),
                    "timestamp": now_rfc3339(),
                });
                json_response(status, &body)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    fn ctx(verbose: bool) -> RequestContext {
        RequestContext::new(
            "GET".into(),
            "/x".into(),
            "127.0.0.1".parse().unwrap(),
            "cid-1".into(),
            verbose,
        )
    }

    async fn body_json(resp: hyper::Response<BoxBody>) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_error_body_has_timestamp() {
        tokio_test::block_on(async {
            let resp = ctx(true).error_response(&GatewayError::NotConfigured);
            assert_eq!(resp.status(), 503);
            let body = body_json(resp).await;
            assert_eq!(body["error"], "Gateway not configured");
            assert!(body["timestamp"].as_str().unwrap().contains('T'));
        });
    }

    #[tokio::test]
    async fn test_rate_limited_carries_retry_after() {
        let resp = ctx(true).error_response(&GatewayError::RateLimited {
            retry_after_secs: 60,
        });
        assert_eq!(resp.status(), 429);
        assert_eq!(resp.headers().get(RETRY_AFTER).unwrap(), "60");
        let body = body_json(resp).await;
        assert_eq!(body["retryAfter"], 60);
    }

    #[tokio::test]
    async fn test_internal_message_suppressed_in_production() {
        let err = GatewayError::Internal("db password leaked".into());
        let body = body_json(ctx(false).error_response(&err)).await;
        assert_eq!(body["message"], "An unexpected error occurred");

        let body = body_json(ctx(true).error_response(&err)).await;
        assert!(body["message"].as_str().unwrap().contains("db password"));
    }
}
