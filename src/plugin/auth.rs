use crate::plugin::{PluginError, PluginInstance, PluginResult};
use crate::proxy::context::{full_body, RequestContext};
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use std::time::Duration;
use tracing::{debug, warn};

/// Verification endpoint on the auth service.
const VERIFY_PATH: &str = "/api/v1/authz/verify";

/// Client metadata headers copied through to the auth service.
const FORWARDED_HEADERS: [&str; 9] = [
    "accept-language",
    "device-type",
    "app-version",
    "device-id",
    "x-device-os",
    "gps-coordinates",
    "x-forwarded-for",
    "x-real-ip",
    "user-agent",
];

const AUTH_TIMEOUT: Duration = Duration::from_secs(5);
/// The auth client keeps its own pool, separate from upstream traffic.
const AUTH_POOL_MAX_IDLE: usize = 10;

/// Factory for the `central-auth` plugin.
pub fn factory(params: &serde_json::Value) -> Result<PluginInstance, PluginError> {
    let raw_url = params
        .get("auth_service_url")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let base_url = raw_url.trim().trim_end_matches('/').to_string();

    if base_url.is_empty() {
        return Err(PluginError::InvalidConfig {
            plugin: "central-auth".to_string(),
            reason: "auth_service_url is required".to_string(),
        });
    }
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(PluginError::InvalidConfig {
            plugin: "central-auth".to_string(),
            reason: format!("auth_service_url {:?} must be http or https", raw_url),
        });
    }

    let client = reqwest::Client::builder()
        .timeout(AUTH_TIMEOUT)
        .pool_max_idle_per_host(AUTH_POOL_MAX_IDLE)
        .no_proxy()
        .build()
        .map_err(|e| PluginError::InvalidConfig {
            plugin: "central-auth".to_string(),
            reason: format!("failed to build HTTP client: {}", e),
        })?;

    Ok(PluginInstance::Auth(AuthPlugin { base_url, client }))
}

/// Upstream-authentication middleware: verifies the client's
/// `Authorization` header against the central auth service and stamps
/// the verified identity onto the forwarded request.
pub struct AuthPlugin {
    base_url: String,
    client: reqwest::Client,
}

impl AuthPlugin {
    pub async fn on_request(
        &self,
        ctx: &RequestContext,
        method: &Method,
        uri: &Uri,
        headers: &mut HeaderMap,
    ) -> PluginResult {
        let authorization = match headers.get(AUTHORIZATION) {
            Some(v) => v.clone(),
            None => {
                debug!(
                    correlation_id = %ctx.correlation_id,
                    "auth: missing Authorization header"
                );
                return PluginResult::Respond(fail_response(
                    StatusCode::UNAUTHORIZED,
                    "UNAUTHORIZED",
                    "Authorization header is required",
                ));
            }
        };

        let mut request = self
            .client
            .post(format!("{}{}", self.base_url, VERIFY_PATH))
            .header(AUTHORIZATION, authorization)
            .header("X-Original-URI", uri.to_string())
            .header("X-Original-Method", method.as_str())
            .header(CONTENT_TYPE, "application/json")
            .body("{}");

        for name in FORWARDED_HEADERS {
            if let Some(value) = headers.get(name) {
                request = request.header(name, value);
            }
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(
                    correlation_id = %ctx.correlation_id,
                    "auth: service unreachable: {}", e
                );
                return PluginResult::Respond(fail_response(
                    StatusCode::BAD_GATEWAY,
                    "AUTH_SERVICE_UNAVAILABLE",
                    &transport_message(&e),
                ));
            }
        };

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("application/json"));
        let body = response.bytes().await.unwrap_or_default();

        // 5xx from the auth service is an outage, not an auth decision.
        if status.is_server_error() {
            warn!(
                correlation_id = %ctx.correlation_id,
                status = status.as_u16(),
                "auth: service returned server error"
            );
            return PluginResult::Respond(fail_response(
                StatusCode::BAD_GATEWAY,
                "AUTH_SERVICE_UNAVAILABLE",
                "auth service returned a server error",
            ));
        }

        if status.is_success() {
            let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
            if parsed["data"]["verifyStatus"] == serde_json::Value::Bool(true) {
                if let Some(user_id) = user_id_string(&parsed["data"]["userId"]) {
                    if let Ok(value) = HeaderValue::from_str(&user_id) {
                        headers.insert("x-user-id", value);
                    }
                }
                // The upstream must never see the client's credentials.
                headers.remove(AUTHORIZATION);
                return PluginResult::Continue;
            }
            // 2xx without verifyStatus=true is a denial; the body is
            // forwarded verbatim so localized messages survive.
            return PluginResult::Respond(verbatim_response(
                StatusCode::UNAUTHORIZED,
                content_type,
                body,
            ));
        }

        // 4xx: pass the auth service's decision through, clamped.
        let forwarded_status = if (400..500).contains(&status.as_u16()) {
            status
        } else {
            StatusCode::UNAUTHORIZED
        };
        PluginResult::Respond(verbatim_response(forwarded_status, content_type, body))
    }
}

/// Stringify `data.userId`, accepting numeric and string forms.
fn user_id_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn transport_message(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        "auth service timed out (ETIMEDOUT)".to_string()
    } else if err.is_connect() {
        format!("auth service connection failed (ECONNREFUSED): {}", err)
    } else {
        format!("auth service request failed: {}", err)
    }
}

/// The auth failure envelope: `{status, error, errorDetails:[{message}]}`.
fn fail_response(
    status: StatusCode,
    error: &str,
    message: &str,
) -> hyper::Response<crate::proxy::context::BoxBody> {
    let body = serde_json::json!({
        "status": "fail",
        "error": error,
        "errorDetails": [{"message": message}],
    });
    hyper::Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(full_body(body.to_string()))
        .unwrap()
}

fn verbatim_response(
    status: StatusCode,
    content_type: HeaderValue,
    body: bytes::Bytes,
) -> hyper::Response<crate::proxy::context::BoxBody> {
    hyper::Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .body(full_body(body))
        .unwrap()
}
