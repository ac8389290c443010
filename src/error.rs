use http::StatusCode;
use std::fmt;

/// Transport error codes that count as breaker failures and retryable
/// errors. Mirrors the classification the gateway has always used.
pub const TRANSPORT_ERROR_CODES: [&str; 5] = [
    "ECONNRESET",
    "ETIMEDOUT",
    "ECONNREFUSED",
    "ENOTFOUND",
    "ECONNABORTED",
];

#[derive(Debug)]
pub enum GatewayError {
    /// Malformed request URL or headers.
    InvalidRequest(String),
    /// Request body exceeds the configured cap.
    PayloadTooLarge,
    /// Rejected by the rate limiter.
    RateLimited { retry_after_secs: u64 },
    /// No routing table has been published yet.
    NotConfigured,
    /// Every candidate was rejected and failover is exhausted.
    NoUpstreamAvailable,
    /// Transport-level failure talking to an upstream.
    Transport {
        code: &'static str,
        message: String,
    },
    /// The per-request deadline elapsed while waiting on an upstream.
    UpstreamTimeout,
    /// Upstream answered with a 5xx status.
    UpstreamStatus(u16),
    /// The circuit breaker for the upstream is open.
    CircuitOpen { upstream: String },
    Internal(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::InvalidRequest(msg) => write!(f, "invalid request: {}", msg),
            GatewayError::PayloadTooLarge => write!(f, "payload too large"),
            GatewayError::RateLimited { retry_after_secs } => {
                write!(f, "rate limited, retry after {}s", retry_after_secs)
            }
            GatewayError::NotConfigured => write!(f, "gateway not configured"),
            GatewayError::NoUpstreamAvailable => write!(f, "no upstream available"),
            GatewayError::Transport { code, message } => {
                write!(f, "upstream transport error ({}): {}", code, message)
            }
            GatewayError::UpstreamTimeout => write!(f, "upstream timeout"),
            GatewayError::UpstreamStatus(status) => {
                write!(f, "upstream returned status {}", status)
            }
            GatewayError::CircuitOpen { upstream } => {
                write!(f, "circuit breaker open for upstream {}", upstream)
            }
            GatewayError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

impl GatewayError {
    /// The HTTP status this error maps to when it reaches the client.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::NoUpstreamAvailable => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Transport { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UpstreamStatus(status) => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable short label used in error bodies and logs.
    pub fn label(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) => "Bad Request",
            GatewayError::PayloadTooLarge => "Payload Too Large",
            GatewayError::RateLimited { .. } => "Too Many Requests",
            GatewayError::NotConfigured => "Gateway not configured",
            GatewayError::NoUpstreamAvailable => "Service Unavailable",
            GatewayError::Transport { .. } => "Bad Gateway",
            GatewayError::UpstreamTimeout => "Gateway Timeout",
            GatewayError::UpstreamStatus(_) => "Bad Gateway",
            GatewayError::CircuitOpen { .. } => "Service Unavailable",
            GatewayError::Internal(_) => "Internal Server Error",
        }
    }

    /// The transport code carried by this error, if any.
    pub fn transport_code(&self) -> Option<&'static str> {
        match self {
            GatewayError::Transport { code, .. } => Some(code),
            GatewayError::UpstreamTimeout => Some("ETIMEDOUT"),
            _ => None,
        }
    }

    /// Whether the retry engine may attempt this operation again.
    ///
    /// Matches the transport code set, any error whose message contains
    /// one of those codes, an open circuit, and upstream 5xx statuses
    /// (the breaker's own failure classification).
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Transport { code, .. } => TRANSPORT_ERROR_CODES.contains(code),
            GatewayError::CircuitOpen { .. } => true,
            GatewayError::UpstreamStatus(status) => *status >= 500,
            // A deadline miss leaves no budget for another attempt.
            GatewayError::UpstreamTimeout => false,
            other => {
                let msg = other.to_string();
                TRANSPORT_ERROR_CODES.iter().any(|code| msg.contains(code))
            }
        }
    }
}

/// Best-effort mapping of a client/connector error onto the legacy
/// transport code set, by walking the source chain for `io::Error` kinds.
pub fn transport_error(err: &(dyn std::error::Error + 'static)) -> GatewayError {
    let message = err.to_string();

    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            let code = match io.kind() {
                std::io::ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
                std::io::ErrorKind::ConnectionReset => Some("ECONNRESET"),
                std::io::ErrorKind::ConnectionAborted => Some("ECONNABORTED"),
                std::io::ErrorKind::TimedOut => Some("ETIMEDOUT"),
                std::io::ErrorKind::NotFound => Some("ENOTFOUND"),
                _ => None,
            };
            if let Some(code) = code {
                return GatewayError::Transport { code, message };
            }
        }
        source = e.source();
    }

    // DNS failures don't surface as a distinct io::ErrorKind.
    let lower = message.to_ascii_lowercase();
    if lower.contains("dns") || lower.contains("lookup") || lower.contains("resolve") {
        return GatewayError::Transport {
            code: "ENOTFOUND",
            message,
        };
    }
    if lower.contains("connection refused") {
        return GatewayError::Transport {
            code: "ECONNREFUSED",
            message,
        };
    }
    if lower.contains("connection reset") || lower.contains("broken pipe") {
        return GatewayError::Transport {
            code: "ECONNRESET",
            message,
        };
    }
    if lower.contains("timed out") || lower.contains("timeout") {
        return GatewayError::Transport {
            code: "ETIMEDOUT",
            message,
        };
    }

    GatewayError::Transport {
        code: "ECONNABORTED",
        message,
    }
}
