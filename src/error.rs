//! Error taxonomy for the forwarding engine.
//!
//! Every upstream or network failure is converted into one of these variants
//! at the engine boundary and then into a status code. Nothing network-related
//! escapes to the caller as an `Err`.

use axum::http::StatusCode;
use thiserror::Error;

/// Which admission limit rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionLimit {
    /// Too many requests already queued on the pool for the target host.
    WaitingRequests,
    /// Global WebSocket connection limit reached.
    WsConnectionsTotal,
    /// Per-host WebSocket connection limit reached.
    WsConnectionsPerHost,
}

impl std::fmt::Display for AdmissionLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmissionLimit::WaitingRequests => write!(f, "max waiting requests per host"),
            AdmissionLimit::WsConnectionsTotal => write!(f, "max WebSocket connections total"),
            AdmissionLimit::WsConnectionsPerHost => write!(f, "max WebSocket connections per host"),
        }
    }
}

/// Unified error type for proxy operations.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Target scheme not supported for this kind of forward.
    #[error("Unsupported protocol: {protocol}")]
    ProtocolUnsupported { protocol: String, websocket: bool },

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Unsupported upgrade: {0}")]
    UpgradeUnsupported(String),

    #[error("Admission rejected for {host}: {limit}")]
    AdmissionRejected { host: String, limit: AdmissionLimit },

    #[error("Upstream timed out: {0}")]
    UpstreamTimeout(String),

    /// Connection reset before response headers arrived; retryable.
    #[error("Upstream connection reset: {0}")]
    UpstreamConnectionReset(String),

    #[error("Upstream connection failed: {message}")]
    UpstreamConnectionFailure { message: String, refused: bool },

    /// The client went away; nothing can be written back.
    #[error("Client aborted: {0}")]
    ClientAbort(String),

    #[error("Interceptor {name} failed: {message}")]
    InterceptorFailure { name: String, message: String },

    #[error("Invalid target URI: {0}")]
    InvalidTarget(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// Get the HTTP status code written to the client for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::ProtocolUnsupported { websocket: true, .. } => StatusCode::BAD_REQUEST,
            ProxyError::ProtocolUnsupported { websocket: false, .. } => StatusCode::BAD_GATEWAY,
            ProxyError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            ProxyError::UpgradeUnsupported(_) => StatusCode::NOT_ACCEPTABLE,
            ProxyError::AdmissionRejected { .. } => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamConnectionFailure { refused: true, .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::UpstreamConnectionReset(_)
            | ProxyError::UpstreamConnectionFailure { refused: false, .. }
            | ProxyError::InvalidTarget(_) => StatusCode::BAD_GATEWAY,
            // Never delivered, the client is gone.
            ProxyError::ClientAbort(_) => StatusCode::BAD_REQUEST,
            ProxyError::InterceptorFailure { .. }
            | ProxyError::Config(_)
            | ProxyError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a retry on a fresh connection may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProxyError::UpstreamConnectionReset(_))
    }

    /// Whether this outcome increments the connection-error metric.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ProxyError::UpstreamConnectionReset(_) | ProxyError::UpstreamConnectionFailure { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ProxyError::UpstreamTimeout(_))
    }

    /// A reset that survived all retries becomes a generic connection failure.
    pub fn into_exhausted(self) -> Self {
        match self {
            ProxyError::UpstreamConnectionReset(message) => ProxyError::UpstreamConnectionFailure {
                message,
                refused: false,
            },
            other => other,
        }
    }
}
