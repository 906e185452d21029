//! Socket timeout enforcement.
//!
//! # Design Decisions
//! - One inactivity timeout per request (`socket_timeout_ms`)
//! - It starts once a pool slot is held and bounds connect plus response
//!   headers as one deadline, then each gap between body chunks separately
//! - Expiry drops the upstream future, which closes its socket

use std::future::Future;
use std::time::Duration;

use crate::error::{ProxyError, Result};

/// Run `fut` under the socket timeout; expiry becomes `UpstreamTimeout`.
pub async fn with_socket_timeout<F, T>(timeout: Duration, target: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::UpstreamTimeout(format!(
            "no response from {target} within {}ms",
            timeout.as_millis()
        ))),
    }
}
