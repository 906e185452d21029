//! Retry policy for upstream resets.
//!
//! # Responsibilities
//! - Classify upstream client errors (reset, refused, timeout, other)
//! - Decide whether another attempt is allowed
//!
//! # Design Decisions
//! - Only resets before response headers are retried; the request never
//!   reached the application or the socket was a stale keep-alive one
//! - Retries are immediate: a reset usually means a dead pooled socket,
//!   and the next attempt gets a fresh one
//! - A body can be replayed only if it was buffered

use std::error::Error as StdError;
use std::io;

use crate::config::ForwardConfig;
use crate::error::ProxyError;

/// How many times a reset request is re-issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &ForwardConfig) -> Self {
        Self {
            enabled: config.retry_on_reset,
            max_retries: config.max_retries,
        }
    }

    /// Policy for a request whose body cannot be replayed.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_retries: 0,
        }
    }

    /// Total attempts allowed, first one included.
    pub fn max_attempts(&self) -> u32 {
        if self.enabled {
            self.max_retries + 1
        } else {
            1
        }
    }

    /// Whether `attempt` (1-based) failing with `err` may be retried.
    pub fn should_retry(&self, err: &ProxyError, attempt: u32) -> bool {
        err.is_retryable() && attempt < self.max_attempts()
    }
}

/// Map an upstream client error to the engine taxonomy.
pub fn classify_upstream_error(err: &(dyn StdError + 'static)) -> ProxyError {
    let message = error_chain(err);
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);

    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            match io_err.kind() {
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof => {
                    return ProxyError::UpstreamConnectionReset(message)
                }
                io::ErrorKind::ConnectionRefused => {
                    return ProxyError::UpstreamConnectionFailure {
                        message,
                        refused: true,
                    }
                }
                io::ErrorKind::TimedOut => return ProxyError::UpstreamTimeout(message),
                _ => {}
            }
        }
        if let Some(hyper_err) = e.downcast_ref::<hyper::Error>() {
            if hyper_err.is_incomplete_message() || hyper_err.is_closed() {
                return ProxyError::UpstreamConnectionReset(message);
            }
            if hyper_err.is_timeout() {
                return ProxyError::UpstreamTimeout(message);
            }
        }
        current = e.source();
    }

    ProxyError::UpstreamConnectionFailure {
        message,
        refused: false,
    }
}

/// Render an error with its sources, outermost first.
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(e) = source {
        let text = e.to_string();
        if !out.contains(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        source = e.source();
    }
    out
}
