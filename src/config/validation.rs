//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check that route targets parse and use a supported scheme
//! - Validate value ranges (pool sizes > 0, timeouts > 0)
//! - Detect duplicate interceptor names
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;

use axum::http::Method;
use url::Url;

use crate::config::schema::ProxyConfig;

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a configuration, collecting every problem.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be > 0"));
    }

    if config.proxy.forward_methods.is_empty() {
        errors.push(ValidationError::new("proxy.forward_methods", "must not be empty"));
    }
    for (i, method) in config.proxy.forward_methods.iter().enumerate() {
        if Method::from_bytes(method.to_ascii_uppercase().as_bytes()).is_err() {
            errors.push(ValidationError::new(
                format!("proxy.forward_methods[{}]", i),
                format!("invalid method '{}'", method),
            ));
        }
    }
    if config.proxy.socket_timeout_ms == 0 {
        errors.push(ValidationError::new("proxy.socket_timeout_ms", "must be > 0"));
    }

    if config.pool.max_sockets_per_host == 0 {
        errors.push(ValidationError::new("pool.max_sockets_per_host", "must be > 0"));
    }
    if config.pool.max_total_sockets == Some(0) {
        errors.push(ValidationError::new("pool.max_total_sockets", "must be > 0 when set"));
    }

    for (i, route) in config.routes.iter().enumerate() {
        let field = format!("routes[{}]", i);
        if !route.path_prefix.starts_with('/') {
            errors.push(ValidationError::new(
                format!("{}.path_prefix", field),
                "must start with '/'",
            ));
        }
        match Url::parse(&route.target) {
            Ok(url) => {
                if !matches!(url.scheme(), "http" | "https" | "ws" | "wss") {
                    errors.push(ValidationError::new(
                        format!("{}.target", field),
                        format!("unsupported scheme '{}'", url.scheme()),
                    ));
                }
            }
            Err(e) => {
                errors.push(ValidationError::new(
                    format!("{}.target", field),
                    format!("invalid URI '{}': {}", route.target, e),
                ));
            }
        }
    }

    let mut names = HashSet::new();
    for (i, interceptor) in config.interceptors.iter().enumerate() {
        let field = format!("interceptors[{}]", i);
        if interceptor.name.trim().is_empty() {
            errors.push(ValidationError::new(format!("{}.name", field), "must not be empty"));
        } else if !names.insert(interceptor.name.as_str()) {
            errors.push(ValidationError::new(
                format!("{}.name", field),
                format!("duplicate interceptor name '{}'", interceptor.name),
            ));
        }
        if let Some(status) = interceptor.block_status {
            if !(100..=599).contains(&status) {
                errors.push(ValidationError::new(
                    format!("{}.block_status", field),
                    format!("invalid status {}", status),
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
