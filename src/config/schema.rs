//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Root configuration for the proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, connection limit).
    pub listener: ListenerConfig,

    /// Forwarding behaviour (methods, headers, timeouts, retries).
    pub proxy: ForwardConfig,

    /// Upstream connection pool sizing.
    pub pool: PoolConfig,

    /// WebSocket connection limits.
    pub websocket: WebSocketConfig,

    /// Route definitions mapping inbound paths to target URIs.
    pub routes: Vec<RouteConfig>,

    /// Declarative built-in interceptors.
    pub interceptors: Vec<InterceptorConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    pub admin: AdminConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent in-flight requests (backpressure).
    pub max_connections: usize,

    /// TCP keep-alive idle time for accepted client sockets; 0 disables.
    pub tcp_keepalive_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
            tcp_keepalive_secs: 60,
        }
    }
}

/// Forwarding configuration consumed by the proxy engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ForwardConfig {
    /// HTTP methods that may be forwarded; anything else gets 405.
    pub forward_methods: Vec<String>,

    /// Glob patterns of header names allowed across the proxy (both directions).
    pub forward_headers: Vec<String>,

    /// Verify upstream TLS certificates.
    pub reject_unauthorized: bool,

    /// Upstream socket inactivity timeout in milliseconds.
    pub socket_timeout_ms: u64,

    /// Synthesize X-Forwarded-For/Proto/Host.
    pub create_forwarded_for_headers: bool,

    /// Reject with 429 once this many requests queue for one host.
    pub max_waiting_requests_per_host: Option<usize>,

    /// Retry when the upstream resets the connection before sending headers.
    pub retry_on_reset: bool,

    /// Retries after the first attempt.
    pub max_retries: u32,

    /// Largest request body buffered to make a retry possible.
    pub retry_buffer_limit_bytes: usize,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            forward_methods: ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            forward_headers: [
                "accept",
                "accept-*",
                "range",
                "expires",
                "cache-control",
                "last-modified",
                "content-*",
                "uber-trace-id",
                "uberctx-*",
                "b3",
                "x-b3-*",
                "trace*",
                "sec-websocket-*",
            ]
            .iter()
            .map(|h| h.to_string())
            .collect(),
            reject_unauthorized: true,
            socket_timeout_ms: 60_000,
            create_forwarded_for_headers: false,
            max_waiting_requests_per_host: None,
            retry_on_reset: true,
            max_retries: 2,
            retry_buffer_limit_bytes: 1024 * 1024,
        }
    }
}

/// Upstream connection pool configuration.
///
/// Read once when a pool is first built; changing it afterwards does not
/// affect pools that already exist.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Keep sockets open between requests.
    pub keep_alive: bool,

    /// Maximum concurrent sockets per target host.
    pub max_sockets_per_host: usize,

    /// Maximum concurrent sockets across all hosts (unbounded if unset).
    pub max_total_sockets: Option<usize>,

    /// How long an idle keep-alive socket stays open, in seconds.
    pub idle_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            keep_alive: true,
            max_sockets_per_host: 10,
            max_total_sockets: None,
            idle_timeout_secs: 90,
        }
    }
}

/// WebSocket connection limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WebSocketConfig {
    pub max_connections_total: usize,

    /// Per-host limit, summed over ws:// and wss:// to the same host.
    pub max_connections_per_host: Option<usize>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_connections_total: 2000,
            max_connections_per_host: None,
        }
    }
}

/// Route configuration mapping requests to a target base URI.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Route identifier for logging.
    pub name: String,

    /// Host header to match (exact match).
    pub host: Option<String>,

    /// Path prefix to match.
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,

    /// Target base URI (http, https, ws or wss).
    pub target: String,

    /// Drop the matched prefix before appending the path to the target.
    #[serde(default = "default_strip_prefix")]
    pub strip_prefix: bool,

    /// Route priority (higher = checked first).
    #[serde(default)]
    pub priority: u32,

    /// Extra headers sent upstream on every request through this route.
    #[serde(default)]
    pub additional_headers: BTreeMap<String, String>,
}

fn default_path_prefix() -> String {
    "/".to_string()
}

fn default_strip_prefix() -> bool {
    true
}

/// A declarative interceptor registered at startup.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct InterceptorConfig {
    /// Unique name; a later entry with the same name replaces the earlier one.
    pub name: String,

    /// Position in the chain (ascending).
    pub order: i32,

    pub add_request_headers: BTreeMap<String, String>,
    pub remove_request_headers: Vec<String>,
    pub add_query_params: BTreeMap<String, String>,
    pub remove_query_params: Vec<String>,
    pub add_response_headers: BTreeMap<String, String>,
    pub remove_response_headers: Vec<String>,

    /// Requests whose path starts with one of these are answered directly.
    pub block_path_prefixes: Vec<String>,

    /// Status used for blocked requests (default 403).
    pub block_status: Option<u16>,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format ("pretty" or "json").
    pub log_format: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,

    /// How often proxy counters are published as gauges.
    pub metrics_interval_ms: u64,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
            metrics_interval_ms: 5000,
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}
