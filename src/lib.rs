//! HTTP and WebSocket reverse proxy engine.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ─────────────▶ http::server ─▶ routing::Router ─▶ proxy::ProxyEngine
//!                                                          │
//!                                     interceptor::chain ◀─┤
//!                                                          ▼
//!                                                  pool::ConnectionPoolManager
//!                                                          │
//!     Client Response                                      ▼
//!     ◀───────────── response interceptors ◀──────── upstream server
//!
//!     Cross-cutting: config, observability, resilience, security, lifecycle
//! ```
//!
//! Plain requests are forwarded with optional retry on connection reset.
//! WebSocket upgrades are handshaken upstream and then tunnelled byte for
//! byte in both directions.

pub mod admin;
pub mod config;
pub mod error;
pub mod http;
pub mod interceptor;
pub mod lifecycle;
pub mod observability;
pub mod pool;
pub mod proxy;
pub mod resilience;
pub mod routing;
pub mod security;

pub use config::ProxyConfig;
pub use error::ProxyError;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use proxy::ProxyEngine;
