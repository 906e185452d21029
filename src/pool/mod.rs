//! Upstream connection pooling.
//!
//! # Data Flow
//! ```text
//! ProxyEngine
//!     → manager.rs (pool for the target scheme, built on first use)
//!     → agent.rs (checkout a per-host slot, then issue the request)
//!     → tls.rs (client TLS settings for the https pool)
//! ```
//!
//! # Design Decisions
//! - One manager per process, passed to the engine explicitly
//! - Queue length per host is observable for admission control

pub mod agent;
pub mod manager;
pub mod tls;

pub use agent::{AgentMetrics, PoolLease, PooledAgent, SocketCounts};
pub use manager::{ConnectionPoolManager, PoolMetrics};
