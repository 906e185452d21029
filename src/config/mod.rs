//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; pools read it once when first built
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::AdminConfig;
pub use schema::ForwardConfig;
pub use schema::InterceptorConfig;
pub use schema::ListenerConfig;
pub use schema::ObservabilityConfig;
pub use schema::PoolConfig;
pub use schema::ProxyConfig;
pub use schema::RouteConfig;
pub use schema::WebSocketConfig;
