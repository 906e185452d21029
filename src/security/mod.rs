//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Outbound request headers:
//!     → headers.rs (allow-list filter, strip hop-by-hop, add X-Forwarded-*)
//!     → Upstream
//! ```

pub mod headers;

pub use headers::HeaderFilter;
