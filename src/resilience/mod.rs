//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Upstream attempt:
//!     → timeouts.rs (connect + response headers under the socket timeout)
//!     → on failure: retries.rs (classify, retry resets up to the bound)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every upstream exchange has a deadline
//! - Only connection resets are retried, never timeouts or refusals

pub mod retries;
pub mod timeouts;
