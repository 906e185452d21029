//! Forwarding engine.
//!
//! # Data Flow
//! ```text
//! forward(request, target, additional headers)
//!     → method check → request interceptors → scheme check → admission
//!     → header/query assembly → pooled dispatch (retry on reset)
//!     → response interceptors → body.rs (timed upstream body, transforms)
//!
//! forward_ws(request, target, additional headers)
//!     → upgrade check → WS interceptors → scheme check → tunnel limits
//!     → upgrade GET → 101 to client → websocket.rs tunnel
//! ```

pub mod body;
pub mod engine;
pub mod websocket;

pub use engine::ProxyEngine;
