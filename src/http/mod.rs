//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, middleware, route lookup)
//!     → request.rs (request ID, client info, upgrade detection)
//!     → proxy engine (forward / forward_ws)
//!     → response.rs (status responses for mapped errors)
//!     → Send to client
//! ```

pub mod request;
pub mod response;
pub mod server;

pub use request::{ClientInfo, X_REQUEST_ID};
pub use server::{AppState, HttpServer};
