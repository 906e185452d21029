//! Response helpers.
//!
//! # Responsibilities
//! - Build the plain-text responses written for mapped errors
//! - Map engine errors to status codes
//!
//! # Design Decisions
//! - Error bodies carry the canonical reason phrase only; upstream error
//!   detail stays in the logs

use axum::body::Body;
use axum::http::{header, HeaderValue, Response, StatusCode};

use crate::error::ProxyError;

/// Create a plain-text response with the given status.
pub fn status_response(status: StatusCode, message: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(message.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Create the response written to the client for an engine error.
pub fn error_response(err: &ProxyError) -> Response<Body> {
    let status = err.status_code();
    status_response(status, status.canonical_reason().unwrap_or("Proxy Error"))
}
