//! Inbound request helpers.
//!
//! # Responsibilities
//! - Generate and propagate a request ID (UUID v4) via tower-http layers
//! - Extract client connection info (peer address, protocol, host)
//! - Detect upgrade requests
//!
//! # Design Decisions
//! - Request ID added as early as possible for tracing
//! - Client info read from the request, never from shared state

use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::header::{HeaderMap, HeaderName, HOST, UPGRADE};
use axum::http::request::Parts;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};

pub const X_REQUEST_ID: &str = "x-request-id";

/// Layer that assigns a UUID request ID to requests that lack one.
pub fn set_request_id_layer() -> SetRequestIdLayer<MakeRequestUuid> {
    SetRequestIdLayer::new(HeaderName::from_static(X_REQUEST_ID), MakeRequestUuid)
}

/// Layer that copies the request ID onto the response.
pub fn propagate_request_id_layer() -> PropagateRequestIdLayer {
    PropagateRequestIdLayer::new(HeaderName::from_static(X_REQUEST_ID))
}

/// Read the request ID header, if set.
pub fn request_id(headers: &HeaderMap) -> &str {
    headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
}

/// What the proxy knows about the client side of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub remote_addr: Option<IpAddr>,
    /// "http" or "https" as seen by the client.
    pub proto: String,
    /// Host the client addressed.
    pub host: Option<String>,
}

impl ClientInfo {
    pub fn from_parts(parts: &Parts) -> Self {
        let remote_addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());

        let proto = match parts.uri.scheme_str() {
            Some("https") | Some("wss") => "https",
            _ => "http",
        }
        .to_string();

        let host = parts
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| parts.uri.authority().map(|a| a.to_string()));

        Self {
            remote_addr,
            proto,
            host,
        }
    }
}

/// The `Upgrade` header value, lowercased, if the request asks for one.
pub fn upgrade_protocol(headers: &HeaderMap) -> Option<String> {
    headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    #[test]
    fn client_info_from_parts() {
        let mut req = Request::builder()
            .uri("/foo")
            .header("host", "portal.local:8080")
            .body(())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));
        let (parts, _) = req.into_parts();

        let info = ClientInfo::from_parts(&parts);
        assert_eq!(info.remote_addr, Some(IpAddr::from([127, 0, 0, 1])));
        assert_eq!(info.proto, "http");
        assert_eq!(info.host.as_deref(), Some("portal.local:8080"));
    }

    #[test]
    fn detects_upgrade_protocol() {
        let mut headers = HeaderMap::new();
        assert_eq!(upgrade_protocol(&headers), None);

        headers.insert(UPGRADE, "WebSocket".parse().unwrap());
        assert_eq!(upgrade_protocol(&headers).as_deref(), Some("websocket"));
    }
}
