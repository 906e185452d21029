//! Header manipulation at the proxy boundary.
//!
//! # Responsibilities
//! - Allow-list filtering of header names by glob pattern (both directions)
//! - Strip hop-by-hop headers
//! - Add X-Forwarded-For, X-Forwarded-Proto, X-Forwarded-Host
//!
//! # Design Decisions
//! - An empty pattern list allows nothing (secure default)
//! - Patterns are anchored: `accept-*` matches `accept-language`, not `x-accept-foo`
//! - Existing X-Forwarded-* values are preserved and appended to

use axum::http::header::{HeaderMap, HeaderName, HeaderValue};

use crate::http::request::ClientInfo;

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// A compiled header-name glob. `*` matches any run of characters.
#[derive(Debug, Clone)]
struct HeaderPattern {
    /// Literal pieces between wildcards, lowercased.
    parts: Vec<String>,
    leading_wildcard: bool,
    trailing_wildcard: bool,
}

impl HeaderPattern {
    fn compile(pattern: &str) -> Self {
        let lower = pattern.trim().to_ascii_lowercase();
        Self {
            parts: lower
                .split('*')
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
            leading_wildcard: lower.starts_with('*'),
            trailing_wildcard: lower.ends_with('*'),
        }
    }

    fn matches(&self, name: &str) -> bool {
        let mut rest = name;

        if self.parts.is_empty() {
            // Either "" (matches only "") or only wildcards (matches anything).
            return self.leading_wildcard || rest.is_empty();
        }

        let last = self.parts.len() - 1;
        for (i, part) in self.parts.iter().enumerate() {
            if i == 0 && !self.leading_wildcard {
                match rest.strip_prefix(part.as_str()) {
                    Some(r) => rest = r,
                    None => return false,
                }
                if i == last && !self.trailing_wildcard {
                    return rest.is_empty();
                }
                continue;
            }

            if i == last && !self.trailing_wildcard {
                return rest.ends_with(part.as_str());
            }

            match rest.find(part.as_str()) {
                Some(idx) => rest = &rest[idx + part.len()..],
                None => return false,
            }
        }

        true
    }
}

/// Allow-list filter for header names.
#[derive(Debug, Clone)]
pub struct HeaderFilter {
    patterns: Vec<HeaderPattern>,
}

impl HeaderFilter {
    /// Compile a filter from glob patterns (case-insensitive).
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        Self {
            patterns: patterns
                .iter()
                .map(|p| HeaderPattern::compile(p.as_ref()))
                .collect(),
        }
    }

    /// Returns true if the header name may cross the proxy.
    pub fn matches(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        self.patterns.iter().any(|p| p.matches(&name))
    }

    /// Delete every header whose name matches none of the patterns.
    pub fn remove_unwanted_headers(&self, headers: &mut HeaderMap) {
        let unwanted: Vec<HeaderName> = headers
            .keys()
            .filter(|name| !self.matches(name.as_str()))
            .cloned()
            .collect();
        for name in unwanted {
            headers.remove(&name);
        }
    }

    /// Return a copy holding only the allowed headers.
    pub fn filter(&self, headers: &HeaderMap) -> HeaderMap {
        let mut filtered = HeaderMap::with_capacity(headers.len());
        for (name, value) in headers.iter() {
            if self.matches(name.as_str()) {
                filtered.append(name.clone(), value.clone());
            }
        }
        filtered
    }
}

/// Check if a header is a hop-by-hop header that should not be forwarded
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Remove hop-by-hop headers, including any named in `Connection`.
pub fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all("connection")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect();

    let names: Vec<HeaderName> = headers
        .keys()
        .filter(|name| {
            is_hop_by_hop_header(name.as_str()) || listed.iter().any(|l| l == name.as_str())
        })
        .cloned()
        .collect();
    for name in names {
        headers.remove(&name);
    }
}

/// Append the client's address, protocol and host to the X-Forwarded-* headers.
///
/// `original` holds the headers the client sent; any X-Forwarded-* values in
/// it are kept and the new hop is appended.
pub fn append_forwarded_headers(headers: &mut HeaderMap, original: &HeaderMap, client: &ClientInfo) {
    if let Some(ip) = client.remote_addr {
        append_forwarded(headers, original, X_FORWARDED_FOR, &ip.to_string());
    }
    append_forwarded(headers, original, X_FORWARDED_PROTO, &client.proto);
    if let Some(host) = &client.host {
        append_forwarded(headers, original, X_FORWARDED_HOST, host);
    }
}

fn append_forwarded(headers: &mut HeaderMap, original: &HeaderMap, name: &'static str, value: &str) {
    let existing: Vec<&str> = original
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .collect();

    let combined = if existing.is_empty() {
        value.to_string()
    } else {
        format!("{}, {}", existing.join(", "), value)
    };

    match HeaderValue::from_str(&combined) {
        Ok(v) => {
            headers.insert(HeaderName::from_static(name), v);
        }
        Err(e) => {
            tracing::warn!(header = name, error = %e, "Dropping unrepresentable forwarded header");
        }
    }
}
