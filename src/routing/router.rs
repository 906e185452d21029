//! Route lookup and target resolution.
//!
//! # Responsibilities
//! - Store compiled routes
//! - Look up matching route for request
//! - Compute the upstream target URI for a matched route
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - O(n) scan in priority order (acceptable for typical route counts)
//! - Explicit no-match rather than silent default

use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use axum::http::request::Parts;
use url::Url;

use crate::config::RouteConfig;
use crate::error::{ProxyError, Result};
use crate::routing::matcher::{AndMatcher, HostMatcher, Matcher, PathPrefixMatcher};

/// A route ready for matching.
#[derive(Debug)]
pub struct CompiledRoute {
    pub name: String,
    pub priority: u32,
    matcher: AndMatcher,
    prefix: String,
    strip_prefix: bool,
    target: Url,
    additional_headers: HeaderMap,
}

impl CompiledRoute {
    fn compile(config: &RouteConfig) -> Result<Self> {
        let target = Url::parse(&config.target).map_err(|e| {
            ProxyError::Config(format!("route {}: invalid target {}: {e}", config.name, config.target))
        })?;

        let mut matchers: Vec<Box<dyn Matcher>> = Vec::new();
        if let Some(host) = &config.host {
            matchers.push(Box::new(HostMatcher::new(host.clone())));
        }
        matchers.push(Box::new(PathPrefixMatcher::new(config.path_prefix.clone())));

        let mut additional_headers = HeaderMap::new();
        for (name, value) in &config.additional_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ProxyError::Config(format!("route {}: header {name}: {e}", config.name)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ProxyError::Config(format!("route {}: header {name}: {e}", config.name)))?;
            additional_headers.insert(name, value);
        }

        Ok(Self {
            name: config.name.clone(),
            priority: config.priority,
            matcher: AndMatcher::new(matchers),
            prefix: config.path_prefix.clone(),
            strip_prefix: config.strip_prefix,
            target,
            additional_headers,
        })
    }

    /// Headers the caller adds on top of the client's.
    pub fn additional_headers(&self) -> Option<&HeaderMap> {
        (!self.additional_headers.is_empty()).then_some(&self.additional_headers)
    }

    /// Upstream URI for a request path. Upgrades get a `ws`/`wss` scheme,
    /// plain requests an `http`/`https` one. The client query is not included.
    pub fn target_uri(&self, path: &str, websocket: bool) -> Url {
        let mut url = self.target.clone();

        let remaining = if self.strip_prefix {
            path.strip_prefix(self.prefix.trim_end_matches('/')).unwrap_or(path)
        } else {
            path
        };
        let remaining = remaining.trim_start_matches('/');
        if !remaining.is_empty() {
            let joined = format!("{}/{}", url.path().trim_end_matches('/'), remaining);
            url.set_path(&joined);
        }

        let scheme = match (url.scheme(), websocket) {
            ("http", true) => Some("ws"),
            ("https", true) => Some("wss"),
            ("ws", false) => Some("http"),
            ("wss", false) => Some("https"),
            _ => None,
        };
        if let Some(scheme) = scheme {
            // Switching between special schemes cannot fail.
            let _ = url.set_scheme(scheme);
        }
        url
    }
}

/// Compiled routing table.
#[derive(Debug, Default)]
pub struct Router {
    routes: Vec<CompiledRoute>,
}

impl Router {
    /// Compile routes; higher priority first, config order breaks ties.
    pub fn from_config(routes: &[RouteConfig]) -> Result<Self> {
        let mut compiled = routes
            .iter()
            .map(CompiledRoute::compile)
            .collect::<Result<Vec<_>>>()?;
        compiled.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(Self { routes: compiled })
    }

    /// First route matching the request.
    pub fn match_request(&self, req: &Parts) -> Option<&CompiledRoute> {
        self.routes.iter().find(|r| r.matcher.matches(req))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
