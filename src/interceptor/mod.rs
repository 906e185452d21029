//! Interceptor plugin subsystem.
//!
//! # Data Flow
//! ```text
//! plugin (Rust type or [[interceptors]] config entry)
//!     → registry.rs (register by name, ordered snapshot)
//!     → chain.rs (fold request / WS request / response deltas)
//!     → RequestContext / WsRequestContext / ResponseContext
//!     → proxy engine applies the accumulated result once
//! ```
//!
//! # Design Decisions
//! - An interceptor exposes zero or more capabilities; absent ones are skipped
//! - Each call returns a delta; the chain merges deltas into a typed accumulator
//! - Returning `Interception::Handled` stops the chain; the engine sends that response
//! - A failing interceptor is logged and skipped, the chain goes on

pub mod builtin;
pub mod chain;
pub mod registry;
pub mod transform;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{request, response, HeaderMap, Response, StatusCode};
use url::Url;

use crate::http::request::ClientInfo;

pub use builtin::StaticHeadersInterceptor;
pub use chain::{ChainOutcome, InterceptorChain, RequestContext, ResponseContext, WsRequestContext};
pub use registry::{InterceptorHolder, InterceptorRegistry};
pub use transform::BodyTransform;

/// Ordered query parameters as (name, value) pairs.
pub type QueryParams = Vec<(String, String)>;

/// Error returned by an interceptor. Logged, never propagated.
pub type InterceptorError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a single interceptor invocation.
pub enum Interception<D> {
    /// Merge this delta and continue with the next interceptor.
    Continue(D),
    /// The interceptor produced the client response; stop and send it.
    Handled(Response<Body>),
}

impl<D: Default> Interception<D> {
    /// Continue without changes.
    pub fn unchanged() -> Self {
        Interception::Continue(D::default())
    }
}

/// What a request interceptor sees.
pub struct HttpRequestView<'a> {
    /// Target URI after rewrites by earlier interceptors.
    pub target_uri: &'a Url,
    /// Client headers merged with the caller's additional headers.
    pub headers: &'a HeaderMap,
    /// Query parameters of the client request.
    pub query_params: &'a [(String, String)],
    pub client_request: &'a request::Parts,
    pub client: &'a ClientInfo,
}

/// What a WebSocket upgrade interceptor sees.
pub struct WsRequestView<'a> {
    pub target_uri: &'a Url,
    pub headers: &'a HeaderMap,
    pub client_request: &'a request::Parts,
    pub client: &'a ClientInfo,
}

/// What a response interceptor sees.
pub struct HttpResponseView<'a> {
    pub target_uri: &'a Url,
    /// Upstream response headers.
    pub headers: &'a HeaderMap,
    pub status: StatusCode,
    pub client_request: &'a request::Parts,
    pub target_response: &'a response::Parts,
}

/// Changes requested by one request interceptor.
#[derive(Default)]
pub struct RequestDelta {
    /// Headers to set. Entries with an empty value are dropped.
    pub add_headers: Vec<(String, String)>,
    pub remove_headers: Vec<String>,
    pub add_query_params: QueryParams,
    pub remove_query_params: Vec<String>,
    pub rewritten_target_uri: Option<Url>,
    /// Stages applied to the request body, in order.
    pub stream_transformers: Vec<Box<dyn BodyTransform>>,
}

impl RequestDelta {
    pub fn add_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_headers.push((name.into(), value.into()));
        self
    }

    pub fn remove_header(mut self, name: impl Into<String>) -> Self {
        self.remove_headers.push(name.into());
        self
    }

    pub fn add_query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_query_params.push((name.into(), value.into()));
        self
    }

    pub fn remove_query_param(mut self, name: impl Into<String>) -> Self {
        self.remove_query_params.push(name.into());
        self
    }

    pub fn rewrite_target(mut self, target: Url) -> Self {
        self.rewritten_target_uri = Some(target);
        self
    }

    pub fn transform(mut self, stage: impl BodyTransform + 'static) -> Self {
        self.stream_transformers.push(Box::new(stage));
        self
    }
}

/// Changes requested by one WebSocket upgrade interceptor.
#[derive(Debug, Default)]
pub struct WsRequestDelta {
    pub add_headers: Vec<(String, String)>,
    pub remove_headers: Vec<String>,
    pub rewritten_target_uri: Option<Url>,
}

impl WsRequestDelta {
    pub fn add_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_headers.push((name.into(), value.into()));
        self
    }

    pub fn remove_header(mut self, name: impl Into<String>) -> Self {
        self.remove_headers.push(name.into());
        self
    }

    pub fn rewrite_target(mut self, target: Url) -> Self {
        self.rewritten_target_uri = Some(target);
        self
    }
}

/// Changes requested by one response interceptor.
#[derive(Default)]
pub struct ResponseDelta {
    pub add_headers: Vec<(String, String)>,
    pub remove_headers: Vec<String>,
    /// Stages applied to the response body, in order.
    pub stream_transformers: Vec<Box<dyn BodyTransform>>,
}

impl ResponseDelta {
    pub fn add_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_headers.push((name.into(), value.into()));
        self
    }

    pub fn remove_header(mut self, name: impl Into<String>) -> Self {
        self.remove_headers.push(name.into());
        self
    }

    pub fn transform(mut self, stage: impl BodyTransform + 'static) -> Self {
        self.stream_transformers.push(Box::new(stage));
        self
    }
}

#[async_trait]
pub trait RequestInterceptor: Send + Sync {
    async fn intercept_request(
        &self,
        request: &HttpRequestView<'_>,
    ) -> Result<Interception<RequestDelta>, InterceptorError>;
}

#[async_trait]
pub trait WsRequestInterceptor: Send + Sync {
    async fn intercept_ws_request(
        &self,
        request: &WsRequestView<'_>,
    ) -> Result<Interception<WsRequestDelta>, InterceptorError>;
}

#[async_trait]
pub trait ResponseInterceptor: Send + Sync {
    async fn intercept_response(
        &self,
        response: &HttpResponseView<'_>,
    ) -> Result<Interception<ResponseDelta>, InterceptorError>;
}

/// A pluggable unit with optional capabilities.
///
/// Implementors override the accessors for the hooks they support:
///
/// ```ignore
/// impl Interceptor for AuditTrail {
///     fn on_request(&self) -> Option<&dyn RequestInterceptor> {
///         Some(self)
///     }
/// }
/// ```
pub trait Interceptor: Send + Sync {
    fn on_request(&self) -> Option<&dyn RequestInterceptor> {
        None
    }

    fn on_ws_request(&self) -> Option<&dyn WsRequestInterceptor> {
        None
    }

    fn on_response(&self) -> Option<&dyn ResponseInterceptor> {
        None
    }
}
