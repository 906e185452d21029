//! Sequential application of interceptors.
//!
//! Each entry point folds the registry snapshot in order. Deltas are merged
//! into an explicitly typed accumulator that is owned by one request; a
//! `Handled` result stops the fold.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::body::Body;
use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use axum::http::{request, response, Response};
use futures_util::FutureExt;
use url::Url;

use crate::http::request::ClientInfo;
use crate::interceptor::{
    BodyTransform, HttpRequestView, HttpResponseView, Interception, InterceptorError,
    InterceptorRegistry, QueryParams, RequestDelta, ResponseDelta, WsRequestDelta, WsRequestView,
};

/// Outcome of running a chain.
pub enum ChainOutcome<C> {
    /// Forward using the accumulated context.
    Forward(C),
    /// An interceptor produced the response; do not forward.
    Handled(Response<Body>),
}

/// Header additions and removals accumulated across interceptors.
#[derive(Debug, Default, Clone)]
pub struct HeaderChanges {
    /// Last write wins per name.
    pub add: HeaderMap,
    pub remove: Vec<HeaderName>,
}

impl HeaderChanges {
    fn merge(&mut self, interceptor: &str, add: Vec<(String, String)>, remove: Vec<String>) {
        for (name, value) in add {
            if value.is_empty() {
                tracing::warn!(
                    interceptor = %interceptor,
                    header = %name,
                    "Interceptor added header without value, ignoring"
                );
                continue;
            }
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(name), Ok(value)) => {
                    self.add.insert(name, value);
                }
                _ => {
                    tracing::warn!(
                        interceptor = %interceptor,
                        header = %name,
                        "Interceptor added invalid header, ignoring"
                    );
                }
            }
        }
        for name in remove {
            match HeaderName::from_bytes(name.as_bytes()) {
                Ok(name) => self.remove.push(name),
                Err(_) => {
                    tracing::warn!(
                        interceptor = %interceptor,
                        header = %name,
                        "Interceptor removed invalid header name, ignoring"
                    );
                }
            }
        }
    }

    /// Apply to an outbound header map: additions first, then removals.
    pub fn apply(&self, headers: &mut HeaderMap) {
        for (name, value) in self.add.iter() {
            headers.insert(name.clone(), value.clone());
        }
        for name in &self.remove {
            headers.remove(name);
        }
    }
}

/// Accumulated result of the request chain.
#[derive(Default)]
pub struct RequestContext {
    pub headers: HeaderChanges,
    /// Last write wins per name.
    pub add_query_params: QueryParams,
    pub remove_query_params: Vec<String>,
    /// The target as rewritten by the chain.
    pub target_uri: Option<Url>,
    pub stream_transformers: Vec<Box<dyn BodyTransform>>,
}

impl RequestContext {
    fn merge(mut self, interceptor: &str, delta: RequestDelta) -> Self {
        self.headers
            .merge(interceptor, delta.add_headers, delta.remove_headers);
        for (name, value) in delta.add_query_params {
            set_query_param(&mut self.add_query_params, name, value);
        }
        self.remove_query_params.extend(delta.remove_query_params);
        if let Some(target) = delta.rewritten_target_uri {
            self.target_uri = Some(target);
        }
        self.stream_transformers.extend(delta.stream_transformers);
        self
    }

    /// Merge the client query with the accumulated additions and removals.
    pub fn apply_query(&self, existing: &[(String, String)]) -> QueryParams {
        let mut params: QueryParams = existing.to_vec();
        for (name, value) in &self.add_query_params {
            set_query_param(&mut params, name.clone(), value.clone());
        }
        params.retain(|(name, _)| !self.remove_query_params.contains(name));
        params
    }
}

/// Replace every value of `name` with `value`, keeping the first position.
fn set_query_param(params: &mut QueryParams, name: String, value: String) {
    match params.iter().position(|(n, _)| *n == name) {
        Some(idx) => {
            params[idx].1 = value;
            let mut i = 0;
            params.retain(|(n, _)| {
                let keep = *n != name || i == idx;
                i += 1;
                keep
            });
        }
        None => params.push((name, value)),
    }
}

/// Accumulated result of the WebSocket upgrade chain.
#[derive(Debug, Default)]
pub struct WsRequestContext {
    pub headers: HeaderChanges,
    pub target_uri: Option<Url>,
}

impl WsRequestContext {
    fn merge(mut self, interceptor: &str, delta: WsRequestDelta) -> Self {
        self.headers
            .merge(interceptor, delta.add_headers, delta.remove_headers);
        if let Some(target) = delta.rewritten_target_uri {
            self.target_uri = Some(target);
        }
        self
    }
}

/// Accumulated result of the response chain.
#[derive(Default)]
pub struct ResponseContext {
    pub headers: HeaderChanges,
    pub stream_transformers: Vec<Box<dyn BodyTransform>>,
}

impl ResponseContext {
    fn merge(mut self, interceptor: &str, delta: ResponseDelta) -> Self {
        self.headers
            .merge(interceptor, delta.add_headers, delta.remove_headers);
        self.stream_transformers.extend(delta.stream_transformers);
        self
    }
}

/// Runs the registered interceptors for one request.
#[derive(Clone)]
pub struct InterceptorChain {
    registry: Arc<InterceptorRegistry>,
}

impl InterceptorChain {
    pub fn new(registry: Arc<InterceptorRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<InterceptorRegistry> {
        &self.registry
    }

    /// Fold the request interceptors over a client request.
    pub async fn process_http_request(
        &self,
        client_request: &request::Parts,
        client: &ClientInfo,
        target_uri: &Url,
        existing_headers: &HeaderMap,
        existing_query: &[(String, String)],
    ) -> ChainOutcome<RequestContext> {
        let mut ctx = RequestContext::default();

        for holder in self.registry.interceptors().iter() {
            let Some(hook) = holder.interceptor.on_request() else {
                continue;
            };

            let result = {
                let view = HttpRequestView {
                    target_uri: ctx.target_uri.as_ref().unwrap_or(target_uri),
                    headers: existing_headers,
                    query_params: existing_query,
                    client_request,
                    client,
                };
                isolate(AssertUnwindSafe(hook.intercept_request(&view))).await
            };

            match result {
                Ok(Interception::Handled(response)) => {
                    tracing::debug!(interceptor = %holder.name, "Request handled by interceptor");
                    return ChainOutcome::Handled(response);
                }
                Ok(Interception::Continue(delta)) => ctx = ctx.merge(&holder.name, delta),
                Err(e) => {
                    tracing::error!(interceptor = %holder.name, error = %e, "Request interceptor failed");
                }
            }
        }

        ChainOutcome::Forward(ctx)
    }

    /// Fold the WebSocket upgrade interceptors over a handshake request.
    pub async fn process_ws_request(
        &self,
        client_request: &request::Parts,
        client: &ClientInfo,
        target_uri: &Url,
        existing_headers: &HeaderMap,
    ) -> ChainOutcome<WsRequestContext> {
        let mut ctx = WsRequestContext::default();

        for holder in self.registry.interceptors().iter() {
            let Some(hook) = holder.interceptor.on_ws_request() else {
                continue;
            };

            let result = {
                let view = WsRequestView {
                    target_uri: ctx.target_uri.as_ref().unwrap_or(target_uri),
                    headers: existing_headers,
                    client_request,
                    client,
                };
                isolate(AssertUnwindSafe(hook.intercept_ws_request(&view))).await
            };

            match result {
                Ok(Interception::Handled(response)) => {
                    tracing::debug!(interceptor = %holder.name, "WebSocket request handled by interceptor");
                    return ChainOutcome::Handled(response);
                }
                Ok(Interception::Continue(delta)) => ctx = ctx.merge(&holder.name, delta),
                Err(e) => {
                    tracing::error!(interceptor = %holder.name, error = %e, "WebSocket interceptor failed");
                }
            }
        }

        ChainOutcome::Forward(ctx)
    }

    /// Fold the response interceptors over an upstream response head.
    pub async fn process_http_response(
        &self,
        client_request: &request::Parts,
        target_uri: &Url,
        target_response: &response::Parts,
    ) -> ChainOutcome<ResponseContext> {
        let mut ctx = ResponseContext::default();

        for holder in self.registry.interceptors().iter() {
            let Some(hook) = holder.interceptor.on_response() else {
                continue;
            };

            let result = {
                let view = HttpResponseView {
                    target_uri,
                    headers: &target_response.headers,
                    status: target_response.status,
                    client_request,
                    target_response,
                };
                isolate(AssertUnwindSafe(hook.intercept_response(&view))).await
            };

            match result {
                Ok(Interception::Handled(response)) => {
                    tracing::debug!(interceptor = %holder.name, "Response handled by interceptor");
                    return ChainOutcome::Handled(response);
                }
                Ok(Interception::Continue(delta)) => ctx = ctx.merge(&holder.name, delta),
                Err(e) => {
                    tracing::error!(interceptor = %holder.name, error = %e, "Response interceptor failed");
                }
            }
        }

        ChainOutcome::Forward(ctx)
    }
}

/// Await an interceptor call, turning a panic into an error.
async fn isolate<F, T>(call: AssertUnwindSafe<F>) -> Result<T, InterceptorError>
where
    F: std::future::Future<Output = Result<T, InterceptorError>>,
{
    match call.catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "interceptor panicked".to_string());
            Err(message.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::response::status_response;
    use crate::interceptor::{Interceptor, RequestInterceptor};
    use async_trait::async_trait;
    use axum::http::{Request, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Behaviour {
        Delta(fn() -> RequestDelta),
        Handle,
        Fail,
        Panic,
    }

    struct Scripted {
        calls: Arc<AtomicUsize>,
        seen_targets: Arc<std::sync::Mutex<Vec<String>>>,
        behaviour: Behaviour,
    }

    impl Scripted {
        fn new(behaviour: Behaviour) -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                seen_targets: Arc::new(std::sync::Mutex::new(Vec::new())),
                behaviour,
            }
        }
    }

    impl Interceptor for Scripted {
        fn on_request(&self) -> Option<&dyn RequestInterceptor> {
            Some(self)
        }
    }

    #[async_trait]
    impl RequestInterceptor for Scripted {
        async fn intercept_request(
            &self,
            request: &HttpRequestView<'_>,
        ) -> Result<Interception<RequestDelta>, InterceptorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_targets
                .lock()
                .unwrap()
                .push(request.target_uri.to_string());
            match &self.behaviour {
                Behaviour::Delta(make) => Ok(Interception::Continue(make())),
                Behaviour::Handle => Ok(Interception::Handled(status_response(
                    StatusCode::FORBIDDEN,
                    "blocked",
                ))),
                Behaviour::Fail => Err("boom".into()),
                Behaviour::Panic => panic!("interceptor bug"),
            }
        }
    }

    fn client_parts() -> request::Parts {
        Request::builder()
            .uri("/foo?a=1&b=2")
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    fn client_info() -> ClientInfo {
        ClientInfo {
            remote_addr: None,
            proto: "http".into(),
            host: None,
        }
    }

    async fn run(registry: Arc<InterceptorRegistry>) -> ChainOutcome<RequestContext> {
        let chain = InterceptorChain::new(registry);
        let parts = client_parts();
        let target = Url::parse("http://upstream.local/foo").unwrap();
        let query = vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())];
        chain
            .process_http_request(&parts, &client_info(), &target, &HeaderMap::new(), &query)
            .await
    }

    #[tokio::test]
    async fn short_circuit_stops_later_interceptors() {
        let registry = Arc::new(InterceptorRegistry::new());
        let first = Arc::new(Scripted::new(Behaviour::Handle));
        let second = Arc::new(Scripted::new(Behaviour::Delta(RequestDelta::default)));
        registry.register("first", 1, first.clone());
        registry.register("second", 2, second.clone());

        match run(registry).await {
            ChainOutcome::Handled(response) => assert_eq!(response.status(), StatusCode::FORBIDDEN),
            ChainOutcome::Forward(_) => panic!("expected short-circuit"),
        }
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn accumulates_headers_and_query() {
        let registry = Arc::new(InterceptorRegistry::new());
        registry.register(
            "a",
            1,
            Arc::new(Scripted::new(Behaviour::Delta(|| {
                RequestDelta::default()
                    .add_header("x-one", "1")
                    .add_header("x-empty", "")
                    .add_query_param("a", "10")
            }))),
        );
        registry.register(
            "b",
            2,
            Arc::new(Scripted::new(Behaviour::Delta(|| {
                RequestDelta::default()
                    .add_header("x-two", "2")
                    .remove_header("x-one")
                    .remove_query_param("b")
                    .add_query_param("c", "3")
            }))),
        );

        let ChainOutcome::Forward(ctx) = run(registry).await else {
            panic!("expected forward");
        };

        let mut outbound = HeaderMap::new();
        outbound.insert("x-client", HeaderValue::from_static("c"));
        ctx.headers.apply(&mut outbound);
        assert_eq!(outbound["x-client"], "c");
        assert_eq!(outbound["x-two"], "2");
        assert!(outbound.get("x-one").is_none());
        assert!(outbound.get("x-empty").is_none());

        let existing = vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())];
        assert_eq!(
            ctx.apply_query(&existing),
            vec![("a".to_string(), "10".to_string()), ("c".to_string(), "3".to_string())]
        );
    }

    #[tokio::test]
    async fn rewrites_are_visible_to_later_interceptors() {
        let registry = Arc::new(InterceptorRegistry::new());
        let rewriter = Arc::new(Scripted::new(Behaviour::Delta(|| {
            RequestDelta::default().rewrite_target(Url::parse("http://other.local/bar").unwrap())
        })));
        let observer = Arc::new(Scripted::new(Behaviour::Delta(RequestDelta::default)));
        registry.register("rewriter", 1, rewriter.clone());
        registry.register("observer", 2, observer.clone());

        let ChainOutcome::Forward(ctx) = run(registry).await else {
            panic!("expected forward");
        };

        assert_eq!(rewriter.seen_targets.lock().unwrap()[0], "http://upstream.local/foo");
        assert_eq!(observer.seen_targets.lock().unwrap()[0], "http://other.local/bar");
        assert_eq!(ctx.target_uri.unwrap().as_str(), "http://other.local/bar");
    }

    #[tokio::test]
    async fn failing_interceptors_are_isolated() {
        let registry = Arc::new(InterceptorRegistry::new());
        let last = Arc::new(Scripted::new(Behaviour::Delta(|| {
            RequestDelta::default().add_header("x-last", "yes")
        })));
        registry.register("fails", 1, Arc::new(Scripted::new(Behaviour::Fail)));
        registry.register("panics", 2, Arc::new(Scripted::new(Behaviour::Panic)));
        registry.register("last", 3, last.clone());

        let ChainOutcome::Forward(ctx) = run(registry).await else {
            panic!("expected forward");
        };
        assert_eq!(last.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.headers.add["x-last"], "yes");
    }

    #[test]
    fn set_query_param_collapses_duplicates() {
        let mut params = vec![
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "3".to_string()),
        ];
        set_query_param(&mut params, "a".into(), "9".into());
        assert_eq!(
            params,
            vec![("a".to_string(), "9".to_string()), ("b".to_string(), "2".to_string())]
        );
    }
}
