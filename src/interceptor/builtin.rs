//! Interceptors built from `[[interceptors]]` config entries.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;

use crate::config::InterceptorConfig;
use crate::http::response::status_response;
use crate::interceptor::{
    HttpRequestView, HttpResponseView, Interception, Interceptor, InterceptorError,
    InterceptorRegistry, RequestDelta, RequestInterceptor, ResponseDelta, ResponseInterceptor,
    WsRequestDelta, WsRequestInterceptor, WsRequestView,
};

/// Adds and removes fixed headers and query parameters, and answers
/// requests to blocked path prefixes directly.
#[derive(Debug, Clone)]
pub struct StaticHeadersInterceptor {
    config: InterceptorConfig,
    block_status: StatusCode,
}

impl StaticHeadersInterceptor {
    pub fn from_config(config: &InterceptorConfig) -> Self {
        let block_status = config
            .block_status
            .and_then(|code| StatusCode::from_u16(code).ok())
            .unwrap_or(StatusCode::FORBIDDEN);
        Self {
            config: config.clone(),
            block_status,
        }
    }

    fn is_blocked(&self, path: &str) -> bool {
        self.config
            .block_path_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    fn blocked(&self, path: &str) -> axum::response::Response {
        tracing::debug!(interceptor = %self.config.name, path = %path, "Blocked path");
        status_response(
            self.block_status,
            self.block_status.canonical_reason().unwrap_or("Blocked"),
        )
    }
}

impl Interceptor for StaticHeadersInterceptor {
    fn on_request(&self) -> Option<&dyn RequestInterceptor> {
        Some(self)
    }

    fn on_ws_request(&self) -> Option<&dyn WsRequestInterceptor> {
        Some(self)
    }

    fn on_response(&self) -> Option<&dyn ResponseInterceptor> {
        let cfg = &self.config;
        if cfg.add_response_headers.is_empty() && cfg.remove_response_headers.is_empty() {
            return None;
        }
        Some(self)
    }
}

#[async_trait]
impl RequestInterceptor for StaticHeadersInterceptor {
    async fn intercept_request(
        &self,
        request: &HttpRequestView<'_>,
    ) -> Result<Interception<RequestDelta>, InterceptorError> {
        let path = request.client_request.uri.path();
        if self.is_blocked(path) {
            return Ok(Interception::Handled(self.blocked(path)));
        }

        let cfg = &self.config;
        let mut delta = RequestDelta::default();
        for (name, value) in &cfg.add_request_headers {
            delta = delta.add_header(name, value);
        }
        for name in &cfg.remove_request_headers {
            delta = delta.remove_header(name);
        }
        for (name, value) in &cfg.add_query_params {
            delta = delta.add_query_param(name, value);
        }
        for name in &cfg.remove_query_params {
            delta = delta.remove_query_param(name);
        }
        Ok(Interception::Continue(delta))
    }
}

#[async_trait]
impl WsRequestInterceptor for StaticHeadersInterceptor {
    async fn intercept_ws_request(
        &self,
        request: &WsRequestView<'_>,
    ) -> Result<Interception<WsRequestDelta>, InterceptorError> {
        let path = request.client_request.uri.path();
        if self.is_blocked(path) {
            return Ok(Interception::Handled(self.blocked(path)));
        }

        let cfg = &self.config;
        let mut delta = WsRequestDelta::default();
        for (name, value) in &cfg.add_request_headers {
            delta = delta.add_header(name, value);
        }
        for name in &cfg.remove_request_headers {
            delta = delta.remove_header(name);
        }
        Ok(Interception::Continue(delta))
    }
}

#[async_trait]
impl ResponseInterceptor for StaticHeadersInterceptor {
    async fn intercept_response(
        &self,
        _response: &HttpResponseView<'_>,
    ) -> Result<Interception<ResponseDelta>, InterceptorError> {
        let cfg = &self.config;
        let mut delta = ResponseDelta::default();
        for (name, value) in &cfg.add_response_headers {
            delta = delta.add_header(name, value);
        }
        for name in &cfg.remove_response_headers {
            delta = delta.remove_header(name);
        }
        Ok(Interception::Continue(delta))
    }
}

/// Register every configured interceptor under its name.
pub fn register_configured(registry: &InterceptorRegistry, configs: &[InterceptorConfig]) {
    for config in configs {
        registry.register(
            config.name.clone(),
            config.order,
            Arc::new(StaticHeadersInterceptor::from_config(config)),
        );
    }
}
