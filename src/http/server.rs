//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with the catch-all proxy handler
//! - Wire up middleware (tracing, connection limit, request ID)
//! - Bind server to listener with graceful shutdown
//! - Enable TCP keep-alive on accepted sockets (long-lived WebSocket tunnels)
//! - Resolve the route and dispatch to the forwarding engine

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    serve::ListenerExt,
    Router,
};
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::http::request::{
    propagate_request_id_layer, request_id, set_request_id_layer, upgrade_protocol,
};
use crate::http::response::{error_response, status_response};
use crate::interceptor::builtin::register_configured;
use crate::interceptor::InterceptorRegistry;
use crate::pool::ConnectionPoolManager;
use crate::proxy::ProxyEngine;
use crate::routing::Router as ProxyRouter;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ProxyEngine>,
    pub router: Arc<ProxyRouter>,
    pub config: Arc<ProxyConfig>,
}

/// HTTP server for the reverse proxy.
pub struct HttpServer {
    router: Router,
    state: AppState,
}

impl HttpServer {
    /// Create a server with a fresh registry holding the configured interceptors.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let registry = Arc::new(InterceptorRegistry::new());
        register_configured(&registry, &config.interceptors);
        Self::with_registry(config, registry)
    }

    /// Create a server around an existing registry (plugins registered by the caller).
    pub fn with_registry(config: ProxyConfig, registry: Arc<InterceptorRegistry>) -> Result<Self> {
        let proxy_router = Arc::new(ProxyRouter::from_config(&config.routes)?);
        let pools = Arc::new(ConnectionPoolManager::new(
            config.pool.clone(),
            config.proxy.reject_unauthorized,
        ));
        let engine = Arc::new(ProxyEngine::new(&config, pools, registry));

        let state = AppState {
            engine,
            router: proxy_router,
            config: Arc::new(config),
        };

        let router = Self::build_router(state.clone());
        Ok(Self { router, state })
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(state: AppState) -> Router {
        let max_connections = state.config.listener.max_connections;
        Router::new()
            .route("/", any(proxy_handler))
            .route("/{*path}", any(proxy_handler))
            .with_state(state)
            .layer(GlobalConcurrencyLimitLayer::new(max_connections))
            .layer(propagate_request_id_layer())
            .layer(TraceLayer::new_for_http())
            .layer(set_request_id_layer())
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn engine(&self) -> &Arc<ProxyEngine> {
        &self.state.engine
    }

    /// Run the server until a shutdown signal arrives.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> std::result::Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            routes = self.state.router.len(),
            interceptors = self.state.engine.registry().len(),
            "HTTP server starting"
        );

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        let keepalive = self.state.config.listener.tcp_keepalive_secs;
        let listener = listener.tap_io(move |stream| {
            if keepalive > 0 {
                set_tcp_keepalive(stream, Duration::from_secs(keepalive));
            }
        });

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("HTTP server draining");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

fn set_tcp_keepalive(stream: &TcpStream, idle: Duration) {
    let keepalive = TcpKeepalive::new().with_time(idle);
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        tracing::debug!(error = %e, "Failed to enable TCP keep-alive");
    }
}

/// Main proxy handler: resolve the route, then forward.
async fn proxy_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let (parts, body) = request.into_parts();

    let Some(route) = state.router.match_request(&parts) else {
        tracing::debug!(
            request_id = %request_id(&parts.headers),
            path = %parts.uri.path(),
            "No route matched"
        );
        return status_response(StatusCode::NOT_FOUND, "No matching route found");
    };

    let upgrade = upgrade_protocol(&parts.headers);
    let websocket = upgrade.as_deref() == Some("websocket");
    let target = route.target_uri(parts.uri.path(), websocket);
    let additional_headers = route.additional_headers();

    tracing::debug!(
        request_id = %request_id(&parts.headers),
        method = %parts.method,
        route = %route.name,
        target_uri = %target,
        "Proxying request"
    );

    let request = Request::from_parts(parts, body);
    match upgrade {
        Some(_) if websocket => {
            state
                .engine
                .forward_ws(request, target, additional_headers)
                .await
        }
        Some(protocol) => error_response(&ProxyError::UpgradeUnsupported(protocol)),
        None => {
            state
                .engine
                .forward(request, target, additional_headers)
                .await
        }
    }
    .into_response()
}
