//! Admin API: status, metrics snapshot and interceptor list.

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::{middleware, routing::get, Router};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::proxy::ProxyEngine;

#[derive(Clone)]
pub struct AdminState {
    pub engine: Arc<ProxyEngine>,
    pub api_key: Arc<str>,
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/metrics", get(get_metrics))
        .route("/admin/interceptors", get(get_interceptors))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
}

/// Serve the admin API until shutdown.
pub async fn serve_admin(
    listener: TcpListener,
    state: AdminState,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    tracing::info!(address = %listener.local_addr()?, "Admin API listening");
    axum::serve(listener, setup_admin_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::interceptor::InterceptorRegistry;
    use crate::pool::ConnectionPoolManager;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn state() -> AdminState {
        let config = ProxyConfig::default();
        let pools = Arc::new(ConnectionPoolManager::new(config.pool.clone(), true));
        let engine = Arc::new(ProxyEngine::new(
            &config,
            pools,
            Arc::new(InterceptorRegistry::new()),
        ));
        AdminState {
            engine,
            api_key: Arc::from("secret"),
        }
    }

    #[tokio::test]
    async fn rejects_missing_key() {
        let response = setup_admin_router(state())
            .oneshot(Request::get("/admin/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn serves_metrics_with_key() {
        let state = state();
        state.engine.request_metrics().http_requests.increment("http://a");

        let response = setup_admin_router(state)
            .oneshot(
                Request::get("/admin/metrics")
                    .header("authorization", "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["requests"]["http_requests"]["total"], 1);
        assert_eq!(json["requests"]["http_requests"]["per_target"]["http://a"], 1);
    }
}
