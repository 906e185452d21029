//! WebSocket tunnelling through a running proxy.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use http_proxy::config::ProxyConfig;
use http_proxy::http::response::status_response;
use http_proxy::interceptor::{
    Interception, Interceptor, InterceptorError, InterceptorRegistry, WsRequestDelta,
    WsRequestInterceptor, WsRequestView,
};

mod common;

#[tokio::test]
async fn messages_round_trip_through_tunnel() {
    let backend = common::start_ws_echo_backend().await;
    let mut config = ProxyConfig::default();
    config.routes.push(common::route_to(backend.addr));
    let proxy = common::spawn_proxy(config).await;

    let (mut ws, response) = tokio_tungstenite::connect_async(proxy.ws_url("/echo"))
        .await
        .expect("handshake through proxy failed");
    assert_eq!(response.status(), 101);

    ws.send(Message::text("hello")).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("no echo")
        .unwrap()
        .unwrap();
    assert_eq!(reply.to_text().unwrap(), "hello");

    ws.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    assert_eq!(&reply.into_data()[..], &[1u8, 2, 3]);

    assert_eq!(backend.accepted.load(Ordering::SeqCst), 1);
    let key = format!("ws://{}", backend.addr);
    assert_eq!(proxy.engine.ws_connection_metrics().active_for_target(&key), 1);
    assert_eq!(proxy.engine.request_metrics().ws_requests.for_target(&key), 1);

    ws.close(None).await.unwrap();
    drop(ws);

    tokio::time::timeout(Duration::from_secs(5), async {
        while proxy.engine.ws_connection_metrics().active_total() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("tunnel still counted after close");
}

#[tokio::test]
async fn per_host_limit_rejects_without_contacting_upstream() {
    let backend = common::start_ws_echo_backend().await;
    let mut config = ProxyConfig::default();
    config.routes.push(common::route_to(backend.addr));
    config.websocket.max_connections_per_host = Some(0);
    let proxy = common::spawn_proxy(config).await;

    match tokio_tungstenite::connect_async(proxy.ws_url("/echo")).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 429),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("handshake should have been rejected"),
    }

    assert_eq!(backend.accepted.load(Ordering::SeqCst), 0);
    assert_eq!(proxy.engine.request_metrics().ws_requests.total(), 0);
}

#[tokio::test]
async fn unreachable_upstream_fails_handshake() {
    let backend_addr = common::refused_addr().await;
    let mut config = ProxyConfig::default();
    config.routes.push(common::route_to(backend_addr));
    let proxy = common::spawn_proxy(config).await;

    match tokio_tungstenite::connect_async(proxy.ws_url("/echo")).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 503),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("handshake should have failed"),
    }

    let key = format!("ws://{backend_addr}");
    assert_eq!(
        proxy.engine.request_metrics().ws_connection_errors.for_target(&key),
        1
    );
}

#[tokio::test]
async fn non_websocket_upgrade_is_not_acceptable() {
    let backend = common::start_ws_echo_backend().await;
    let mut config = ProxyConfig::default();
    config.routes.push(common::route_to(backend.addr));
    let proxy = common::spawn_proxy(config).await;

    let res = common::client()
        .get(proxy.url("/echo"))
        .header("connection", "upgrade")
        .header("upgrade", "h2c")
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), 406);
    assert_eq!(backend.accepted.load(Ordering::SeqCst), 0);
}

struct HandshakeDecorator;

impl Interceptor for HandshakeDecorator {
    fn on_ws_request(&self) -> Option<&dyn WsRequestInterceptor> {
        Some(self)
    }
}

#[async_trait]
impl WsRequestInterceptor for HandshakeDecorator {
    async fn intercept_ws_request(
        &self,
        request: &WsRequestView<'_>,
    ) -> Result<Interception<WsRequestDelta>, InterceptorError> {
        let user = request
            .headers
            .get("x-user")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("anonymous")
            .to_string();
        Ok(Interception::Continue(
            WsRequestDelta::default()
                .add_header("x-ws-user", user)
                .remove_header("x-user"),
        ))
    }
}

#[tokio::test]
async fn handshake_carries_interceptor_and_route_headers() {
    let backend = common::start_ws_echo_backend().await;
    let mut config = ProxyConfig::default();
    let mut route = common::route_to(backend.addr);
    route.additional_headers.insert("x-api-key".into(), "secret".into());
    config.routes.push(route);

    let registry = Arc::new(InterceptorRegistry::new());
    registry.register("handshake-decorator", 0, Arc::new(HandshakeDecorator));
    let proxy = common::spawn_proxy_with_registry(config, registry).await;

    let mut request = proxy.ws_url("/echo").into_client_request().unwrap();
    request.headers_mut().insert("x-user", "alice".parse().unwrap());
    let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    ws.send(Message::text("ping")).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    assert_eq!(reply.to_text().unwrap(), "ping");

    let handshakes = backend.handshakes();
    assert_eq!(handshakes.len(), 1);
    assert_eq!(handshakes[0]["x-ws-user"], "alice");
    assert_eq!(handshakes[0]["x-api-key"], "secret");
    assert!(handshakes[0].get("x-user").is_none());
}

struct RejectHandshake;

impl Interceptor for RejectHandshake {
    fn on_ws_request(&self) -> Option<&dyn WsRequestInterceptor> {
        Some(self)
    }
}

#[async_trait]
impl WsRequestInterceptor for RejectHandshake {
    async fn intercept_ws_request(
        &self,
        _request: &WsRequestView<'_>,
    ) -> Result<Interception<WsRequestDelta>, InterceptorError> {
        Ok(Interception::Handled(status_response(StatusCode::FORBIDDEN, "denied")))
    }
}

#[tokio::test]
async fn handled_handshake_never_reaches_upstream() {
    let backend = common::start_ws_echo_backend().await;
    let mut config = ProxyConfig::default();
    config.routes.push(common::route_to(backend.addr));

    let registry = Arc::new(InterceptorRegistry::new());
    registry.register("reject", 0, Arc::new(RejectHandshake));
    registry.register("handshake-decorator", 1, Arc::new(HandshakeDecorator));
    let proxy = common::spawn_proxy_with_registry(config, registry).await;

    match tokio_tungstenite::connect_async(proxy.ws_url("/echo")).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 403),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("handshake should have been refused"),
    }

    assert_eq!(backend.accepted.load(Ordering::SeqCst), 0);
    assert_eq!(proxy.engine.request_metrics().ws_requests.total(), 0);
    assert_eq!(proxy.engine.ws_connection_metrics().active_total(), 0);
}
