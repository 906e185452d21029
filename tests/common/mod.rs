//! Shared utilities for integration tests: mock upstreams and a proxy harness.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as WsRequest, Response as WsResponse,
};

use http_proxy::config::{ProxyConfig, RouteConfig};
use http_proxy::interceptor::InterceptorRegistry;
use http_proxy::{HttpServer, ProxyEngine, Shutdown};

/// A request as the mock upstream received it.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Clone)]
struct BackendState {
    status: StatusCode,
    body: &'static str,
    captured: Arc<Mutex<Vec<CapturedRequest>>>,
}

/// An HTTP upstream answering every request with a fixed status and body.
pub struct MockBackend {
    pub addr: SocketAddr,
    captured: Arc<Mutex<Vec<CapturedRequest>>>,
}

impl MockBackend {
    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.captured.lock().unwrap().clone()
    }
}

async fn capture(State(state): State<BackendState>, request: Request<Body>) -> (StatusCode, &'static str) {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX).await.unwrap_or_default();
    state.captured.lock().unwrap().push(CapturedRequest {
        method: parts.method,
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers: parts.headers,
        body,
    });
    (state.status, state.body)
}

pub async fn start_backend(status: StatusCode, body: &'static str) -> MockBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let captured = Arc::new(Mutex::new(Vec::new()));
    let state = BackendState {
        status,
        body,
        captured: captured.clone(),
    };

    let app = axum::Router::new().fallback(capture).with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    MockBackend { addr, captured }
}

/// An upstream streaming `chunks` small chunks, one every `interval`.
pub async fn start_streaming_backend(chunks: usize, interval: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let app = axum::Router::new().fallback(move || async move {
        let stream = futures_util::stream::unfold(0usize, move |sent| async move {
            if sent == chunks {
                return None;
            }
            tokio::time::sleep(interval).await;
            Some((Ok::<_, std::io::Error>(Bytes::from_static(b"tick\n")), sent + 1))
        });
        Body::from_stream(stream)
    });
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    addr
}

/// Read until the end of the request head.
async fn read_request_head(socket: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

/// An upstream that resets each connection after reading the request head.
///
/// With `succeed_after = Some(n)`, connection `n + 1` onwards gets a
/// `200 "recovered"` instead. Returns the address and the connection count.
pub async fn start_reset_backend(succeed_after: Option<u32>) -> (SocketAddr, Arc<AtomicU32>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicU32::new(0));
    let counter = connections.clone();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::spawn(async move {
                read_request_head(&mut socket).await;
                if succeed_after.is_some_and(|k| n > k) {
                    let _ = socket
                        .write_all(
                            b"HTTP/1.1 200 OK\r\nContent-Length: 9\r\nConnection: close\r\n\r\nrecovered",
                        )
                        .await;
                    let _ = socket.shutdown().await;
                } else {
                    #[allow(deprecated)]
                    let _ = socket.set_linger(Some(Duration::ZERO));
                    drop(socket);
                }
            });
        }
    });

    (addr, connections)
}

/// An upstream that accepts and reads but never answers.
pub async fn start_hanging_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                read_request_head(&mut socket).await;
                tokio::time::sleep(Duration::from_secs(60)).await;
                drop(socket);
            });
        }
    });

    addr
}

/// An address nothing listens on.
pub async fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// A WebSocket upstream echoing text and binary frames.
pub struct WsEchoBackend {
    pub addr: SocketAddr,
    /// Accepted TCP connections.
    pub accepted: Arc<AtomicU32>,
    handshakes: Arc<Mutex<Vec<HeaderMap>>>,
}

impl WsEchoBackend {
    /// Headers of each upgrade request the backend answered.
    pub fn handshakes(&self) -> Vec<HeaderMap> {
        self.handshakes.lock().unwrap().clone()
    }
}

pub async fn start_ws_echo_backend() -> WsEchoBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicU32::new(0));
    let handshakes = Arc::new(Mutex::new(Vec::new()));
    let counter = accepted.clone();
    let recorded = handshakes.clone();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let recorded = recorded.clone();
            tokio::spawn(async move {
                let record = move |request: &WsRequest, response: WsResponse| -> Result<WsResponse, ErrorResponse> {
                    recorded.lock().unwrap().push(request.headers().clone());
                    Ok(response)
                };
                let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(socket, record).await else {
                    return;
                };
                while let Some(Ok(message)) = ws.next().await {
                    if message.is_text() || message.is_binary() {
                        if ws.send(message).await.is_err() {
                            break;
                        }
                    } else if message.is_close() {
                        break;
                    }
                }
            });
        }
    });

    WsEchoBackend {
        addr,
        accepted,
        handshakes,
    }
}

/// A catch-all route forwarding to `upstream` over plain HTTP.
pub fn route_to(upstream: SocketAddr) -> RouteConfig {
    RouteConfig {
        name: "default".into(),
        host: None,
        path_prefix: "/".into(),
        target: format!("http://{upstream}"),
        strip_prefix: true,
        priority: 0,
        additional_headers: BTreeMap::new(),
    }
}

/// Proxy running on an ephemeral port; shut down on drop.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub engine: Arc<ProxyEngine>,
    shutdown: Shutdown,
}

impl TestProxy {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

pub async fn spawn_proxy(config: ProxyConfig) -> TestProxy {
    spawn_proxy_with_registry(config, Arc::new(InterceptorRegistry::new())).await
}

pub async fn spawn_proxy_with_registry(
    mut config: ProxyConfig,
    registry: Arc<InterceptorRegistry>,
) -> TestProxy {
    config.observability.metrics_enabled = false;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = HttpServer::with_registry(config, registry).unwrap();
    let engine = server.engine().clone();
    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, server_shutdown).await;
    });

    TestProxy {
        addr,
        engine,
        shutdown,
    }
}

/// A client that never reuses connections, so each request is independent.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}
