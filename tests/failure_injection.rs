//! Failure injection tests for the proxy engine.

use std::sync::atomic::Ordering;
use std::time::Duration;

use http_proxy::config::ProxyConfig;

mod common;

fn target_key(addr: std::net::SocketAddr) -> String {
    format!("http://{addr}")
}

#[tokio::test]
async fn reset_is_retried_until_success() {
    let (backend_addr, connections) = common::start_reset_backend(Some(1)).await;
    let mut config = ProxyConfig::default();
    config.routes.push(common::route_to(backend_addr));
    let proxy = common::spawn_proxy(config).await;

    let res = common::client()
        .get(proxy.url("/flaky"))
        .send()
        .await
        .expect("proxy unreachable");

    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "recovered");
    assert_eq!(connections.load(Ordering::SeqCst), 2);

    let snapshot = proxy.engine.metrics_snapshot();
    assert_eq!(snapshot.requests.http_requests.total, 1);
    assert_eq!(snapshot.requests.http_connection_errors.total, 0);
}

#[tokio::test]
async fn retries_are_bounded() {
    let (backend_addr, connections) = common::start_reset_backend(None).await;
    let mut config = ProxyConfig::default();
    config.routes.push(common::route_to(backend_addr));
    config.proxy.max_retries = 2;
    let proxy = common::spawn_proxy(config).await;

    let res = common::client().get(proxy.url("/dead")).send().await.unwrap();

    assert_eq!(res.status(), 502);
    assert_eq!(connections.load(Ordering::SeqCst), 3);
    assert_eq!(
        proxy
            .engine
            .request_metrics()
            .http_connection_errors
            .for_target(&target_key(backend_addr)),
        1
    );
}

#[tokio::test]
async fn reset_without_retry_fails_once() {
    let (backend_addr, connections) = common::start_reset_backend(None).await;
    let mut config = ProxyConfig::default();
    config.routes.push(common::route_to(backend_addr));
    config.proxy.retry_on_reset = false;
    let proxy = common::spawn_proxy(config).await;

    let res = common::client().get(proxy.url("/dead")).send().await.unwrap();

    assert_eq!(res.status(), 502);
    assert_eq!(connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn silent_upstream_times_out() {
    let backend_addr = common::start_hanging_backend().await;
    let mut config = ProxyConfig::default();
    config.routes.push(common::route_to(backend_addr));
    config.proxy.socket_timeout_ms = 200;
    let proxy = common::spawn_proxy(config).await;

    let started = std::time::Instant::now();
    let res = common::client().get(proxy.url("/slow")).send().await.unwrap();

    assert_eq!(res.status(), 504);
    assert!(started.elapsed() < Duration::from_secs(5));
    let metrics = proxy.engine.request_metrics();
    assert_eq!(metrics.http_timeouts.for_target(&target_key(backend_addr)), 1);
    assert_eq!(metrics.http_connection_errors.total(), 0);
}

#[tokio::test]
async fn refused_connection_is_unavailable() {
    let backend_addr = common::refused_addr().await;
    let mut config = ProxyConfig::default();
    config.routes.push(common::route_to(backend_addr));
    let proxy = common::spawn_proxy(config).await;

    let res = common::client().get(proxy.url("/")).send().await.unwrap();

    assert_eq!(res.status(), 503);
    assert_eq!(proxy.engine.request_metrics().http_connection_errors.total(), 1);
}

#[tokio::test]
async fn full_host_queue_is_rejected() {
    let backend_addr = common::start_hanging_backend().await;
    let mut config = ProxyConfig::default();
    config.routes.push(common::route_to(backend_addr));
    config.pool.max_sockets_per_host = 1;
    config.proxy.max_waiting_requests_per_host = Some(1);
    config.proxy.socket_timeout_ms = 10_000;
    let proxy = common::spawn_proxy(config).await;
    let host = backend_addr.to_string();

    // First request holds the only socket, second one queues behind it.
    for _ in 0..2 {
        let client = common::client();
        let url = proxy.url("/held");
        tokio::spawn(async move {
            let _ = client.get(url).send().await;
        });
    }

    let pools = proxy.engine.pools().clone();
    tokio::time::timeout(Duration::from_secs(5), async {
        while pools.waiting_requests_for_host("http", &host) < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("second request never queued");

    let res = common::client().get(proxy.url("/rejected")).send().await.unwrap();
    assert_eq!(res.status(), 429);

    let active = proxy
        .engine
        .metrics_snapshot()
        .pools
        .http
        .map(|pool| pool.total.active)
        .unwrap_or_default();
    assert_eq!(active, 1);
}
