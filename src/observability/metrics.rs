//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Count requests, connection errors and timeouts, overall and per target
//! - Track active WebSocket tunnels per target
//! - Publish snapshots as gauges for the Prometheus exporter
//!
//! # Metrics
//! - `http_proxy_requests_total`, `http_proxy_requests{target}`
//! - `http_proxy_connection_errors_total`, `http_proxy_connection_errors{target}`
//! - `http_proxy_timeouts_total`, `http_proxy_timeouts{target}`
//! - `ws_proxy_requests_total`, `ws_proxy_connection_errors_total`
//! - `ws_proxy_active_connections_total`, `ws_proxy_active_connections{target}`
//! - `http_proxy_pool_{active,idle,waiting}{scheme}`
//!
//! # Design Decisions
//! - Counters are atomics in sharded maps; no global lock on the request path
//! - A target is the upstream origin (`scheme://host[:port]`)
//! - The sampler publishes on a fixed interval instead of per request

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use tokio::sync::broadcast;
use url::Url;

use crate::pool::{AgentMetrics, PoolMetrics};
use crate::proxy::ProxyEngine;

/// Metric key for an upstream URI.
pub fn target_key(uri: &Url) -> String {
    uri.origin().ascii_serialization()
}

/// A counter with a per-target breakdown.
#[derive(Debug, Default)]
pub struct TargetCounter {
    total: AtomicU64,
    per_target: DashMap<String, AtomicU64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub total: u64,
    pub per_target: BTreeMap<String, u64>,
}

impl TargetCounter {
    pub fn increment(&self, target: &str) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if let Some(counter) = self.per_target.get(target) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.per_target
            .entry(target.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn for_target(&self, target: &str) -> u64 {
        self.per_target
            .get(target)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            total: self.total(),
            per_target: self
                .per_target
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                .collect(),
        }
    }
}

/// Per-process request outcome counters.
#[derive(Debug, Default)]
pub struct RequestMetrics {
    pub http_requests: TargetCounter,
    pub http_connection_errors: TargetCounter,
    pub http_timeouts: TargetCounter,
    pub ws_requests: TargetCounter,
    pub ws_connection_errors: TargetCounter,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestMetricsSnapshot {
    pub http_requests: CounterSnapshot,
    pub http_connection_errors: CounterSnapshot,
    pub http_timeouts: CounterSnapshot,
    pub ws_requests: CounterSnapshot,
    pub ws_connection_errors: CounterSnapshot,
}

impl RequestMetrics {
    pub fn snapshot(&self) -> RequestMetricsSnapshot {
        RequestMetricsSnapshot {
            http_requests: self.http_requests.snapshot(),
            http_connection_errors: self.http_connection_errors.snapshot(),
            http_timeouts: self.http_timeouts.snapshot(),
            ws_requests: self.ws_requests.snapshot(),
            ws_connection_errors: self.ws_connection_errors.snapshot(),
        }
    }
}

/// Active WebSocket tunnels.
#[derive(Debug, Default)]
pub struct WsConnectionMetrics {
    active: AtomicUsize,
    per_target: DashMap<String, usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WsConnectionSnapshot {
    pub active_connections: usize,
    pub per_target: BTreeMap<String, usize>,
}

impl WsConnectionMetrics {
    pub fn increment(&self, target: &str) {
        self.active.fetch_add(1, Ordering::Relaxed);
        *self.per_target.entry(target.to_string()).or_insert(0) += 1;
    }

    /// Decrement; the target entry is removed once it reaches zero.
    pub fn decrement(&self, target: &str) {
        let _ = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        if let Some(mut count) = self.per_target.get_mut(target) {
            *count = count.saturating_sub(1);
        }
        self.per_target.remove_if(target, |_, count| *count == 0);
    }

    pub fn active_total(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn active_for_target(&self, target: &str) -> usize {
        self.per_target.get(target).map(|c| *c).unwrap_or(0)
    }

    /// Active tunnels to `authority` over `ws` and `wss` combined.
    pub fn active_for_host(&self, authority: &str) -> usize {
        self.active_for_target(&format!("ws://{authority}"))
            + self.active_for_target(&format!("wss://{authority}"))
    }

    pub fn snapshot(&self) -> WsConnectionSnapshot {
        WsConnectionSnapshot {
            active_connections: self.active_total(),
            per_target: self
                .per_target
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        }
    }
}

/// Everything the engine reports, as served by the admin API.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineMetricsSnapshot {
    pub requests: RequestMetricsSnapshot,
    pub ws_connections: WsConnectionSnapshot,
    pub pools: PoolMetrics,
}

/// Install the Prometheus exporter with an HTTP listener on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// Publish engine snapshots as gauges until shutdown.
pub async fn run_sampler(
    engine: Arc<ProxyEngine>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => publish(&engine.metrics_snapshot()),
            _ = shutdown.recv() => {
                tracing::debug!("Metrics sampler stopped");
                return;
            }
        }
    }
}

fn publish(snapshot: &EngineMetricsSnapshot) {
    let requests = &snapshot.requests;
    publish_counter("http_proxy_requests", &requests.http_requests);
    publish_counter("http_proxy_connection_errors", &requests.http_connection_errors);
    publish_counter("http_proxy_timeouts", &requests.http_timeouts);
    publish_counter("ws_proxy_requests", &requests.ws_requests);
    publish_counter("ws_proxy_connection_errors", &requests.ws_connection_errors);

    let ws = &snapshot.ws_connections;
    metrics::gauge!("ws_proxy_active_connections_total").set(ws.active_connections as f64);
    for (target, count) in &ws.per_target {
        metrics::gauge!("ws_proxy_active_connections", "target" => target.clone())
            .set(*count as f64);
    }

    publish_pool("http", snapshot.pools.http.as_ref());
    publish_pool("https", snapshot.pools.https.as_ref());
}

fn publish_counter(name: &'static str, counter: &CounterSnapshot) {
    metrics::gauge!(format!("{name}_total")).set(counter.total as f64);
    for (target, value) in &counter.per_target {
        metrics::gauge!(name, "target" => target.clone()).set(*value as f64);
    }
}

fn publish_pool(scheme: &'static str, pool: Option<&AgentMetrics>) {
    let Some(pool) = pool else {
        return;
    };
    metrics::gauge!("http_proxy_pool_active", "scheme" => scheme).set(pool.total.active as f64);
    metrics::gauge!("http_proxy_pool_idle", "scheme" => scheme).set(pool.total.idle as f64);
    metrics::gauge!("http_proxy_pool_waiting", "scheme" => scheme).set(pool.total.waiting as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_key_is_origin() {
        let url = Url::parse("http://Example.com:80/foo?x=1").unwrap();
        assert_eq!(target_key(&url), "http://example.com");
        let url = Url::parse("wss://example.com:8443/socket").unwrap();
        assert_eq!(target_key(&url), "wss://example.com:8443");
    }

    #[test]
    fn counts_total_and_per_target() {
        let counter = TargetCounter::default();
        counter.increment("http://a");
        counter.increment("http://a");
        counter.increment("http://b");

        assert_eq!(counter.total(), 3);
        assert_eq!(counter.for_target("http://a"), 2);
        assert_eq!(counter.for_target("http://c"), 0);
        assert_eq!(counter.snapshot().per_target.len(), 2);
    }

    #[test]
    fn ws_entries_removed_at_zero() {
        let ws = WsConnectionMetrics::default();
        ws.increment("ws://a:8080");
        ws.increment("wss://a:8080");
        assert_eq!(ws.active_for_host("a:8080"), 2);

        ws.decrement("ws://a:8080");
        ws.decrement("wss://a:8080");
        assert_eq!(ws.active_total(), 0);
        assert!(ws.snapshot().per_target.is_empty());
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let counter = Arc::new(TargetCounter::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.increment("http://shared");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.for_target("http://shared"), 8000);
    }
}
