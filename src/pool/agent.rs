//! One pooled upstream client per scheme.
//!
//! # Responsibilities
//! - Own the keep-alive `hyper-util` client (plain or TLS)
//! - Bound concurrent upstream requests per host and overall
//! - Track waiting / active / idle counts per host
//!
//! # Design Decisions
//! - A lease is held for the lifetime of one upstream exchange, body included
//! - Waiting counts are kept by a guard so a cancelled checkout still decrements
//! - Idle counts are an estimate: released leases up to the per-host limit

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::Request;
use dashmap::DashMap;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::{Client, ResponseFuture};
use hyper_util::rt::{TokioExecutor, TokioTimer};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::PoolConfig;
use crate::error::{ProxyError, Result};
use crate::pool::tls::client_tls_config;

enum UpstreamClient {
    Plain(Client<HttpConnector, Body>),
    Tls(Client<HttpsConnector<HttpConnector>, Body>),
}

#[derive(Debug)]
struct HostSlots {
    permits: Arc<Semaphore>,
    waiting: AtomicUsize,
    active: AtomicUsize,
    idle: AtomicUsize,
}

impl HostSlots {
    fn new(limit: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            waiting: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
        }
    }
}

/// Socket counts for one host or one pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SocketCounts {
    pub active: usize,
    pub idle: usize,
    pub waiting: usize,
}

/// Pool utilisation, overall and per target host.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentMetrics {
    #[serde(flatten)]
    pub total: SocketCounts,
    pub per_target: BTreeMap<String, SocketCounts>,
}

/// A keep-alive upstream client shared by all requests of one scheme.
pub struct PooledAgent {
    scheme: &'static str,
    client: UpstreamClient,
    keep_alive: bool,
    max_sockets_per_host: usize,
    total: Option<Arc<Semaphore>>,
    hosts: DashMap<String, Arc<HostSlots>>,
}

impl PooledAgent {
    /// Plain HTTP agent.
    pub fn http(config: &PoolConfig) -> Self {
        let client = client_builder(config).build(http_connector(config));
        Self::with_client("http", UpstreamClient::Plain(client), config)
    }

    /// TLS agent; also accepts plain `http` URIs.
    pub fn https(config: &PoolConfig, reject_unauthorized: bool) -> Self {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(client_tls_config(reject_unauthorized))
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector(config));
        let client = client_builder(config).build(connector);
        Self::with_client("https", UpstreamClient::Tls(client), config)
    }

    fn with_client(scheme: &'static str, client: UpstreamClient, config: &PoolConfig) -> Self {
        tracing::info!(
            scheme = scheme,
            keep_alive = config.keep_alive,
            max_sockets_per_host = config.max_sockets_per_host,
            max_total_sockets = ?config.max_total_sockets,
            "Upstream pool created"
        );
        Self {
            scheme,
            client,
            keep_alive: config.keep_alive,
            max_sockets_per_host: config.max_sockets_per_host,
            total: config.max_total_sockets.map(|n| Arc::new(Semaphore::new(n))),
            hosts: DashMap::new(),
        }
    }

    pub fn scheme(&self) -> &'static str {
        self.scheme
    }

    fn slots(&self, host: &str) -> Arc<HostSlots> {
        if let Some(slots) = self.hosts.get(host) {
            return slots.clone();
        }
        self.hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(HostSlots::new(self.max_sockets_per_host)))
            .clone()
    }

    /// Wait for a free socket slot for `host`.
    pub async fn checkout(&self, host: &str) -> Result<PoolLease> {
        let slots = self.slots(host);

        let (host_permit, total_permit) = {
            let _waiting = WaitingGuard::enter(&slots);
            let host_permit = slots
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| pool_closed(host))?;
            let total_permit = match &self.total {
                Some(total) => Some(
                    total
                        .clone()
                        .acquire_owned()
                        .await
                        .map_err(|_| pool_closed(host))?,
                ),
                None => None,
            };
            (host_permit, total_permit)
        };

        slots.active.fetch_add(1, Ordering::Relaxed);
        let _ = slots
            .idle
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));

        Ok(PoolLease {
            slots,
            max_idle: if self.keep_alive { self.max_sockets_per_host } else { 0 },
            reusable: true,
            _host_permit: host_permit,
            _total_permit: total_permit,
        })
    }

    /// Issue a request on the underlying client. Callers hold a lease.
    pub fn request(&self, request: Request<Body>) -> ResponseFuture {
        match &self.client {
            UpstreamClient::Plain(client) => client.request(request),
            UpstreamClient::Tls(client) => client.request(request),
        }
    }

    /// Requests currently queued for a slot on `host`.
    pub fn waiting_requests(&self, host: &str) -> usize {
        self.hosts
            .get(host)
            .map(|slots| slots.waiting.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn metrics(&self) -> AgentMetrics {
        let mut metrics = AgentMetrics::default();
        for entry in self.hosts.iter() {
            let counts = SocketCounts {
                active: entry.active.load(Ordering::Relaxed),
                idle: entry.idle.load(Ordering::Relaxed),
                waiting: entry.waiting.load(Ordering::Relaxed),
            };
            metrics.total.active += counts.active;
            metrics.total.idle += counts.idle;
            metrics.total.waiting += counts.waiting;
            if counts != SocketCounts::default() {
                metrics.per_target.insert(entry.key().clone(), counts);
            }
        }
        metrics
    }
}

fn http_connector(config: &PoolConfig) -> HttpConnector {
    let mut connector = HttpConnector::new();
    connector.enforce_http(false);
    connector.set_nodelay(true);
    if config.keep_alive {
        connector.set_keepalive(Some(Duration::from_secs(config.idle_timeout_secs)));
    }
    connector
}

fn client_builder(config: &PoolConfig) -> hyper_util::client::legacy::Builder {
    let mut builder = Client::builder(TokioExecutor::new());
    builder
        .pool_timer(TokioTimer::new())
        .pool_idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .pool_max_idle_per_host(if config.keep_alive {
            config.max_sockets_per_host
        } else {
            0
        });
    builder
}

fn pool_closed(host: &str) -> ProxyError {
    ProxyError::UpstreamConnectionFailure {
        message: format!("connection pool for {host} is closed"),
        refused: false,
    }
}

struct WaitingGuard<'a>(&'a HostSlots);

impl<'a> WaitingGuard<'a> {
    fn enter(slots: &'a HostSlots) -> Self {
        slots.waiting.fetch_add(1, Ordering::Relaxed);
        Self(slots)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.waiting.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A held socket slot. Released on drop.
#[derive(Debug)]
pub struct PoolLease {
    slots: Arc<HostSlots>,
    max_idle: usize,
    reusable: bool,
    _host_permit: OwnedSemaphorePermit,
    _total_permit: Option<OwnedSemaphorePermit>,
}

impl PoolLease {
    /// The socket will not return to the pool (upgraded or failed).
    pub fn detach(&mut self) {
        self.reusable = false;
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        self.slots.active.fetch_sub(1, Ordering::Relaxed);
        if self.reusable {
            let max_idle = self.max_idle;
            let _ = self
                .slots
                .idle
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                    (n < max_idle).then_some(n + 1)
                });
        }
    }
}
