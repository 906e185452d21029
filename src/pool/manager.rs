//! Lazily built upstream pools, one per scheme.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwap;
use serde::Serialize;

use crate::config::PoolConfig;
use crate::pool::agent::{AgentMetrics, PooledAgent};

/// Utilisation of both pools. A pool that was never built reports nothing.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolMetrics {
    pub http: Option<AgentMetrics>,
    pub https: Option<AgentMetrics>,
}

/// Owns the plain and TLS upstream pools.
///
/// The configuration is read when a pool is first used. Calling
/// [`reconfigure`](Self::reconfigure) after that has no effect on the pool
/// already built.
pub struct ConnectionPoolManager {
    config: ArcSwap<PoolConfig>,
    reject_unauthorized: AtomicBool,
    http: OnceLock<Arc<PooledAgent>>,
    https: OnceLock<Arc<PooledAgent>>,
}

impl ConnectionPoolManager {
    pub fn new(config: PoolConfig, reject_unauthorized: bool) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            reject_unauthorized: AtomicBool::new(reject_unauthorized),
            http: OnceLock::new(),
            https: OnceLock::new(),
        }
    }

    pub fn reconfigure(&self, config: PoolConfig, reject_unauthorized: bool) {
        if self.http.get().is_some() || self.https.get().is_some() {
            tracing::warn!("Pool configuration changed after first use; existing pools keep their settings");
        }
        self.config.store(Arc::new(config));
        self.reject_unauthorized
            .store(reject_unauthorized, Ordering::Relaxed);
    }

    pub fn http_pool(&self) -> Arc<PooledAgent> {
        self.http
            .get_or_init(|| Arc::new(PooledAgent::http(&self.config.load())))
            .clone()
    }

    pub fn https_pool(&self) -> Arc<PooledAgent> {
        self.https
            .get_or_init(|| {
                Arc::new(PooledAgent::https(
                    &self.config.load(),
                    self.reject_unauthorized.load(Ordering::Relaxed),
                ))
            })
            .clone()
    }

    /// Pool serving a URI scheme (`ws`/`wss` share the HTTP pools).
    pub fn pool_for(&self, scheme: &str) -> Option<Arc<PooledAgent>> {
        match scheme {
            "http" | "ws" => Some(self.http_pool()),
            "https" | "wss" => Some(self.https_pool()),
            _ => None,
        }
    }

    /// Requests queued for `host` (`name:port`). Never builds a pool.
    pub fn waiting_requests_for_host(&self, protocol: &str, host: &str) -> usize {
        let pool = match protocol.trim_end_matches(':') {
            "http" | "ws" => self.http.get(),
            "https" | "wss" => self.https.get(),
            _ => None,
        };
        pool.map(|pool| pool.waiting_requests(host)).unwrap_or(0)
    }

    pub fn pool_metrics(&self) -> PoolMetrics {
        PoolMetrics {
            http: self.http.get().map(|pool| pool.metrics()),
            https: self.https.get().map(|pool| pool.metrics()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pools_are_built_once() {
        let manager = ConnectionPoolManager::new(PoolConfig::default(), true);
        assert!(manager.pool_metrics().http.is_none());

        let first = manager.http_pool();
        let second = manager.pool_for("ws").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(manager.pool_metrics().http.is_some());
        assert!(manager.pool_metrics().https.is_none());
        assert!(manager.pool_for("ftp").is_none());
    }

    #[tokio::test]
    async fn reconfigure_does_not_touch_built_pools() {
        let manager = ConnectionPoolManager::new(
            PoolConfig {
                max_sockets_per_host: 1,
                ..PoolConfig::default()
            },
            true,
        );
        let pool = manager.http_pool();
        manager.reconfigure(
            PoolConfig {
                max_sockets_per_host: 5,
                ..PoolConfig::default()
            },
            true,
        );

        let _held = pool.checkout("a:80").await.unwrap();
        let blocked =
            tokio::time::timeout(std::time::Duration::from_millis(20), pool.checkout("a:80")).await;
        assert!(blocked.is_err());
        assert!(Arc::ptr_eq(&pool, &manager.http_pool()));
    }

    #[tokio::test]
    async fn waiting_is_zero_for_unbuilt_pool() {
        let manager = ConnectionPoolManager::new(PoolConfig::default(), true);
        assert_eq!(manager.waiting_requests_for_host("https:", "a:443"), 0);
        assert!(manager.pool_metrics().https.is_none());
    }
}
