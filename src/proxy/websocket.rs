//! WebSocket forwarding.
//!
//! # Responsibilities
//! - Run the WebSocket interceptor chain on the handshake
//! - Enforce total and per-host tunnel limits before connecting upstream
//! - Relay the upstream `101` and tunnel bytes both ways
//!
//! # Design Decisions
//! - Handshake headers are the only thing interceptors can change
//! - A tunnel slot is reserved at admission and released on handshake
//!   failure or when both directions end, so concurrent handshakes cannot
//!   overshoot the limits
//! - Resets and broken pipes on close are a normal premature close

use std::io;
use std::sync::Arc;

use axum::body::Body;
use axum::http::header::HeaderMap;
use axum::http::{Request, Response, StatusCode, Uri};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use url::Url;
use uuid::Uuid;

use crate::error::{AdmissionLimit, ProxyError, Result};
use crate::http::request::{request_id, upgrade_protocol, ClientInfo};
use crate::http::response::error_response;
use crate::interceptor::chain::ChainOutcome;
use crate::observability::metrics::{target_key, RequestMetrics, WsConnectionMetrics};
use crate::proxy::engine::{merge_headers, parse_query, pool_host, append_query, set_upgrade_headers, ProxyEngine};
use crate::resilience::retries::classify_upstream_error;
use crate::resilience::timeouts::with_socket_timeout;

/// Keeps one tunnel slot counted while alive.
struct WsConnectionGuard {
    metrics: Arc<WsConnectionMetrics>,
    target: String,
}

impl WsConnectionGuard {
    fn reserve(metrics: Arc<WsConnectionMetrics>, target: String) -> Self {
        metrics.increment(&target);
        Self { metrics, target }
    }
}

impl Drop for WsConnectionGuard {
    fn drop(&mut self) {
        self.metrics.decrement(&self.target);
        tracing::debug!(target_uri = %self.target, "WebSocket slot released");
    }
}

impl ProxyEngine {
    /// Forward a WebSocket upgrade to `target` (`ws` or `wss`).
    ///
    /// Additional headers apply to the handshake only.
    pub async fn forward_ws(
        &self,
        mut request: Request<Body>,
        target: Url,
        additional_headers: Option<&HeaderMap>,
    ) -> Response<Body> {
        match upgrade_protocol(request.headers()).as_deref() {
            Some("websocket") => {}
            other => {
                let protocol = other.unwrap_or_default().to_string();
                tracing::debug!(protocol = %protocol, "Rejecting unsupported upgrade");
                return error_response(&ProxyError::ProtocolUnsupported {
                    protocol,
                    websocket: true,
                });
            }
        }

        let client_upgrade = hyper::upgrade::on(&mut request);
        let (parts, _body) = request.into_parts();
        let client = ClientInfo::from_parts(&parts);
        let existing_headers = merge_headers(&parts.headers, additional_headers);

        let ctx = match self
            .chain
            .process_ws_request(&parts, &client, &target, &existing_headers)
            .await
        {
            ChainOutcome::Handled(response) => return response,
            ChainOutcome::Forward(ctx) => ctx,
        };

        let target = ctx.target_uri.clone().unwrap_or(target);
        let key = target_key(&target);

        let guard = match self.admit_ws(&target, &key) {
            Ok(guard) => guard,
            Err(err) => {
                tracing::warn!(target_uri = %key, error = %err, "WebSocket connection rejected");
                return error_response(&err);
            }
        };
        self.metrics.ws_requests.increment(&key);

        let mut headers = self.outbound_headers(&parts.headers, additional_headers);
        ctx.headers.apply(&mut headers);
        self.finish_outbound_headers(&mut headers, &parts, &client);
        set_upgrade_headers(&mut headers);

        let result = self
            .handshake(&target, &key, headers, parts.uri.query())
            .await;

        let upstream = match result {
            Ok(upstream) => upstream,
            Err(err) => {
                self.metrics.ws_connection_errors.increment(&key);
                tracing::error!(
                    target_uri = %key,
                    request_id = %request_id(&parts.headers),
                    error = %err,
                    "WebSocket handshake failed"
                );
                return error_response(&err);
            }
        };

        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        *response.headers_mut() = upstream.headers().clone();

        let upstream_upgrade = hyper::upgrade::on(upstream);
        let metrics = self.metrics.clone();
        let tunnel_id = Uuid::new_v4();
        tracing::info!(
            target_uri = %key,
            request_id = %request_id(&parts.headers),
            tunnel_id = %tunnel_id,
            "WebSocket upgraded"
        );
        tokio::spawn(async move {
            let _guard = guard;
            run_tunnel(client_upgrade, upstream_upgrade, &key, tunnel_id, &metrics).await;
        });

        response
    }

    /// Scheme check, then reserve a tunnel slot within both limits.
    ///
    /// The slot is counted before the limits are compared, so two racing
    /// handshakes for the last slot both see it taken.
    fn admit_ws(&self, target: &Url, key: &str) -> Result<WsConnectionGuard> {
        let scheme = target.scheme();
        if scheme != "ws" && scheme != "wss" {
            return Err(ProxyError::ProtocolUnsupported {
                protocol: scheme.to_string(),
                websocket: true,
            });
        }

        let guard = WsConnectionGuard::reserve(self.ws_metrics.clone(), key.to_string());

        if self.ws_metrics.active_total() > self.ws_max_connections_total {
            return Err(ProxyError::AdmissionRejected {
                host: key.to_string(),
                limit: AdmissionLimit::WsConnectionsTotal,
            });
        }

        if let Some(limit) = self.ws_max_connections_per_host {
            let authority = key.split_once("://").map(|(_, a)| a).unwrap_or(key);
            if self.ws_metrics.active_for_host(authority) > limit {
                return Err(ProxyError::AdmissionRejected {
                    host: authority.to_string(),
                    limit: AdmissionLimit::WsConnectionsPerHost,
                });
            }
        }
        Ok(guard)
    }

    /// Issue the upgrade GET and wait for the upstream `101`.
    async fn handshake(
        &self,
        target: &Url,
        key: &str,
        headers: HeaderMap,
        client_query: Option<&str>,
    ) -> Result<Response<hyper::body::Incoming>> {
        let mut outbound = target.clone();
        let http_scheme = if target.scheme() == "wss" { "https" } else { "http" };
        outbound
            .set_scheme(http_scheme)
            .map_err(|_| ProxyError::InvalidTarget(target.to_string()))?;
        append_query(&mut outbound, &parse_query(client_query));

        let uri: Uri = outbound
            .as_str()
            .parse()
            .map_err(|_| ProxyError::InvalidTarget(outbound.to_string()))?;
        let host = pool_host(&outbound)?;
        let pool = self
            .pools
            .pool_for(http_scheme)
            .ok_or_else(|| ProxyError::InvalidTarget(target.to_string()))?;

        let mut request = Request::new(Body::empty());
        *request.uri_mut() = uri;
        *request.headers_mut() = headers;

        let mut lease = pool.checkout(&host).await?;
        let response = with_socket_timeout(self.socket_timeout, key, async {
            pool.request(request)
                .await
                .map_err(|e| classify_upstream_error(&e))
        })
        .await?;
        // An upgraded socket never goes back to the pool.
        lease.detach();
        drop(lease);

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            return Ok(response);
        }

        let status = response.status();
        let body = drain_for_diagnostics(response.into_body(), self.socket_timeout).await;
        tracing::warn!(
            target_uri = %key,
            status = %status,
            body = %body,
            "Upstream did not upgrade"
        );
        Err(ProxyError::UpstreamConnectionFailure {
            message: format!("upstream answered {status} instead of 101"),
            refused: false,
        })
    }
}

/// Read up to a few KiB of a rejected handshake body for the log.
async fn drain_for_diagnostics(body: hyper::body::Incoming, timeout: std::time::Duration) -> String {
    const LIMIT: usize = 4096;
    let read = tokio::time::timeout(timeout, axum::body::to_bytes(Body::new(body), LIMIT)).await;
    match read {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(_)) => "<unreadable or oversized body>".to_string(),
        Err(_) => "<body timed out>".to_string(),
    }
}

async fn run_tunnel(
    client_upgrade: OnUpgrade,
    upstream_upgrade: OnUpgrade,
    key: &str,
    tunnel_id: Uuid,
    metrics: &RequestMetrics,
) {
    let (client, upstream) = match tokio::try_join!(client_upgrade, upstream_upgrade) {
        Ok(pair) => pair,
        Err(e) => {
            metrics.ws_connection_errors.increment(key);
            tracing::error!(target_uri = %key, tunnel_id = %tunnel_id, error = %e, "WebSocket upgrade failed");
            return;
        }
    };

    let (sent, received) = tunnel(TokioIo::new(client), TokioIo::new(upstream)).await;
    let mut failed = false;
    for result in [&sent, &received] {
        if let Err(e) = result {
            if is_premature_close(e) {
                tracing::debug!(target_uri = %key, tunnel_id = %tunnel_id, error = %e, "WebSocket closed prematurely");
            } else {
                failed = true;
                tracing::error!(target_uri = %key, tunnel_id = %tunnel_id, error = %e, "WebSocket tunnel failed");
            }
        }
    }
    if failed {
        metrics.ws_connection_errors.increment(key);
    }
    tracing::debug!(
        target_uri = %key,
        tunnel_id = %tunnel_id,
        bytes_sent = sent.as_ref().copied().unwrap_or(0),
        bytes_received = received.as_ref().copied().unwrap_or(0),
        "WebSocket tunnel finished"
    );
}

/// Copy both directions until each ends; the finishing side shuts down
/// the other side's write half.
pub async fn tunnel<C, S>(client: C, upstream: S) -> (io::Result<u64>, io::Result<u64>)
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let client_to_upstream = async {
        let result = tokio::io::copy(&mut client_read, &mut upstream_write).await;
        let _ = upstream_write.shutdown().await;
        result
    };

    let upstream_to_client = async {
        let result = tokio::io::copy(&mut upstream_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        result
    };

    tokio::join!(client_to_upstream, upstream_to_client)
}

fn is_premature_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}
