//! HTTP forwarding.
//!
//! # Responsibilities
//! - Validate method and target scheme
//! - Admission control on the pool's per-host queue
//! - Run the interceptor chain on request and response
//! - Assemble outbound headers and query
//! - Dispatch with bounded retry on connection reset
//! - Stream the upstream body back through response transforms
//!
//! # Design Decisions
//! - Every failure is mapped to a status here; `forward` never returns `Err`
//! - A request body is replayed only if it was buffered within the limit
//! - Socket timeout starts once a pool slot is held and covers connect and
//!   response headers as one deadline; time queued for a slot is bounded by
//!   admission control instead

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::{HeaderMap, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, UPGRADE};
use axum::http::{request, Method, Request, Response, Uri};
use bytes::Bytes;
use hyper::body::Body as HttpBody;
use url::Url;

use crate::config::ProxyConfig;
use crate::error::{AdmissionLimit, ProxyError, Result};
use crate::http::request::{request_id, ClientInfo};
use crate::http::response::error_response;
use crate::interceptor::chain::ChainOutcome;
use crate::interceptor::transform::{transform_body, transform_bytes};
use crate::interceptor::{BodyTransform, InterceptorChain, InterceptorRegistry, QueryParams};
use crate::observability::metrics::{
    target_key, EngineMetricsSnapshot, RequestMetrics, WsConnectionMetrics,
};
use crate::pool::{ConnectionPoolManager, PoolLease, PooledAgent};
use crate::proxy::body::{watch_client_body, AbortFlag, ForwardGuard, UpstreamBody};
use crate::resilience::retries::{classify_upstream_error, RetryPolicy};
use crate::resilience::timeouts::with_socket_timeout;
use crate::security::headers::{append_forwarded_headers, strip_hop_by_hop_headers, HeaderFilter};

/// The forwarding engine. One per process, shared by all requests.
pub struct ProxyEngine {
    pub(crate) methods: Vec<Method>,
    pub(crate) header_filter: HeaderFilter,
    pub(crate) socket_timeout: Duration,
    pub(crate) create_forwarded_for_headers: bool,
    pub(crate) max_waiting_requests_per_host: Option<usize>,
    pub(crate) retry: RetryPolicy,
    pub(crate) retry_buffer_limit: usize,
    pub(crate) ws_max_connections_total: usize,
    pub(crate) ws_max_connections_per_host: Option<usize>,
    pub(crate) pools: Arc<ConnectionPoolManager>,
    pub(crate) chain: InterceptorChain,
    pub(crate) metrics: Arc<RequestMetrics>,
    pub(crate) ws_metrics: Arc<WsConnectionMetrics>,
}

/// Request body for one or more upstream attempts.
enum OutboundBody {
    Buffered(Bytes),
    Streaming(Option<Body>),
}

impl OutboundBody {
    fn next(&mut self) -> Body {
        match self {
            OutboundBody::Buffered(bytes) => Body::from(bytes.clone()),
            OutboundBody::Streaming(body) => body.take().unwrap_or_else(Body::empty),
        }
    }
}

impl ProxyEngine {
    pub fn new(
        config: &ProxyConfig,
        pools: Arc<ConnectionPoolManager>,
        registry: Arc<InterceptorRegistry>,
    ) -> Self {
        let forward = &config.proxy;
        let methods = forward
            .forward_methods
            .iter()
            .filter_map(|m| match Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes()) {
                Ok(method) => Some(method),
                Err(_) => {
                    tracing::warn!(method = %m, "Ignoring invalid forward method");
                    None
                }
            })
            .collect();

        Self {
            methods,
            header_filter: HeaderFilter::new(&forward.forward_headers),
            socket_timeout: Duration::from_millis(forward.socket_timeout_ms),
            create_forwarded_for_headers: forward.create_forwarded_for_headers,
            max_waiting_requests_per_host: forward.max_waiting_requests_per_host,
            retry: RetryPolicy::from_config(forward),
            retry_buffer_limit: forward.retry_buffer_limit_bytes,
            ws_max_connections_total: config.websocket.max_connections_total,
            ws_max_connections_per_host: config.websocket.max_connections_per_host,
            pools,
            chain: InterceptorChain::new(registry),
            metrics: Arc::new(RequestMetrics::default()),
            ws_metrics: Arc::new(WsConnectionMetrics::default()),
        }
    }

    pub fn request_metrics(&self) -> &RequestMetrics {
        &self.metrics
    }

    pub fn ws_connection_metrics(&self) -> &WsConnectionMetrics {
        &self.ws_metrics
    }

    pub fn pools(&self) -> &Arc<ConnectionPoolManager> {
        &self.pools
    }

    pub fn registry(&self) -> &Arc<InterceptorRegistry> {
        self.chain.registry()
    }

    pub fn metrics_snapshot(&self) -> EngineMetricsSnapshot {
        EngineMetricsSnapshot {
            requests: self.metrics.snapshot(),
            ws_connections: self.ws_metrics.snapshot(),
            pools: self.pools.pool_metrics(),
        }
    }

    /// Forward an HTTP request to `target`.
    ///
    /// Always produces a response: upstream failures are mapped to a status.
    /// The returned body streams the upstream body.
    pub async fn forward(
        &self,
        request: Request<Body>,
        target: Url,
        additional_headers: Option<&HeaderMap>,
    ) -> Response<Body> {
        if !self.methods.contains(request.method()) {
            tracing::debug!(method = %request.method(), "Method not forwarded");
            return error_response(&ProxyError::MethodNotAllowed(request.method().to_string()));
        }

        let (parts, body) = request.into_parts();
        let client = ClientInfo::from_parts(&parts);
        let existing_headers = merge_headers(&parts.headers, additional_headers);
        let existing_query = parse_query(parts.uri.query());

        let ctx = match self
            .chain
            .process_http_request(&parts, &client, &target, &existing_headers, &existing_query)
            .await
        {
            ChainOutcome::Handled(response) => return response,
            ChainOutcome::Forward(ctx) => ctx,
        };

        let target = ctx.target_uri.clone().unwrap_or(target);
        let key = target_key(&target);
        let guard = ForwardGuard::new(&key);

        let response = match self.admit_http(&target) {
            Err(err) => self.fail(&parts, &key, err),
            Ok((pool, host)) => {
                self.metrics.http_requests.increment(&key);

                let mut headers = self.outbound_headers(&parts.headers, additional_headers);
                ctx.headers.apply(&mut headers);
                self.finish_outbound_headers(&mut headers, &parts, &client);
                if !ctx.stream_transformers.is_empty() {
                    headers.remove(CONTENT_LENGTH);
                }

                let mut outbound = target.clone();
                append_query(&mut outbound, &ctx.apply_query(&existing_query));

                match self
                    .dispatch(
                        &parts,
                        &pool,
                        &host,
                        &key,
                        &outbound,
                        headers,
                        body,
                        ctx.stream_transformers,
                    )
                    .await
                {
                    Ok((upstream, lease)) => {
                        self.respond(&parts, &target, &key, upstream, lease).await
                    }
                    Err(err) => self.fail(&parts, &key, err),
                }
            }
        };

        guard.complete();
        response
    }

    /// Scheme check and admission control.
    fn admit_http(&self, target: &Url) -> Result<(Arc<PooledAgent>, String)> {
        let scheme = target.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(ProxyError::ProtocolUnsupported {
                protocol: scheme.to_string(),
                websocket: false,
            });
        }
        let host = pool_host(target)?;

        if let Some(limit) = self.max_waiting_requests_per_host {
            let waiting = self.pools.waiting_requests_for_host(scheme, &host);
            if waiting >= limit {
                tracing::warn!(
                    host = %host,
                    waiting = waiting,
                    limit = limit,
                    "Too many waiting requests for host"
                );
                return Err(ProxyError::AdmissionRejected {
                    host,
                    limit: AdmissionLimit::WaitingRequests,
                });
            }
        }

        let pool = self
            .pools
            .pool_for(scheme)
            .ok_or_else(|| ProxyError::InvalidTarget(target.to_string()))?;
        Ok((pool, host))
    }

    /// Allow-listed client headers with the caller's headers set on top.
    /// Caller headers are trusted and skip the allow-list.
    pub(crate) fn outbound_headers(
        &self,
        client: &HeaderMap,
        additional: Option<&HeaderMap>,
    ) -> HeaderMap {
        merge_headers(&self.header_filter.filter(client), additional)
    }

    /// Strip per-hop and host headers; add forwarded-for headers if enabled.
    pub(crate) fn finish_outbound_headers(
        &self,
        headers: &mut HeaderMap,
        parts: &request::Parts,
        client: &ClientInfo,
    ) {
        strip_hop_by_hop_headers(headers);
        headers.remove(HOST);
        if self.create_forwarded_for_headers {
            append_forwarded_headers(headers, &parts.headers, client);
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        parts: &request::Parts,
        pool: &PooledAgent,
        host: &str,
        key: &str,
        outbound: &Url,
        headers: HeaderMap,
        body: Body,
        mut transforms: Vec<Box<dyn BodyTransform>>,
    ) -> Result<(Response<Body>, PoolLease)> {
        let uri: Uri = outbound
            .as_str()
            .parse()
            .map_err(|_| ProxyError::InvalidTarget(outbound.to_string()))?;

        let aborted = AbortFlag::default();
        let (mut body, policy) = self
            .prepare_body(body, &mut transforms, aborted.clone())
            .await?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut request = Request::new(body.next());
            *request.method_mut() = parts.method.clone();
            *request.uri_mut() = uri.clone();
            *request.headers_mut() = headers.clone();

            let result = match pool.checkout(host).await {
                Ok(lease) => with_socket_timeout(self.socket_timeout, key, async {
                    let response = pool
                        .request(request)
                        .await
                        .map_err(|e| classify_upstream_error(&e))?;
                    Ok((response.map(Body::new), lease))
                })
                .await,
                Err(err) => Err(err),
            };

            match result {
                Ok(ok) => return Ok(ok),
                Err(_) if aborted.is_set() => {
                    return Err(ProxyError::ClientAbort(
                        "client request body failed".to_string(),
                    ))
                }
                Err(err) if policy.should_retry(&err, attempt) => {
                    tracing::warn!(
                        target_uri = %key,
                        request_id = %request_id(&parts.headers),
                        attempt = attempt,
                        error = %err,
                        "Upstream connection reset, retrying"
                    );
                }
                Err(err) => return Err(err.into_exhausted()),
            }
        }
    }

    /// Buffer the body when it may need replaying; otherwise stream it.
    async fn prepare_body(
        &self,
        body: Body,
        transforms: &mut Vec<Box<dyn BodyTransform>>,
        aborted: AbortFlag,
    ) -> Result<(OutboundBody, RetryPolicy)> {
        let replayable = self.retry.enabled
            && HttpBody::size_hint(&body)
                .upper()
                .is_some_and(|n| n <= self.retry_buffer_limit as u64);

        if !replayable {
            let body = watch_client_body(body, aborted);
            let body = transform_body(body, std::mem::take(transforms));
            return Ok((OutboundBody::Streaming(Some(body)), RetryPolicy::disabled()));
        }

        let bytes = axum::body::to_bytes(body, self.retry_buffer_limit)
            .await
            .map_err(|e| ProxyError::ClientAbort(e.to_string()))?;
        let bytes = if transforms.is_empty() {
            bytes
        } else {
            transform_bytes(transforms, bytes).map_err(|e| ProxyError::InterceptorFailure {
                name: "request body transform".to_string(),
                message: e.to_string(),
            })?
        };
        Ok((OutboundBody::Buffered(bytes), self.retry))
    }

    /// Run response interceptors and build the client response.
    async fn respond(
        &self,
        parts: &request::Parts,
        target: &Url,
        key: &str,
        upstream: Response<Body>,
        mut lease: PoolLease,
    ) -> Response<Body> {
        let (upstream_parts, upstream_body) = upstream.into_parts();

        let ctx = match self
            .chain
            .process_http_response(parts, target, &upstream_parts)
            .await
        {
            ChainOutcome::Handled(response) => {
                lease.detach();
                return response;
            }
            ChainOutcome::Forward(ctx) => ctx,
        };

        let mut headers = self.header_filter.filter(&upstream_parts.headers);
        ctx.headers.apply(&mut headers);
        strip_hop_by_hop_headers(&mut headers);
        if !ctx.stream_transformers.is_empty() {
            headers.remove(CONTENT_LENGTH);
        }

        let body = UpstreamBody::new(
            upstream_body,
            lease,
            self.socket_timeout,
            key.to_string(),
            self.metrics.clone(),
        )
        .into_body();

        let mut response = Response::new(transform_body(body, ctx.stream_transformers));
        *response.status_mut() = upstream_parts.status;
        *response.headers_mut() = headers;
        response
    }

    /// Record and map a failure.
    fn fail(&self, parts: &request::Parts, key: &str, err: ProxyError) -> Response<Body> {
        let request_id = request_id(&parts.headers);
        match &err {
            ProxyError::ClientAbort(reason) => {
                tracing::info!(target_uri = %key, request_id = %request_id, reason = %reason, "Client aborted request");
            }
            ProxyError::UpstreamTimeout(_) => {
                self.metrics.http_timeouts.increment(key);
                tracing::error!(target_uri = %key, request_id = %request_id, error = %err, "Upstream timed out");
            }
            e if e.is_connection_error() => {
                self.metrics.http_connection_errors.increment(key);
                tracing::error!(target_uri = %key, request_id = %request_id, error = %err, "Forwarding failed");
            }
            ProxyError::AdmissionRejected { .. } => {}
            _ => {
                tracing::error!(target_uri = %key, request_id = %request_id, error = %err, "Forwarding failed");
            }
        }
        error_response(&err)
    }
}

/// Client headers with `additional` applied on top.
pub(crate) fn merge_headers(client: &HeaderMap, additional: Option<&HeaderMap>) -> HeaderMap {
    let mut headers = client.clone();
    if let Some(additional) = additional {
        for name in additional.keys() {
            headers.remove(name);
        }
        for (name, value) in additional.iter() {
            headers.append(name.clone(), value.clone());
        }
    }
    headers
}

pub(crate) fn parse_query(query: Option<&str>) -> QueryParams {
    query
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

/// Append `params` to whatever query `url` already has.
pub(crate) fn append_query(url: &mut Url, params: &[(String, String)]) {
    if params.is_empty() {
        return;
    }
    url.query_pairs_mut().extend_pairs(params);
}

/// Pool key for a target: `host:port`, port defaulted from the scheme.
pub(crate) fn pool_host(target: &Url) -> Result<String> {
    let host = target
        .host_str()
        .ok_or_else(|| ProxyError::InvalidTarget(target.to_string()))?;
    let port = target
        .port_or_known_default()
        .ok_or_else(|| ProxyError::InvalidTarget(target.to_string()))?;
    Ok(format!("{host}:{port}"))
}

/// Set the upgrade headers for a WebSocket handshake.
pub(crate) fn set_upgrade_headers(headers: &mut HeaderMap) {
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
}
