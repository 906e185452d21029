//! Body wrappers for forwarded exchanges.
//!
//! # Responsibilities
//! - Notice a client that stops sending its request body
//! - Stream the upstream response body under the inactivity timeout
//! - Hold the pool lease until the upstream body is done
//! - Log a client abort when the response body is dropped early

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::{Body, BodyDataStream};
use axum::BoxError;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::time::{Instant, Sleep};

use crate::observability::metrics::RequestMetrics;
use crate::pool::PoolLease;
use crate::resilience::retries::{classify_upstream_error, error_chain};

/// Set once the client request body failed.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Wrap a client body so a read failure marks `flag`.
pub fn watch_client_body(body: Body, flag: AbortFlag) -> Body {
    Body::from_stream(ClientBodyWatch {
        inner: body.into_data_stream(),
        flag,
    })
}

struct ClientBodyWatch {
    inner: BodyDataStream,
    flag: AbortFlag,
}

impl Stream for ClientBodyWatch {
    type Item = Result<Bytes, axum::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let item = self.inner.poll_next_unpin(cx);
        if let Poll::Ready(Some(Err(_))) = &item {
            self.flag.set();
        }
        item
    }
}

/// Upstream response body with inactivity timeout and lease.
pub struct UpstreamBody {
    inner: BodyDataStream,
    lease: Option<PoolLease>,
    idle_timeout: Duration,
    deadline: Pin<Box<Sleep>>,
    target: String,
    metrics: Arc<RequestMetrics>,
    finished: bool,
}

impl UpstreamBody {
    pub fn new(
        inner: Body,
        lease: PoolLease,
        idle_timeout: Duration,
        target: String,
        metrics: Arc<RequestMetrics>,
    ) -> Self {
        Self {
            inner: inner.into_data_stream(),
            lease: Some(lease),
            idle_timeout,
            deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            target,
            metrics,
            finished: false,
        }
    }

    pub fn into_body(self) -> Body {
        Body::from_stream(self)
    }

    fn fail(&mut self) {
        self.finished = true;
        if let Some(mut lease) = self.lease.take() {
            lease.detach();
        }
    }
}

impl Stream for UpstreamBody {
    type Item = Result<Bytes, BoxError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.finished {
            return Poll::Ready(None);
        }

        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                let next = Instant::now() + this.idle_timeout;
                this.deadline.as_mut().reset(next);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                let err = classify_upstream_error(&e);
                tracing::error!(
                    target_uri = %this.target,
                    error = %error_chain(&e),
                    "Upstream response body failed"
                );
                if err.is_timeout() {
                    this.metrics.http_timeouts.increment(&this.target);
                } else {
                    this.metrics.http_connection_errors.increment(&this.target);
                }
                this.fail();
                Poll::Ready(Some(Err(e.into())))
            }
            Poll::Ready(None) => {
                this.finished = true;
                this.lease.take();
                Poll::Ready(None)
            }
            Poll::Pending => {
                if this.deadline.as_mut().poll(cx).is_pending() {
                    return Poll::Pending;
                }
                tracing::error!(
                    target_uri = %this.target,
                    timeout_ms = this.idle_timeout.as_millis() as u64,
                    "Upstream response body timed out"
                );
                this.metrics.http_timeouts.increment(&this.target);
                this.fail();
                Poll::Ready(Some(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "upstream body inactivity timeout",
                )
                .into())))
            }
        }
    }
}

impl Drop for UpstreamBody {
    fn drop(&mut self) {
        if !self.finished {
            tracing::info!(target_uri = %self.target, "Client aborted before response completed");
            if let Some(lease) = self.lease.as_mut() {
                lease.detach();
            }
        }
    }
}

/// Logs a client abort if a forward is dropped before it returns.
pub struct ForwardGuard<'a> {
    target: &'a str,
    done: bool,
}

impl<'a> ForwardGuard<'a> {
    pub fn new(target: &'a str) -> Self {
        Self { target, done: false }
    }

    pub fn complete(mut self) {
        self.done = true;
    }
}

impl Drop for ForwardGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            tracing::info!(target_uri = %self.target, "Client aborted before response headers");
        }
    }
}
