//! Body stream transformers.
//!
//! A transformer is a stage in the body pipe. Stages run in the order they
//! were accumulated; at end of stream each stage is flushed and its tail is
//! fed through the stages after it.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::BoxError;
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};

/// One stage of a body pipe.
pub trait BodyTransform: Send {
    /// Transform a chunk. Returning an empty `Bytes` emits nothing.
    fn transform(&mut self, chunk: Bytes) -> io::Result<Bytes>;

    /// Called once at end of stream; returns any buffered tail.
    fn finish(&mut self) -> io::Result<Option<Bytes>> {
        Ok(None)
    }
}

/// ASCII upper-casing. Mostly useful for demos and tests.
#[derive(Debug, Default)]
pub struct UppercaseTransform;

impl BodyTransform for UppercaseTransform {
    fn transform(&mut self, chunk: Bytes) -> io::Result<Bytes> {
        Ok(Bytes::from(chunk.to_ascii_uppercase()))
    }
}

/// Emits fixed bytes ahead of the first chunk (or at end of an empty body).
#[derive(Debug)]
pub struct PrefixTransform {
    prefix: Option<Bytes>,
}

impl PrefixTransform {
    pub fn new(prefix: impl Into<Bytes>) -> Self {
        Self {
            prefix: Some(prefix.into()),
        }
    }
}

impl BodyTransform for PrefixTransform {
    fn transform(&mut self, chunk: Bytes) -> io::Result<Bytes> {
        match self.prefix.take() {
            Some(prefix) => {
                let mut out = BytesMut::with_capacity(prefix.len() + chunk.len());
                out.extend_from_slice(&prefix);
                out.extend_from_slice(&chunk);
                Ok(out.freeze())
            }
            None => Ok(chunk),
        }
    }

    fn finish(&mut self) -> io::Result<Option<Bytes>> {
        Ok(self.prefix.take())
    }
}

/// Run a chunk through every stage.
fn run_stages(stages: &mut [Box<dyn BodyTransform>], chunk: Bytes) -> io::Result<Bytes> {
    let mut current = chunk;
    for stage in stages.iter_mut() {
        if current.is_empty() {
            break;
        }
        current = stage.transform(current)?;
    }
    Ok(current)
}

/// Flush every stage, passing each tail through the stages after it.
fn finish_stages(stages: &mut [Box<dyn BodyTransform>]) -> io::Result<Bytes> {
    let mut carry = Bytes::new();
    for i in 0..stages.len() {
        let mut out = BytesMut::new();
        if !carry.is_empty() {
            out.extend_from_slice(&stages[i].transform(carry)?);
        }
        if let Some(tail) = stages[i].finish()? {
            out.extend_from_slice(&tail);
        }
        carry = out.freeze();
    }
    Ok(carry)
}

/// Transform a fully buffered body.
pub fn transform_bytes(stages: &mut [Box<dyn BodyTransform>], body: Bytes) -> io::Result<Bytes> {
    let head = run_stages(stages, body)?;
    let tail = finish_stages(stages)?;
    if tail.is_empty() {
        return Ok(head);
    }
    let mut out = BytesMut::with_capacity(head.len() + tail.len());
    out.extend_from_slice(&head);
    out.extend_from_slice(&tail);
    Ok(out.freeze())
}

/// Pipe a body through the given stages. Returns the body untouched if there are none.
pub fn transform_body(body: Body, stages: Vec<Box<dyn BodyTransform>>) -> Body {
    if stages.is_empty() {
        return body;
    }
    Body::from_stream(TransformStream {
        inner: body.into_data_stream(),
        stages,
        done: false,
    })
}

struct TransformStream<S> {
    inner: S,
    stages: Vec<Box<dyn BodyTransform>>,
    done: bool,
}

impl<S, E> Stream for TransformStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Into<BoxError>,
{
    type Item = Result<Bytes, BoxError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            if this.done {
                return Poll::Ready(None);
            }
            match this.inner.poll_next_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(chunk))) => match run_stages(&mut this.stages, chunk) {
                    Ok(out) if out.is_empty() => continue,
                    Ok(out) => return Poll::Ready(Some(Ok(out))),
                    Err(e) => {
                        this.done = true;
                        return Poll::Ready(Some(Err(e.into())));
                    }
                },
                Poll::Ready(Some(Err(e))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(e.into())));
                }
                Poll::Ready(None) => {
                    this.done = true;
                    return match finish_stages(&mut this.stages) {
                        Ok(tail) if tail.is_empty() => Poll::Ready(None),
                        Ok(tail) => Poll::Ready(Some(Ok(tail))),
                        Err(e) => Poll::Ready(Some(Err(e.into()))),
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Buffers everything and emits it reversed on finish.
    struct Reverse(BytesMut);

    impl BodyTransform for Reverse {
        fn transform(&mut self, chunk: Bytes) -> io::Result<Bytes> {
            self.0.extend_from_slice(&chunk);
            Ok(Bytes::new())
        }

        fn finish(&mut self) -> io::Result<Option<Bytes>> {
            let mut all = self.0.split().to_vec();
            all.reverse();
            Ok(Some(Bytes::from(all)))
        }
    }

    #[test]
    fn stages_apply_in_order() {
        let mut stages: Vec<Box<dyn BodyTransform>> =
            vec![Box::new(PrefixTransform::new("x-")), Box::new(UppercaseTransform)];
        let out = transform_bytes(&mut stages, Bytes::from_static(b"hello")).unwrap();
        assert_eq!(out, Bytes::from_static(b"X-HELLO"));
    }

    #[test]
    fn finish_tail_flows_through_later_stages() {
        let mut stages: Vec<Box<dyn BodyTransform>> =
            vec![Box::new(Reverse(BytesMut::new())), Box::new(UppercaseTransform)];
        let out = transform_bytes(&mut stages, Bytes::from_static(b"abc")).unwrap();
        assert_eq!(out, Bytes::from_static(b"CBA"));
    }

    #[test]
    fn prefix_on_empty_body() {
        let mut stages: Vec<Box<dyn BodyTransform>> = vec![Box::new(PrefixTransform::new("p"))];
        let out = transform_bytes(&mut stages, Bytes::new()).unwrap();
        assert_eq!(out, Bytes::from_static(b"p"));
    }

    #[tokio::test]
    async fn streams_body_through_stages() {
        let chunks: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from_static(b"test ")),
            Ok(Bytes::from_static(b"response")),
        ];
        let body = Body::from_stream(futures_util::stream::iter(chunks));

        let transformed = transform_body(body, vec![Box::new(UppercaseTransform)]);
        let bytes = axum::body::to_bytes(transformed, usize::MAX).await.unwrap();
        assert_eq!(bytes, Bytes::from_static(b"TEST RESPONSE"));
    }
}
