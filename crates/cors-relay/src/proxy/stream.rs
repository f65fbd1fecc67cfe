//! Response relay: copy upstream headers, add CORS, stream the body through.
//!
//! The body is never buffered; each upstream chunk is handed to hyper as it
//! arrives. A `RelayBody` wrapper records timing and byte counts on the
//! request span and logs interrupted streams.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::http::header::{HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_ENCODING};
use axum::response::Response;
use bytes::Bytes;
use futures_core::Stream;

use super::is_hop_by_hop;
use crate::error::ProxyError;

type UpstreamStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// Pass-through body stream that reports on the request span.
///
/// Records on `span`:
/// - `ttfb_ms`: from `start` to the first upstream chunk
/// - `total_duration_ms`: from `start` to the end of the body
/// - `bytes_relayed`: total bytes handed to the caller
///
/// Dropping it before the end (caller disconnected) drops the upstream
/// stream with it, which aborts the upstream read.
struct RelayBody {
    inner: UpstreamStream,
    span: tracing::Span,
    start: Instant,
    bytes_relayed: u64,
    first_chunk_seen: bool,
    finished: bool,
}

impl RelayBody {
    fn new(inner: UpstreamStream, span: tracing::Span, start: Instant) -> Self {
        Self {
            inner,
            span,
            start,
            bytes_relayed: 0,
            first_chunk_seen: false,
            finished: false,
        }
    }
}

impl Stream for RelayBody {
    type Item = Result<Bytes, reqwest::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if !self.first_chunk_seen {
                    self.first_chunk_seen = true;
                    self.span
                        .record("ttfb_ms", self.start.elapsed().as_millis() as u64);
                }
                self.bytes_relayed += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                // Headers are already out; the only option left is to end
                // the caller's body with an error so the connection closes.
                self.finished = true;
                self.span.record("bytes_relayed", self.bytes_relayed);
                tracing::warn!(
                    parent: &self.span,
                    error = %e,
                    bytes_relayed = self.bytes_relayed,
                    "Upstream body interrupted mid-stream"
                );
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.finished = true;
                self.span
                    .record("total_duration_ms", self.start.elapsed().as_millis() as u64);
                self.span.record("bytes_relayed", self.bytes_relayed);
                tracing::debug!(
                    parent: &self.span,
                    bytes_relayed = self.bytes_relayed,
                    "Upstream body complete"
                );
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RelayBody {
    fn drop(&mut self) {
        if !self.finished {
            self.span.record("bytes_relayed", self.bytes_relayed);
            tracing::debug!(
                parent: &self.span,
                bytes_relayed = self.bytes_relayed,
                "Caller went away before the body finished, dropping upstream stream"
            );
        }
    }
}

/// Turn a non-redirect upstream response into the caller's response.
///
/// Every upstream header is copied except `content-encoding` (the client has
/// already decoded the body) and hop-by-hop headers. `Access-Control-Allow-Origin: *`
/// replaces whatever the upstream sent.
pub fn relay(
    upstream: reqwest::Response,
    span: tracing::Span,
    start: Instant,
) -> Result<Response, ProxyError> {
    let mut response_builder = Response::builder().status(upstream.status());

    if let Some(headers) = response_builder.headers_mut() {
        for (name, value) in upstream.headers().iter() {
            if name == CONTENT_ENCODING || is_hop_by_hop(name) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    }

    let body = RelayBody::new(Box::pin(upstream.bytes_stream()), span, start);
    Ok(response_builder.body(Body::from_stream(body))?)
}
