//! Outbound request construction and dispatch.
//!
//! The inbound method and policy-adjusted headers are replayed against the
//! target. Bodies of non-GET/HEAD requests are buffered in full first.

use std::time::Instant;

use axum::body::Body;
use axum::http::header::{ACCEPT_ENCODING, CONTENT_LENGTH};
use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use tracing::Instrument;

use super::is_hop_by_hop;
use crate::error::ProxyError;
use crate::target::Target;

/// GET and HEAD never carry a body upstream.
pub fn carries_body(method: &Method) -> bool {
    !matches!(*method, Method::GET | Method::HEAD)
}

/// Read the inbound body into memory when the method carries one.
///
/// Returns `None` for GET/HEAD without touching the body.
pub async fn read_body(method: &Method, body: Body, limit: usize) -> Result<Option<Bytes>, ProxyError> {
    if !carries_body(method) {
        return Ok(None);
    }
    axum::body::to_bytes(body, limit)
        .await
        .map(Some)
        .map_err(ProxyError::RequestBody)
}

/// Strip headers that only describe the inbound leg.
///
/// `accept-encoding` goes too: the client advertises its own set of
/// supported codings, and the relay only ever returns decoded bodies.
fn outbound_headers(headers: &HeaderMap, has_body: bool) -> HeaderMap {
    let mut outbound = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if is_hop_by_hop(name) || name == ACCEPT_ENCODING {
            continue;
        }
        if !has_body && name == CONTENT_LENGTH {
            continue;
        }
        outbound.append(name.clone(), value.clone());
    }
    outbound
}

/// Send the request to `target` and wait for the response headers.
///
/// The client must be built with redirects disabled; redirect statuses come
/// back to the caller as-is.
pub async fn dispatch(
    client: &reqwest::Client,
    method: Method,
    target: &Target,
    headers: &HeaderMap,
    body: Option<Bytes>,
    request_id: &str,
) -> Result<reqwest::Response, ProxyError> {
    let span = relay_tracing::upstream_forward_span!(request_id, target);
    let start = Instant::now();

    async {
        let mut req_builder = client
            .request(method, target.url().clone())
            .headers(outbound_headers(headers, body.is_some()));
        if let Some(body) = body {
            req_builder = req_builder.body(body);
        }

        let result = req_builder.send().await;

        let latency = start.elapsed().as_millis() as u64;
        tracing::Span::current().record("latency_ms", latency);

        match result {
            Ok(resp) => {
                tracing::Span::current().record("status", resp.status().as_u16());
                tracing::debug!(
                    status = resp.status().as_u16(),
                    latency_ms = latency,
                    "Upstream responded"
                );
                Ok(resp)
            }
            Err(e) => {
                if e.is_timeout() {
                    tracing::error!(error = %e, latency_ms = latency, "Upstream timeout");
                } else {
                    tracing::error!(error = %e, latency_ms = latency, "Upstream connection error");
                }
                Err(ProxyError::Dispatch(e))
            }
        }
    }
    .instrument(span)
    .await
}
