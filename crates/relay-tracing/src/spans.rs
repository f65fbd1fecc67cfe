//! Span builder helpers for cors-relay instrumentation.

/// Create the top-level span for one relayed request.
///
/// Usage: `let span = relay_request_span!(request_id, method, target);`
///
/// Fields recorded later by the response streamer:
/// - `ttfb_ms`: milliseconds from dispatch to the first upstream body chunk
/// - `total_duration_ms`: milliseconds from dispatch to the end of the body
/// - `bytes_relayed`: body bytes written to the caller
#[macro_export]
macro_rules! relay_request_span {
    ($request_id:expr, $method:expr, $target:expr) => {
        tracing::info_span!(
            "relay_request",
            request_id = %$request_id,
            method = %$method,
            target = %$target,
            ttfb_ms = tracing::field::Empty,
            total_duration_ms = tracing::field::Empty,
            bytes_relayed = tracing::field::Empty,
        )
    };
}

/// Create a span for the outbound leg to the target.
#[macro_export]
macro_rules! upstream_forward_span {
    ($request_id:expr, $target:expr) => {
        tracing::info_span!(
            "upstream_forward",
            request_id = %$request_id,
            target = %$target,
            status = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    };
}
