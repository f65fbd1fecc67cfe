//! Redirect rewrite: point upstream redirects back through the relay.
//!
//! The relay never follows a redirect itself. A 301/302/307/308 goes back to
//! the caller with its `Location` re-wrapped as `/<absolute-url>`, so each
//! hop is a fresh request through the relay and the caller's client bounds
//! the chain. The rewritten redirect carries `Access-Control-Allow-Origin: *`
//! like every relayed response.

use axum::http::header::{HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, LOCATION};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use url::Url;

use crate::target::Target;

pub fn is_rewritten_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// Wrap a `Location` value as a relay path.
///
/// Absolute locations are kept byte-for-byte; relative ones are resolved
/// against the target first.
pub fn rewrite_location(location: &HeaderValue, target: &Target) -> Option<HeaderValue> {
    let raw = location.to_str().ok()?.trim();
    let absolute = match Url::parse(raw) {
        Ok(_) => raw.to_string(),
        Err(_) => target.url().join(raw).ok()?.to_string(),
    };
    HeaderValue::from_str(&format!("/{absolute}")).ok()
}

/// Build the caller-facing redirect for `upstream`, if it is one.
///
/// Returns `None` for non-redirect statuses and for redirects whose
/// `Location` is missing or unusable; those are relayed like any response.
pub fn intercept(upstream: &reqwest::Response, target: &Target) -> Option<Response> {
    let status = upstream.status();
    if !is_rewritten_redirect(status) {
        return None;
    }

    let Some(location) = upstream.headers().get(LOCATION) else {
        tracing::warn!(status = status.as_u16(), "Redirect without Location, relaying as-is");
        return None;
    };
    let Some(rewritten) = rewrite_location(location, target) else {
        tracing::warn!(
            status = status.as_u16(),
            location = ?location,
            "Unusable redirect Location, relaying as-is"
        );
        return None;
    };

    tracing::info!(
        status = status.as_u16(),
        location = ?location,
        rewritten = ?rewritten,
        "Rewrote upstream redirect"
    );

    let mut response = status.into_response();
    let headers = response.headers_mut();
    headers.insert(LOCATION, rewritten);
    // Browsers drop a CORS redirect that lacks this header.
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    Some(response)
}
