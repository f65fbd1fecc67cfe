//! The forwarding path: dispatch, redirect rewrite, and response streaming.

pub mod dispatch;
pub mod redirect;
pub mod request_id;
pub mod stream;

use axum::http::HeaderName;

/// Headers scoped to a single transport leg; never forwarded either way.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
];

pub(crate) fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}
