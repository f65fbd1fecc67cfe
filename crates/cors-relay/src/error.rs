//! Request-scoped error type and its mapping onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Everything that can end a relayed request before the response streams.
///
/// All variants are terminal for the request; nothing is retried.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The path after the leading slash is not an absolute URL.
    #[error("malformed target url: {0}")]
    MalformedTarget(#[from] url::ParseError),

    /// The target parsed but is not `http` or `https`.
    #[error("unsupported target scheme `{0}`, expected http or https")]
    UnsupportedScheme(String),

    /// The inbound body could not be read (client abort or size limit).
    #[error("failed to read request body: {0}")]
    RequestBody(#[source] axum::Error),

    /// The outbound request failed before any response headers arrived.
    #[error("upstream request failed: {0}")]
    Dispatch(#[from] reqwest::Error),

    #[error("failed to build response: {0}")]
    ResponseBuild(#[from] axum::http::Error),
}

impl ProxyError {
    /// Caller mistakes are 400, transport failures 502 (504 on timeout).
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::MalformedTarget(_)
            | ProxyError::UnsupportedScheme(_)
            | ProxyError::RequestBody(_) => StatusCode::BAD_REQUEST,
            ProxyError::Dispatch(e) if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Dispatch(_) => StatusCode::BAD_GATEWAY,
            ProxyError::ResponseBuild(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "Relay request failed");
        } else {
            tracing::warn!(error = %self, status = status.as_u16(), "Rejected relay request");
        }
        (status, format!("proxy error: {self}")).into_response()
    }
}
