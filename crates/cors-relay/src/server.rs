//! Axum HTTP server: router, relay handler, listener, graceful shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::config::RelayConfig;
use crate::error::ProxyError;
use crate::headers::HeaderRuleSet;
use crate::proxy::request_id::{self, REQUEST_ID_HEADER};
use crate::proxy::{dispatch, redirect, stream};
use crate::target::Target;

const INDEX_HTML: &str = include_str!("../assets/index.html");

/// Shared application state. Immutable after startup.
#[derive(Clone)]
pub struct AppState {
    pub config: RelayConfig,
    pub client: reqwest::Client,
    pub header_rules: HeaderRuleSet,
}

impl AppState {
    /// Compile the header rules and build the outbound client.
    pub fn from_config(config: RelayConfig) -> anyhow::Result<Self> {
        let header_rules = HeaderRuleSet::compile(&config.header_rules)?;

        // Redirects are rewritten for the caller, never followed here. The
        // read timeout is per read, so long downloads are not cut off.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(config.upstream.connect_timeout_secs))
            .read_timeout(Duration::from_secs(config.upstream.read_timeout_secs))
            .build()?;

        Ok(Self {
            config,
            client,
            header_rules,
        })
    }
}

/// Build the router: help page, favicon, health, and the relay fallback.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handle_index))
        .route("/favicon.ico", get(handle_favicon))
        .route("/health", get(handle_health))
        .fallback(handle_relay)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Build and run the HTTP server.
pub async fn run(state: AppState) -> anyhow::Result<()> {
    let listen_addr = state.config.server.listen_address.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "cors-relay listening");
    tracing::info!(
        "Usage example: http://{}/https://example.com/test.zip",
        listener.local_addr()?
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("cors-relay shut down gracefully");
    Ok(())
}

/// Catch-all handler: every path not routed above names a target URL.
///
/// 1. Resolve the target from the path and query
/// 2. Apply the header policy
/// 3. Buffer the body (non-GET/HEAD only)
/// 4. Dispatch, then either rewrite a redirect or stream the response back
async fn handle_relay(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let request_id = request_id::generate_id();

    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let response = match Target::resolve(&path_and_query) {
        Ok(target) => {
            let span = relay_tracing::relay_request_span!(&request_id, request.method(), &target);
            let root_span = span.clone();
            async {
                match forward(&state, request, target, &request_id, root_span).await {
                    Ok(response) => response,
                    Err(e) => e.into_response(),
                }
            }
            .instrument(span)
            .await
        }
        Err(e) => e.into_response(),
    };

    with_request_id(response, &request_id)
}

async fn forward(
    state: &AppState,
    request: Request,
    target: Target,
    request_id: &str,
    root_span: tracing::Span,
) -> Result<Response, ProxyError> {
    let (parts, body) = request.into_parts();

    let headers = state.header_rules.apply(&parts.headers, &target);
    let body = dispatch::read_body(
        &parts.method,
        body,
        state.config.upstream.max_request_body_bytes,
    )
    .await?;

    let start = Instant::now();
    let upstream = dispatch::dispatch(
        &state.client,
        parts.method,
        &target,
        &headers,
        body,
        request_id,
    )
    .await?;

    if let Some(redirect) = redirect::intercept(&upstream, &target) {
        return Ok(redirect);
    }

    // Pass the root span so RelayBody can record timing on it once the
    // body has been fully streamed.
    stream::relay(upstream, root_span, start)
}

fn with_request_id(mut response: Response, request_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// GET / — static usage page.
async fn handle_index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// GET /favicon.ico — answered here so browsers never trigger a relay.
async fn handle_favicon() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// Health check endpoint.
async fn handle_health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received, draining connections...");
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};

    use axum::body::Body;
    use axum::extract::Path;
    use axum::http::{HeaderMap, Method};
    use axum::routing::any;
    use bytes::Bytes;
    use futures_util::StreamExt;
    use tokio::sync::Notify;

    use super::*;

    const GZIPPED_HELLO: &[u8] = &[
        0x1f, 0x8b, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0xff, 0xcb, 0x48, 0xcd, 0xc9, 0xc9,
        0xd7, 0x51, 0x28, 0x4a, 0xcd, 0x49, 0xac, 0x04, 0x00, 0xc0, 0x81, 0xe6, 0x98, 0x0c, 0x00,
        0x00, 0x00,
    ];

    async fn spawn_server(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn spawn_relay(config: RelayConfig) -> SocketAddr {
        spawn_server(router(AppState::from_config(config).unwrap())).await
    }

    /// Caller-side client: sees redirects instead of following them.
    fn client() -> reqwest::Client {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap()
    }

    fn header<'a>(response: &'a reqwest::Response, name: &str) -> Option<&'a str> {
        response.headers().get(name).and_then(|v| v.to_str().ok())
    }

    /// Reports what it received in `x-seen-*` headers and echoes the body.
    async fn echo(method: Method, headers: HeaderMap, body: Bytes) -> Response {
        let seen = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("none")
                .to_string()
        };
        (
            [
                ("x-seen-method", method.to_string()),
                ("x-seen-host", seen("host")),
                ("x-seen-origin", seen("origin")),
                ("x-seen-referer", seen("referer")),
                ("x-seen-body-len", body.len().to_string()),
            ],
            body,
        )
            .into_response()
    }

    async fn spawn_echo_backend() -> SocketAddr {
        spawn_server(Router::new().route("/echo", any(echo))).await
    }

    #[tokio::test]
    async fn test_index_favicon_and_health() {
        let relay = spawn_relay(RelayConfig::default()).await;
        let client = client();

        let resp = client.get(format!("http://{relay}/")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(header(&resp, "content-type").unwrap().starts_with("text/html"));
        assert!(resp.text().await.unwrap().contains("cors-relay"));

        let resp = client
            .get(format!("http://{relay}/favicon.ico"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert!(resp.bytes().await.unwrap().is_empty());

        let resp = client.get(format!("http://{relay}/health")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.text().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_malformed_target_is_bad_request() {
        let relay = spawn_relay(RelayConfig::default()).await;
        let client = client();

        let resp = client
            .get(format!("http://{relay}/not-a-url"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(header(&resp, REQUEST_ID_HEADER).is_some());
        assert!(resp.text().await.unwrap().contains("malformed target url"));

        let resp = client
            .get(format!("http://{relay}/ftp://example.com/f"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(resp.text().await.unwrap().contains("unsupported target scheme"));
    }

    #[tokio::test]
    async fn test_default_policy_reaches_upstream() {
        let backend = spawn_echo_backend().await;
        let relay = spawn_relay(RelayConfig::default()).await;

        let resp = client()
            .get(format!("http://{relay}/http://{backend}/echo?x=1"))
            .header("origin", "https://app.example.com")
            .header("referer", "https://app.example.com/page")
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(header(&resp, "x-seen-origin"), Some("none"));
        assert_eq!(header(&resp, "x-seen-referer"), Some("none"));
        // Host is kept, so the backend sees the relay's own authority
        let relay_host = relay.to_string();
        assert_eq!(header(&resp, "x-seen-host"), Some(relay_host.as_str()));
        assert_eq!(header(&resp, "access-control-allow-origin"), Some("*"));
        assert!(header(&resp, REQUEST_ID_HEADER).is_some());
    }

    #[tokio::test]
    async fn test_deleted_host_replaced_by_target_authority() {
        let backend = spawn_echo_backend().await;
        let mut config = RelayConfig::default();
        config.header_rules = vec![crate::config::HeaderRuleConfig {
            pattern: ".*".to_string(),
            rules: [("host".to_string(), "DELETE".to_string())]
                .into_iter()
                .collect(),
        }];
        let relay = spawn_relay(config).await;

        let resp = client()
            .get(format!("http://{relay}/http://{backend}/echo"))
            .send()
            .await
            .unwrap();

        let backend_host = backend.to_string();
        assert_eq!(header(&resp, "x-seen-host"), Some(backend_host.as_str()));
    }

    #[tokio::test]
    async fn test_get_and_head_drop_inbound_body() {
        let backend = spawn_echo_backend().await;
        let relay = spawn_relay(RelayConfig::default()).await;
        let client = client();

        for method in [Method::GET, Method::HEAD] {
            let resp = client
                .request(method.clone(), format!("http://{relay}/http://{backend}/echo"))
                .body("ignored")
                .send()
                .await
                .unwrap();

            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(header(&resp, "x-seen-method"), Some(method.as_str()));
            assert_eq!(header(&resp, "x-seen-body-len"), Some("0"));
        }
    }

    #[tokio::test]
    async fn test_body_forwarded_byte_for_byte() {
        let backend = spawn_echo_backend().await;
        let relay = spawn_relay(RelayConfig::default()).await;
        let client = client();
        let payload: Vec<u8> = (0..=255u8).cycle().take(100_000).collect();

        for method in [Method::POST, Method::PUT, Method::PATCH, Method::DELETE] {
            let resp = client
                .request(method.clone(), format!("http://{relay}/http://{backend}/echo"))
                .body(payload.clone())
                .send()
                .await
                .unwrap();

            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(header(&resp, "x-seen-method"), Some(method.as_str()));
            assert_eq!(header(&resp, "x-seen-body-len"), Some("100000"));
            assert_eq!(resp.bytes().await.unwrap().as_ref(), payload.as_slice());
        }
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let backend = spawn_echo_backend().await;
        let mut config = RelayConfig::default();
        config.upstream.max_request_body_bytes = 16;
        let relay = spawn_relay(config).await;

        let resp = client()
            .post(format!("http://{relay}/http://{backend}/echo"))
            .body(vec![b'x'; 1024])
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(resp.text().await.unwrap().contains("failed to read request body"));
    }

    #[tokio::test]
    async fn test_redirects_are_rewritten_through_relay() {
        let backend = spawn_server(
            Router::new()
                .route(
                    "/moved/{code}",
                    get(|Path(code): Path<u16>| async move {
                        (
                            StatusCode::from_u16(code).unwrap(),
                            [("location", "https://new.example.com/x")],
                        )
                    }),
                )
                .route(
                    "/relative",
                    get(|| async { (StatusCode::FOUND, [("location", "/landing?from=old")]) }),
                ),
        )
        .await;
        let relay = spawn_relay(RelayConfig::default()).await;
        let client = client();

        for code in [301u16, 302, 307, 308] {
            let resp = client
                .get(format!("http://{relay}/http://{backend}/moved/{code}"))
                .send()
                .await
                .unwrap();

            assert_eq!(resp.status().as_u16(), code);
            assert_eq!(header(&resp, "location"), Some("/https://new.example.com/x"));
            assert_eq!(header(&resp, "access-control-allow-origin"), Some("*"));
        }

        let resp = client
            .get(format!("http://{relay}/http://{backend}/relative"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FOUND);
        let expected = format!("/http://{backend}/landing?from=old");
        assert_eq!(header(&resp, "location"), Some(expected.as_str()));

        // 303 is relayed untouched
        let resp = client
            .get(format!("http://{relay}/http://{backend}/moved/303"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(header(&resp, "location"), Some("https://new.example.com/x"));
        assert_eq!(header(&resp, "access-control-allow-origin"), Some("*"));
    }

    #[tokio::test]
    async fn test_gzip_body_decoded_and_encoding_header_dropped() {
        let backend = spawn_server(Router::new().route(
            "/gz",
            get(|| async {
                (
                    [
                        ("content-encoding", "gzip"),
                        ("content-type", "text/plain"),
                        ("access-control-allow-origin", "https://only.example.com"),
                    ],
                    Bytes::from_static(GZIPPED_HELLO),
                )
            }),
        ))
        .await;
        let relay = spawn_relay(RelayConfig::default()).await;

        let resp = client()
            .get(format!("http://{relay}/http://{backend}/gz"))
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().get("content-encoding").is_none());
        assert_eq!(header(&resp, "content-type"), Some("text/plain"));
        assert_eq!(header(&resp, "access-control-allow-origin"), Some("*"));
        assert_eq!(resp.text().await.unwrap(), "hello, relay");
    }

    #[tokio::test]
    async fn test_streams_chunks_before_upstream_finishes() {
        let release = Arc::new(Notify::new());
        let gate = release.clone();
        let backend = spawn_server(Router::new().route(
            "/slow",
            get(move || {
                let gate = gate.clone();
                async move {
                    let chunks = futures_util::stream::unfold(0u8, move |step| {
                        let gate = gate.clone();
                        async move {
                            match step {
                                0 => Some((Ok::<_, std::io::Error>(Bytes::from_static(b"first-")), 1)),
                                1 => {
                                    gate.notified().await;
                                    Some((Ok(Bytes::from_static(b"second")), 2))
                                }
                                _ => None,
                            }
                        }
                    });
                    Body::from_stream(chunks)
                }
            }),
        ))
        .await;
        let relay = spawn_relay(RelayConfig::default()).await;

        let mut resp = client()
            .get(format!("http://{relay}/http://{backend}/slow"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        // The backend is parked until `release` fires, so these bytes can
        // only arrive if the relay forwards chunks as they come.
        let mut received = Vec::new();
        while received.len() < b"first-".len() {
            let chunk = tokio::time::timeout(Duration::from_secs(5), resp.chunk())
                .await
                .expect("first chunk should arrive while the backend is stalled")
                .unwrap()
                .expect("stream ended early");
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, b"first-");

        release.notify_one();
        while let Some(chunk) = resp.chunk().await.unwrap() {
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, b"first-second");
    }

    #[tokio::test]
    async fn test_upstream_failure_mid_stream_ends_body_with_error() {
        let backend = spawn_server(Router::new().route(
            "/broken",
            get(|| async {
                let items = vec![
                    Ok(Bytes::from_static(b"partial")),
                    Err(std::io::Error::other("backend died")),
                ];
                let chunks = futures_util::stream::iter(items).then(|item| async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    item
                });
                Body::from_stream(chunks)
            }),
        ))
        .await;
        let relay = spawn_relay(RelayConfig::default()).await;

        let mut resp = client()
            .get(format!("http://{relay}/http://{backend}/broken"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let mut received = Vec::new();
        let failed = loop {
            match resp.chunk().await {
                Ok(Some(chunk)) => received.extend_from_slice(&chunk),
                Ok(None) => break false,
                Err(_) => break true,
            }
        };
        assert!(failed, "an interrupted backend must not look like a complete body");
        assert!(b"partial".starts_with(&received));

        // the relay is still serving
        let resp = client().get(format!("http://{relay}/health")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_caller_disconnect_drops_upstream_stream() {
        /// Flips the flag when the backend's body stream is dropped.
        struct DropFlag(Arc<AtomicBool>);

        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicBool::new(false));
        let flag = dropped.clone();
        let backend = spawn_server(Router::new().route(
            "/endless",
            get(move || {
                let flag = flag.clone();
                async move {
                    let chunks = futures_util::stream::unfold(DropFlag(flag), |state| async move {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Some((Ok::<_, std::io::Error>(Bytes::from_static(b"tick;")), state))
                    });
                    Body::from_stream(chunks)
                }
            }),
        ))
        .await;
        let relay = spawn_relay(RelayConfig::default()).await;

        let caller = client();
        let mut resp = caller
            .get(format!("http://{relay}/http://{backend}/endless"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let first = resp.chunk().await.unwrap().expect("stream should be open");
        assert!(!first.is_empty());
        assert!(!dropped.load(Ordering::SeqCst));

        drop(resp);
        drop(caller);

        let mut released = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if dropped.load(Ordering::SeqCst) {
                released = true;
                break;
            }
        }
        assert!(released, "backend stream should be dropped once the caller goes away");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_streams_do_not_interleave() {
        async fn numbered(Path(id): Path<u32>) -> Body {
            let chunks = futures_util::stream::iter(0..20).then(move |i| async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                Ok::<_, std::io::Error>(Bytes::from(format!("{id}:{i};")))
            });
            Body::from_stream(chunks)
        }

        let backend = spawn_server(Router::new().route("/n/{id}", get(numbered))).await;
        let relay = spawn_relay(RelayConfig::default()).await;
        let client = client();

        let handles: Vec<_> = (0..8u32)
            .map(|id| {
                let client = client.clone();
                tokio::spawn(async move {
                    let resp = client
                        .get(format!("http://{relay}/http://{backend}/n/{id}"))
                        .send()
                        .await
                        .unwrap();
                    (id, resp.text().await.unwrap())
                })
            })
            .collect();

        for handle in handles {
            let (id, text) = handle.await.unwrap();
            let expected: String = (0..20).map(|i| format!("{id}:{i};")).collect();
            assert_eq!(text, expected);
        }
    }

    #[tokio::test]
    async fn test_unreachable_target_is_bad_gateway() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);

        let relay = spawn_relay(RelayConfig::default()).await;
        let resp = client()
            .get(format!("http://{relay}/http://{dead}/"))
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert!(resp.text().await.unwrap().contains("upstream request failed"));
    }

    #[tokio::test]
    async fn test_custom_rules_override_headers() {
        let backend = spawn_echo_backend().await;
        let mut config = RelayConfig::default();
        config.header_rules = vec![crate::config::HeaderRuleConfig {
            pattern: r"^127\.0\.0\.1$".to_string(),
            rules: [("origin".to_string(), "https://trusted.example".to_string())]
                .into_iter()
                .collect(),
        }];
        let relay = spawn_relay(config).await;

        let resp = client()
            .get(format!("http://{relay}/http://{backend}/echo"))
            .header("origin", "https://app.example.com")
            .header("referer", "https://app.example.com/page")
            .send()
            .await
            .unwrap();

        assert_eq!(header(&resp, "x-seen-origin"), Some("https://trusted.example"));
        assert_eq!(
            header(&resp, "x-seen-referer"),
            Some("https://app.example.com/page")
        );
    }
}
