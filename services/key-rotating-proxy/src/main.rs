//! Key-Rotating Proxy
//!
//! Single-binary Rust service that:
//! 1. Loads a list of API keys for one upstream
//! 2. Forwards every inbound request with the active key injected
//! 3. Rotates to the next key when the upstream answers 429
//! 4. Streams any other upstream response back unchanged

mod body;
mod config;
mod error;
mod metrics;
mod proxy;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use key_rotation::KeyRotation;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::Config;
use crate::metrics::ServiceMetrics;
use crate::proxy::ProxyState;

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    metrics: ServiceMetrics,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// Only `GET /health` and `GET /metrics` are answered locally; other methods
/// on those paths are proxied like any other request. `max_connections` caps
/// concurrently handled requests across every route through one shared
/// semaphore.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler).fallback(proxy_handler))
        .route("/metrics", get(metrics_handler).fallback(proxy_handler))
        .fallback(proxy_handler)
        .layer(tower::limit::GlobalConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting key-rotating-proxy");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder()?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    match &config_path {
        Some(path) => info!(path = %path.display(), "loading configuration"),
        None => info!("no configuration file, using defaults and environment"),
    }

    let mut config = Config::load(config_path.as_deref())
        .inspect_err(|e| error!(error = %e, "failed to load configuration"))
        .context("failed to load configuration")?;

    info!(
        listen_addr = %config.server.listen_addr,
        upstream_url = %config.upstream.url,
        credential_header = %config.upstream.credential_header,
        keys = config.api_keys.len(),
        max_active = config.pool.max_active,
        "configuration loaded"
    );

    let credential_header = config.credential_header()?;
    let upstream = reqwest::Url::parse(&config.upstream.url)
        .with_context(|| format!("invalid upstream url {}", config.upstream.url))?;
    let rotation = Arc::new(KeyRotation::new(std::mem::take(&mut config.api_keys))?);
    let pool = config.build_pool()?;

    let metrics = ServiceMetrics::new();

    let proxy_state = ProxyState {
        pool,
        rotation,
        upstream,
        credential_header,
        max_body_bytes: config.server.max_body_bytes,
        read_timeout: Duration::from_secs(config.server.read_timeout_secs),
        write_timeout: Duration::from_secs(config.server.write_timeout_secs),
        metrics: metrics.clone(),
    };

    let app_state = AppState {
        proxy: proxy_state,
        metrics: metrics.clone(),
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .inspect_err(|e| error!(error = %e, addr = %listen_addr, "failed to bind listener"))
        .with_context(|| format!("failed to bind to {listen_addr}"))?;

    info!(addr = %listen_addr, "accepting requests");

    // Clone in_flight counter for drain observability after shutdown
    let in_flight = metrics.in_flight.clone();

    // The drain timeout starts when the shutdown signal fires: the server is
    // told to stop accepting, then the drain races DRAIN_TIMEOUT.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: process counters, key rotation position, and pool accounting.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.metrics.started_at.elapsed().as_secs();
    let requests = state.metrics.requests_total.load(Ordering::Relaxed);
    let errors = state.metrics.errors_total.load(Ordering::Relaxed);
    let in_flight = state.metrics.in_flight.load(Ordering::Relaxed);
    let active_index = state.proxy.rotation.cursor().await;
    let pool = state.proxy.pool.stats();

    let body = serde_json::json!({
        "status": "healthy",
        "uptime_seconds": uptime,
        "requests_served": requests,
        "errors_total": errors,
        "in_flight": in_flight,
        "keys": {
            "total": state.proxy.rotation.len(),
            "active_index": active_index,
        },
        "pool": {
            "live": pool.live,
            "idle": pool.idle,
            "checked_out": pool.checked_out,
            "max_active": pool.max_active,
        },
    });

    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint. Pool gauges are sampled at scrape time.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    metrics::record_pool_stats(state.proxy.pool.stats());
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Catch-all handler that proxies all non-reserved requests to upstream.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_request(&state.proxy, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
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
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{HeaderMap, HeaderName, Request, StatusCode};
    use client_pool::{ClientPool, PoolConfig};
    use key_rotation::parse_keys;
    use std::sync::Mutex;
    use tower::ServiceExt;

    /// Create a PrometheusHandle for tests without installing a global recorder.
    fn test_prometheus_handle() -> PrometheusHandle {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        recorder.handle()
    }

    fn test_app_state_with(
        upstream_url: &str,
        keys: &str,
        pool: PoolConfig,
        write_timeout: Duration,
    ) -> AppState {
        let metrics = ServiceMetrics::new();

        AppState {
            proxy: ProxyState {
                pool: ClientPool::new(pool).unwrap(),
                rotation: Arc::new(KeyRotation::new(parse_keys(keys).unwrap()).unwrap()),
                upstream: reqwest::Url::parse(upstream_url).unwrap(),
                credential_header: HeaderName::from_static("x-api-key"),
                max_body_bytes: 1024 * 1024,
                read_timeout: Duration::from_secs(5),
                write_timeout,
                metrics: metrics.clone(),
            },
            metrics,
            prometheus: test_prometheus_handle(),
        }
    }

    /// Build test app state pointing at the given upstream URL with the given keys.
    fn test_app_state(upstream_url: &str, keys: &str) -> AppState {
        test_app_state_with(
            upstream_url,
            keys,
            PoolConfig::default(),
            Duration::from_secs(5),
        )
    }

    /// Keys seen by a mock upstream, in arrival order.
    type Seen = Arc<Mutex<Vec<String>>>;

    /// Start a mock upstream that answers 429 for `limited` keys and
    /// `status`/`body` for every other key.
    async fn start_keyed_upstream(
        limited: &'static [&'static str],
        status: StatusCode,
        body: &'static str,
    ) -> (String, Seen) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));

        let recorded = seen.clone();
        let app = axum::Router::new().fallback(move |headers: HeaderMap| {
            let recorded = recorded.clone();
            async move {
                let key = headers
                    .get("x-api-key")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                let rate_limited = limited.iter().any(|l| *l == key);
                recorded.lock().unwrap().push(key);
                if rate_limited {
                    (
                        StatusCode::TOO_MANY_REQUESTS,
                        r#"{"error":{"type":"rate_limit_error"}}"#,
                    )
                } else {
                    (status, body)
                }
            }
        });
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (url, seen)
    }

    /// Start a mock upstream that echoes back request headers and body as JSON.
    /// Requests carrying one of the `limited` keys get a 429 instead.
    async fn start_echo_server(limited: &'static [&'static str]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());

        let app = axum::Router::new().fallback(move |request: axum::http::Request<Body>| async move {
            let mut headers_map = serde_json::Map::new();
            for (name, value) in request.headers() {
                headers_map.insert(
                    name.to_string(),
                    serde_json::Value::String(value.to_str().unwrap_or("").to_string()),
                );
            }
            let key = request
                .headers()
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let method = request.method().to_string();
            let path = request.uri().path().to_string();
            let query = request.uri().query().unwrap_or("").to_string();
            let body_bytes = axum::body::to_bytes(request.into_body(), 10 * 1024 * 1024)
                .await
                .unwrap();
            let body_str = String::from_utf8_lossy(&body_bytes).to_string();
            let status = if limited.iter().any(|l| *l == key) {
                StatusCode::TOO_MANY_REQUESTS
            } else {
                StatusCode::OK
            };
            let body = serde_json::json!({
                "echoed_headers": headers_map,
                "method": method,
                "path": path,
                "query": query,
                "body": body_str,
            });
            (status, [("x-upstream-echo", "true")], axum::Json(body))
        });
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        url
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn post(uri: &str, body: &'static str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn rotates_past_rate_limited_keys_until_success() {
        let (upstream_url, seen) =
            start_keyed_upstream(&["key-a", "key-b"], StatusCode::OK, "ok").await;
        let state = test_app_state(&upstream_url, "key-a,key-b,key-c");
        let rotation = state.proxy.rotation.clone();

        let app = build_router(state, 1000);
        let response = app.oneshot(post("/v1/messages", "{}")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .unwrap();
        assert_eq!(&body[..], b"ok");
        assert_eq!(*seen.lock().unwrap(), vec!["key-a", "key-b", "key-c"]);
        assert_eq!(rotation.cursor().await, 2, "cursor stays on the key that worked");
    }

    #[tokio::test]
    async fn success_on_first_key_does_not_rotate() {
        let (upstream_url, seen) = start_keyed_upstream(&[], StatusCode::OK, "ok").await;
        let state = test_app_state(&upstream_url, "key-a,key-b");
        let rotation = state.proxy.rotation.clone();

        let response = build_router(state, 1000)
            .oneshot(post("/v1/messages", "{}"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(rotation.cursor().await, 0);
    }

    #[tokio::test]
    async fn single_rate_limited_key_fails_after_one_attempt() {
        let (upstream_url, seen) =
            start_keyed_upstream(&["only"], StatusCode::OK, "unreachable").await;
        let state = test_app_state(&upstream_url, "only");

        let response = build_router(state, 1000)
            .oneshot(post("/v1/messages", "{}"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "proxy_error");
        assert!(
            json["error"]["message"]
                .as_str()
                .unwrap()
                .contains("unable to make successful request")
        );
        assert_eq!(seen.lock().unwrap().len(), 1, "exactly one upstream call");
    }

    #[tokio::test]
    async fn all_keys_rate_limited_tries_each_once_and_returns_cursor_to_start() {
        let (upstream_url, seen) = start_keyed_upstream(
            &["k0", "k1", "k2", "k3"],
            StatusCode::OK,
            "unreachable",
        )
        .await;
        let state = test_app_state(&upstream_url, "k0,k1,k2,k3");
        let rotation = state.proxy.rotation.clone();
        rotation.rotate().await;

        let response = build_router(state, 1000)
            .oneshot(post("/v1/messages", "{}"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(*seen.lock().unwrap(), vec!["k1", "k2", "k3", "k0"]);
        assert_eq!(rotation.cursor().await, 1, "n rotations bring the cursor back");
    }

    #[tokio::test]
    async fn non_429_error_passes_through_without_rotation() {
        let (upstream_url, seen) = start_keyed_upstream(
            &[],
            StatusCode::SERVICE_UNAVAILABLE,
            r#"{"error":"overloaded"}"#,
        )
        .await;
        let state = test_app_state(&upstream_url, "key-a,key-b");
        let rotation = state.proxy.rotation.clone();

        let response = build_router(state, 1000)
            .oneshot(post("/v1/messages", "{}"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["error"], "overloaded");
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(rotation.cursor().await, 0);
    }

    #[tokio::test]
    async fn credential_header_is_overwritten_and_other_headers_forwarded() {
        let upstream_url = start_echo_server(&[]).await;
        let state = test_app_state(&upstream_url, "pooled-key");

        let response = build_router(state, 1000)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/messages")
                    .header("host", "proxy.internal")
                    .header("x-api-key", "caller-key")
                    .header("anthropic-version", "2023-06-01")
                    .header("connection", "keep-alive")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-upstream-echo"], "true");
        let json = body_json(response).await;
        let headers = &json["echoed_headers"];
        assert_eq!(headers["x-api-key"], "pooled-key");
        assert_eq!(headers["anthropic-version"], "2023-06-01");
        assert_ne!(headers["host"], "proxy.internal", "Host must target upstream");
        assert_ne!(headers["connection"], "keep-alive");
    }

    #[tokio::test]
    async fn body_is_replayed_identically_on_retry() {
        let upstream_url = start_echo_server(&["first"]).await;
        let state = test_app_state(&upstream_url, "first,second");
        let payload = r#"{"model":"claude-3","messages":[{"role":"user","content":"hi"}]}"#;

        let response = build_router(state, 1000)
            .oneshot(post("/v1/messages", payload))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["echoed_headers"]["x-api-key"], "second");
        assert_eq!(json["body"], payload);
        assert_eq!(json["method"], "POST");
    }

    #[tokio::test]
    async fn path_and_query_are_forwarded() {
        let upstream_url = start_echo_server(&[]).await;
        let state = test_app_state(&upstream_url, "k");

        let response = build_router(state, 1000)
            .oneshot(
                Request::builder()
                    .uri("/v1/models?limit=5&after=abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let json = body_json(response).await;
        assert_eq!(json["method"], "GET");
        assert_eq!(json["path"], "/v1/models");
        assert_eq!(json["query"], "limit=5&after=abc");
    }

    #[tokio::test]
    async fn unreachable_upstream_returns_proxy_error() {
        let state = test_app_state("http://127.0.0.1:1", "key-a,key-b");
        let rotation = state.proxy.rotation.clone();
        let pool = state.proxy.pool.clone();
        let metrics = state.metrics.clone();

        let response = build_router(state, 1000)
            .oneshot(post("/v1/messages", "{}"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "proxy_error");
        assert!(
            json["error"]["request_id"]
                .as_str()
                .unwrap()
                .starts_with("req_")
        );
        assert!(
            json["error"]["message"]
                .as_str()
                .unwrap()
                .starts_with("failed to make request with API key")
        );
        assert_eq!(rotation.cursor().await, 0, "transport errors do not rotate");
        assert_eq!(pool.stats().live, 0, "failed client must not hold a slot");
        assert_eq!(metrics.errors_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn exhausted_pool_returns_proxy_error() {
        let (upstream_url, seen) = start_keyed_upstream(&[], StatusCode::OK, "ok").await;
        let state = test_app_state_with(
            &upstream_url,
            "k",
            PoolConfig {
                max_active: 1,
                ..PoolConfig::default()
            },
            Duration::from_secs(5),
        );
        let _held = state.proxy.pool.acquire().unwrap();

        let response = build_router(state, 1000)
            .oneshot(post("/v1/messages", "{}"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert!(
            json["error"]["message"]
                .as_str()
                .unwrap()
                .contains("pool exhausted")
        );
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn slow_upstream_hits_write_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let app = axum::Router::new().fallback(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "late"
            });
            axum::serve(listener, app).await.unwrap();
        });

        let state = test_app_state_with(
            &upstream_url,
            "k",
            PoolConfig::default(),
            Duration::from_millis(100),
        );
        let pool = state.proxy.pool.clone();

        let response = build_router(state, 1000)
            .oneshot(post("/v1/messages", "{}"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert!(
            json["error"]["message"]
                .as_str()
                .unwrap()
                .contains("timed out")
        );
        assert_eq!(pool.stats().checked_out, 0);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let (upstream_url, seen) = start_keyed_upstream(&[], StatusCode::OK, "ok").await;
        let mut state = test_app_state(&upstream_url, "k");
        state.proxy.max_body_bytes = 8;

        let response = build_router(state, 1000)
            .oneshot(post("/v1/messages", r#"{"too":"large for the limit"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert!(
            json["error"]["message"]
                .as_str()
                .unwrap()
                .starts_with("failed to create request")
        );
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn streamed_response_returns_client_to_pool() {
        let (upstream_url, _seen) =
            start_keyed_upstream(&["limited"], StatusCode::OK, "streamed body").await;
        let state = test_app_state(&upstream_url, "limited,fresh");
        let pool = state.proxy.pool.clone();

        let response = build_router(state, 1000)
            .oneshot(post("/v1/messages", "{}"))
            .await
            .unwrap();
        assert_eq!(pool.stats().checked_out, 1, "lease held while body is unread");

        let body = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .unwrap();
        assert_eq!(&body[..], b"streamed body");

        let stats = pool.stats();
        assert_eq!(stats.checked_out, 0);
        assert_eq!(stats.idle, 1, "429 and success reuse one client");
        assert_eq!(stats.live, 1);
    }

    #[tokio::test]
    async fn request_counters_track_proxied_requests() {
        let (upstream_url, _seen) = start_keyed_upstream(&[], StatusCode::OK, "ok").await;
        let state = test_app_state(&upstream_url, "k");
        let metrics = state.metrics.clone();
        let app = build_router(state, 1000);

        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(post("/v1/messages", "{}"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        assert_eq!(metrics.requests_total.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.errors_total.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.in_flight.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn health_endpoint_returns_json() {
        let state = test_app_state("http://unused.invalid", "a,b,c");
        state
            .metrics
            .requests_total
            .fetch_add(5, std::sync::atomic::Ordering::Relaxed);
        state.proxy.rotation.rotate().await;

        let app = build_router(state, 1000);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;

        assert_eq!(json["status"], "healthy");
        assert_eq!(json["requests_served"], 5);
        assert_eq!(json["keys"]["total"], 3);
        assert_eq!(json["keys"]["active_index"], 1);
        assert_eq!(json["pool"]["max_active"], 50);
        assert_eq!(json["pool"]["live"], 0);
    }

    #[tokio::test]
    async fn health_is_not_proxied() {
        let (upstream_url, seen) = start_keyed_upstream(&[], StatusCode::OK, "ok").await;
        let state = test_app_state(&upstream_url, "k");

        let response = build_router(state, 1000)
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_get_requests_to_local_paths_are_proxied() {
        let (upstream_url, seen) = start_keyed_upstream(&[], StatusCode::ACCEPTED, "upstream").await;
        let state = test_app_state(&upstream_url, "k");
        let app = build_router(state, 1000);

        for path in ["/health", "/metrics"] {
            let response = app.clone().oneshot(post(path, "{}")).await.unwrap();
            assert_eq!(response.status(), StatusCode::ACCEPTED, "POST {path}");
            let body = axum::body::to_bytes(response.into_body(), 1024)
                .await
                .unwrap();
            assert_eq!(&body[..], b"upstream");
        }

        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn concurrency_limit_is_shared_across_routes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let app = axum::Router::new().fallback(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "late"
            });
            axum::serve(listener, app).await.unwrap();
        });

        let state = test_app_state(&upstream_url, "k");
        let app = build_router(state, 1);

        let slow = tokio::spawn(app.clone().oneshot(post("/v1/messages", "{}")));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let health = || {
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap()
        };
        let blocked =
            tokio::time::timeout(Duration::from_millis(200), app.clone().oneshot(health())).await;
        assert!(blocked.is_err(), "/health must wait for the proxied request's permit");

        slow.abort();
        let _ = slow.await;

        let response = app.oneshot(health()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_text() {
        let state = test_app_state("http://unused.invalid", "k");
        let response = build_router(state, 1000)
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()["content-type"].to_str().unwrap();
        assert!(content_type.starts_with("text/plain"));
    }
}
