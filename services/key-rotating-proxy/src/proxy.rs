//! HTTP proxy logic
//!
//! Receives inbound requests, forwards them to the upstream with the active
//! API key injected, and rotates to the next key whenever the upstream
//! answers 429. Any other upstream status is streamed back verbatim.
//!
//! Per request the controller runs a bounded loop, one attempt per key:
//! select key → forward → success | rate limited (rotate, next attempt) | fatal.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::request::Parts;
use axum::http::{HeaderName, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use client_pool::{ClientPool, Forwarded};
use key_rotation::{ActiveKey, KeyRotation};
use tracing::{debug, error, info, instrument, warn};

use crate::body::LeasedBody;
use crate::error::ProxyError;
use crate::metrics::{self, ServiceMetrics};

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub pool: ClientPool,
    pub rotation: Arc<KeyRotation>,
    pub upstream: reqwest::Url,
    pub credential_header: HeaderName,
    pub max_body_bytes: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub metrics: ServiceMetrics,
}

/// Decrements the in-flight gauge when the request future completes or is dropped.
struct InFlightGuard(Arc<AtomicU64>);

impl InFlightGuard {
    fn new(counter: &Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// JSON error body: {"error":{"type":"proxy_error","message":"...","request_id":"req_..."}}
pub fn error_response(status: StatusCode, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": "proxy_error",
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Proxy an inbound request, rotating API keys on upstream 429s.
///
/// The whole exchange up to the response head is bounded by the server write
/// timeout; the streamed body is bounded by the pool's request timeout.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: axum::http::Request<Body>,
    request_id: String,
) -> Response {
    let started = Instant::now();
    state.metrics.requests_total.fetch_add(1, Ordering::Relaxed);
    let _in_flight = InFlightGuard::new(&state.metrics.in_flight);
    let method = request.method().clone();

    let outcome = match tokio::time::timeout(state.write_timeout, forward_with_rotation(state, request)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(ProxyError::Timeout(state.write_timeout)),
    };

    let response = match outcome {
        Ok(response) => response,
        Err(e) => {
            state.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
            metrics::record_upstream_error(e.kind());
            error!(error = %e, error_type = e.kind(), "proxy request failed");
            error_response(e.status(), &e.to_string(), &request_id)
        }
    };

    metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    response
}

/// The request loop: at most one attempt per key, only 429 moves on.
async fn forward_with_rotation(
    state: &ProxyState,
    request: axum::http::Request<Body>,
) -> Result<Response, ProxyError> {
    let (parts, body) = request.into_parts();
    let body = read_body(state, body).await?;
    let url = upstream_url(&state.upstream, &parts.uri);

    let attempts = state.rotation.len();
    for attempt in 0..attempts {
        let active = state.rotation.current().await;
        let outbound = build_request(&parts, &url, &state.credential_header, &active, body.clone())?;

        let forwarded = state.pool.forward(outbound).await?;
        let status = forwarded.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            forwarded.release();
            warn!(attempt, key_index = active.index, "upstream rate limited API key, rotating");
            state.rotation.rotate().await;
            metrics::record_key_rotation();
            continue;
        }

        debug!(
            attempt,
            key_index = active.index,
            status = status.as_u16(),
            client_id = forwarded.lease.client().id(),
            "upstream responded"
        );
        return Ok(stream_response(forwarded));
    }

    info!(attempts, "every API key was rate limited");
    Err(ProxyError::RateLimitExhausted { attempts })
}

/// Buffer the inbound body once so every attempt sends identical bytes.
async fn read_body(state: &ProxyState, body: Body) -> Result<Bytes, ProxyError> {
    match tokio::time::timeout(
        state.read_timeout,
        axum::body::to_bytes(body, state.max_body_bytes),
    )
    .await
    {
        Ok(Ok(bytes)) => Ok(bytes),
        Ok(Err(e)) => Err(ProxyError::RequestConstruction(format!(
            "invalid request body: {e}"
        ))),
        Err(_) => Err(ProxyError::RequestConstruction(format!(
            "timed out reading request body after {}s",
            state.read_timeout.as_secs()
        ))),
    }
}

/// Append the inbound path to the upstream base path and carry the inbound
/// query. Any query or fragment on the upstream URL itself is dropped.
pub fn upstream_url(upstream: &reqwest::Url, uri: &Uri) -> reqwest::Url {
    let mut url = upstream.clone();
    let base = upstream.path().trim_end_matches('/');
    url.set_path(&format!("{base}{}", uri.path()));
    url.set_query(uri.query());
    url.set_fragment(None);
    url
}

/// Build the outbound request for one attempt.
///
/// Inbound headers are copied except hop-by-hop headers and `Host` (reqwest
/// derives it from the upstream URL). The credential header is always
/// overwritten with the active key.
pub fn build_request(
    parts: &Parts,
    url: &reqwest::Url,
    credential_header: &HeaderName,
    active: &ActiveKey,
    body: Bytes,
) -> Result<reqwest::Request, ProxyError> {
    let mut outbound = reqwest::Request::new(parts.method.clone(), url.clone());

    let headers = outbound.headers_mut();
    for (name, value) in &parts.headers {
        if name != header::HOST && !is_hop_by_hop(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }

    let key = active.key.header_value().map_err(|e| {
        ProxyError::RequestConstruction(format!("API key at index {}: {e}", active.index))
    })?;
    headers.insert(credential_header.clone(), key);

    if !body.is_empty() {
        *outbound.body_mut() = Some(reqwest::Body::from(body));
    }
    Ok(outbound)
}

/// Copy upstream status and headers and stream the body back to the caller.
fn stream_response(forwarded: Forwarded) -> Response {
    let Forwarded { response, lease } = forwarded;
    let status = response.status();

    let mut headers = axum::http::HeaderMap::with_capacity(response.headers().len());
    for (name, value) in response.headers() {
        if !is_hop_by_hop(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }

    let body = Body::from_stream(LeasedBody::new(response.bytes_stream(), lease));
    let mut out = Response::new(body);
    *out.status_mut() = status;
    *out.headers_mut() = headers;
    out
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
