//! Forwarding through the authenticated pipeline
//!
//! Receives inbound requests, strips hop-by-hop headers and any client
//! `Authorization`, and sends them to the backend through the session's
//! `ApiClient`, which attaches the session credential and recovers from 401s.
//! Backend responses are returned verbatim, including error statuses.

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use session_client::{ApiClient, Error};
use std::time::{Duration, Instant};
use tracing::{error, instrument, warn};

use crate::metrics;

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

/// Inbound headers recomputed by the HTTP client or owned by the session.
const REPLACED_HEADERS: &[&str] = &["host", "content-length", "authorization"];

/// Set on responses whose failure can only be fixed by logging in again.
pub const REQUIRES_LOGIN_HEADER: &str = "x-session-requires-login";

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared state passed to the proxy handler
#[derive(Clone)]
pub struct ProxyState {
    pub client: ApiClient,
    pub timeout: Duration,
}

/// JSON error body: {"error":{"type":"gateway_error","message":"...","request_id":"req_..."}}
pub fn error_response(status: StatusCode, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": "gateway_error",
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Forward an inbound request to the backend with the session credential.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: axum::http::Request<axum::body::Body>,
    request_id: String,
) -> Response {
    let started = Instant::now();
    let method = request.method().clone();

    // Relative to the API base; the query string rides along in the join.
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().trim_start_matches('/').to_owned())
        .unwrap_or_default();

    let headers = forwardable_headers(request.headers());

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "failed to read request body");
            let response = error_response(
                StatusCode::BAD_REQUEST,
                &format!("invalid request body: {e}"),
                &request_id,
            );
            metrics::record_request(400, method.as_str(), started.elapsed().as_secs_f64());
            return response;
        }
    };

    let mut outbound = session_client::ApiRequest::new(method.clone(), path)
        .headers(headers)
        .timeout(state.timeout);
    if !body.is_empty() {
        outbound = outbound.body(body);
    }

    let response = match state.client.send(outbound).await {
        Ok(upstream) => relay(upstream, &request_id).await,
        Err(Error::Status {
            status,
            body,
            requires_login,
        }) => {
            if requires_login {
                warn!(status, "session expired, login required");
                metrics::record_upstream_error("requires_login");
            }
            status_response(status, body, requires_login)
        }
        Err(Error::Http(message)) => {
            error!(error = %message, "backend request failed");
            metrics::record_upstream_error("transport");
            error_response(
                StatusCode::BAD_GATEWAY,
                &format!("backend error: {message}"),
                &request_id,
            )
        }
        Err(e) => {
            error!(error = %e, "request could not be forwarded");
            metrics::record_upstream_error("invalid_request");
            error_response(StatusCode::BAD_REQUEST, &e.to_string(), &request_id)
        }
    };

    metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Copy a 2xx backend response back to the caller.
async fn relay(upstream: reqwest::Response, request_id: &str) -> Response {
    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();

    match upstream.bytes().await {
        Ok(body) => {
            let mut response = Response::builder().status(status);
            for (name, value) in &upstream_headers {
                if !is_hop_by_hop(name.as_str()) {
                    response = response.header(name, value);
                }
            }
            response
                .body(axum::body::Body::from(body))
                .unwrap_or_else(|e| {
                    error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        &format!("response build error: {e}"),
                        request_id,
                    )
                })
        }
        Err(e) => {
            error!(error = %e, "failed to read backend response body");
            metrics::record_upstream_error("body");
            error_response(
                StatusCode::BAD_GATEWAY,
                &format!("backend response read error: {e}"),
                request_id,
            )
        }
    }
}

/// Rebuild a non-2xx backend answer from the pipeline error.
fn status_response(status: u16, body: String, requires_login: bool) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = if serde_json::from_str::<serde_json::Value>(&body).is_ok() {
        "application/json"
    } else {
        "text/plain; charset=utf-8"
    };
    let mut response = (
        status,
        [(axum::http::header::CONTENT_TYPE, content_type)],
        body,
    )
        .into_response();
    if requires_login {
        response.headers_mut().insert(
            HeaderName::from_static(REQUIRES_LOGIN_HEADER),
            HeaderValue::from_static("true"),
        );
    }
    response
}

fn forwardable_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        let name_str = name.as_str();
        if is_hop_by_hop(name_str) || REPLACED_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name_str)) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
