//! Admin API for the gateway's session
//!
//! Runs on a separate listener port (default 9090). Never exposes tokens.
//!
//! Endpoints:
//! - GET  /admin/session           : session status
//! - POST /admin/session/login     : log in with identifier + secret
//! - POST /admin/session/verify-2fa: complete a login with a TOTP code
//! - POST /admin/session/refresh   : force a renewal now
//! - POST /admin/session/logout    : revoke and clear the session

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use session_client::Session;
use tracing::{info, warn};

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    session: Arc<Session>,
}

impl AdminState {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

/// Build the admin axum router with all session management endpoints.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/session", get(session_status))
        .route("/admin/session/login", post(login))
        .route("/admin/session/verify-2fa", post(verify_two_factor))
        .route("/admin/session/refresh", post(refresh))
        .route("/admin/session/logout", post(logout))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Map a failed backend call to a response. Backend rejections keep their
/// status; anything else is a gateway failure.
fn failure(e: &session_client::Error) -> Response {
    let status = e
        .status()
        .and_then(|s| StatusCode::from_u16(s).ok())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    json_response(status, serde_json::json!({ "error": e.to_string() }))
}

/// GET /admin/session
async fn session_status(State(state): State<AdminState>) -> Response {
    json_response(
        StatusCode::OK,
        serde_json::json!(state.session.status()),
    )
}

#[derive(Deserialize)]
struct LoginRequest {
    identifier: String,
    secret: String,
}

/// POST /admin/session/login
async fn login(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<LoginRequest>,
) -> Response {
    match state.session.login(&body.identifier, &body.secret).await {
        Ok(()) => {
            info!("admin login succeeded");
            json_response(StatusCode::OK, serde_json::json!(state.session.status()))
        }
        Err(e) => {
            warn!(error = %e, "admin login failed");
            failure(&e)
        }
    }
}

#[derive(Deserialize)]
struct VerifyTwoFactorRequest {
    totp_code: String,
    email: String,
}

/// POST /admin/session/verify-2fa
async fn verify_two_factor(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<VerifyTwoFactorRequest>,
) -> Response {
    match state
        .session
        .verify_two_factor(&body.totp_code, &body.email)
        .await
    {
        Ok(true) => json_response(StatusCode::OK, serde_json::json!(state.session.status())),
        Ok(false) => json_response(
            StatusCode::ACCEPTED,
            serde_json::json!({ "authenticated": false, "message": "code accepted, no session issued" }),
        ),
        Err(e) => {
            warn!(error = %e, "second factor verification failed");
            failure(&e)
        }
    }
}

/// POST /admin/session/refresh: waits for the renewal outcome.
async fn refresh(State(state): State<AdminState>) -> Response {
    if !state.session.is_authenticated() {
        return json_response(
            StatusCode::CONFLICT,
            serde_json::json!({ "error": "no session to refresh" }),
        );
    }
    if state.session.refresh_now().await {
        json_response(StatusCode::OK, serde_json::json!(state.session.status()))
    } else {
        json_response(
            StatusCode::UNAUTHORIZED,
            serde_json::json!({ "error": "renewal failed, login required" }),
        )
    }
}

/// POST /admin/session/logout: idempotent.
async fn logout(State(state): State<AdminState>) -> Response {
    state.session.logout();
    json_response(StatusCode::OK, serde_json::json!({ "status": "logged_out" }))
}
