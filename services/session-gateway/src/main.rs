//! Session gateway
//!
//! Single-binary Rust service that:
//! 1. Restores (or establishes) one authenticated backend session
//! 2. Keeps it alive with proactive and 401-driven token renewal
//! 3. Forwards local HTTP requests to the backend with the session credential
//! 4. Serves a separate admin API for login, 2FA, forced refresh and logout

mod admin;
mod config;
mod error;
mod metrics;
mod proxy;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;
use session_auth::FileBackend;
use session_client::{Session, SessionConfig};

use crate::admin::{AdminState, build_admin_router};
use crate::config::{Config, LoginConfig};
use crate::proxy::ProxyState;

/// How long in-flight requests may drain after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    session: Arc<Session>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the forwarding router.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(proxy_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Open the credential file and assemble the session.
fn build_session(config: &Config) -> error::Result<Session> {
    let base_url = session_auth::parse_base_url(&config.backend.base_url)?;
    let backend = FileBackend::open(config.credentials.path.clone()).map_err(|source| {
        error::Error::CredentialFile {
            path: config.credentials.path.display().to_string(),
            source,
        }
    })?;

    let session_config = SessionConfig {
        base_url,
        renewal_lead_time: config.backend.renewal_lead_time(),
        request_timeout: config.backend.timeout(),
    };
    Ok(Session::new(session_config, Box::new(backend))?)
}

/// Log in with the configured identifier unless a session was restored.
async fn startup_login(session: &Session, login: &LoginConfig) -> error::Result<()> {
    if session.is_authenticated() {
        info!("persisted session restored, skipping startup login");
        return Ok(());
    }
    let secret = login
        .secret
        .as_ref()
        .ok_or_else(|| error::Error::MissingSecret {
            identifier: login.identifier.clone(),
        })?;
    session.login(&login.identifier, secret.expose_str()).await?;
    Ok(())
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

    info!("starting session-gateway");

    // Install before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.gateway.listen_addr,
        admin_addr = %config.gateway.admin_addr,
        base_url = %config.backend.base_url,
        credentials = %config.credentials.path.display(),
        "configuration loaded"
    );

    let session = Arc::new(build_session(&config).context("failed to set up session")?);

    if let Some(login) = &config.login {
        match startup_login(&session, login).await {
            Ok(()) => {}
            Err(e @ error::Error::MissingSecret { .. }) => return Err(e.into()),
            // Keep serving; the admin API can log in later.
            Err(e) => warn!(error = %e, "startup login failed"),
        }
    }
    if !session.is_authenticated() {
        warn!("no session established, forwarded requests will be unauthenticated");
    }

    let app_state = AppState {
        proxy: ProxyState {
            client: session.client().clone(),
            timeout: config.backend.timeout(),
        },
        session: session.clone(),
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };
    let app = build_router(app_state, config.gateway.max_connections);
    let admin_app = build_admin_router(AdminState::new(session.clone()));

    let listener = TcpListener::bind(config.gateway.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.gateway.listen_addr))?;
    let admin_listener = TcpListener::bind(config.gateway.admin_addr)
        .await
        .with_context(|| format!("failed to bind admin to {}", config.gateway.admin_addr))?;

    info!(
        addr = %config.gateway.listen_addr,
        admin_addr = %config.gateway.admin_addr,
        "accepting requests"
    );

    // The drain timeout starts when the shutdown signal fires: notify both
    // servers to drain, then race the drain against DRAIN_TIMEOUT.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let (admin_shutdown_tx, admin_shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    let admin_handle = tokio::spawn(async move {
        axum::serve(admin_listener, admin_app)
            .with_graceful_shutdown(async {
                let _ = admin_shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());
    let _ = admin_shutdown_tx.send(());

    let drained = async {
        let (gateway, admin) = tokio::join!(server_handle, admin_handle);
        for (name, result) in [("gateway", gateway), ("admin", admin)] {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(server = name, error = %e, "server error during shutdown"),
                Err(e) => error!(server = name, error = %e, "server task panicked"),
            }
        }
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, drained).await {
        Ok(()) => info!("all in-flight requests drained"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    // The session stays persisted for the next start.
    session.scheduler().disarm();
    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: 200 with a live session, 503 when login is required.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed().as_secs();
    let session = state.session.status();

    let (status_code, status) = if session.authenticated {
        (axum::http::StatusCode::OK, "healthy")
    } else {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    let body = serde_json::json!({
        "status": status,
        "session": session,
        "uptime_seconds": uptime,
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Catch-all handler that forwards everything else through the session.
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
