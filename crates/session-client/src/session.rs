//! Session façade
//!
//! Wires the credential store, renewal operation, refresh scheduler and API
//! client together once, at construction, and exposes the login lifecycle.

use std::sync::{Arc, Weak};
use std::time::{Duration, UNIX_EPOCH};

use reqwest::Url;
use serde::Serialize;
use session_auth::{CredentialBackend, RENEWAL_LEAD_TIME, expiry_of};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::client::ApiClient;
use crate::error::{Error, Result};
use crate::renewal::{HttpTokenExchange, Renewal, RenewalFuture, TokenExchange};
use crate::scheduler::RefreshScheduler;
use crate::store::{CredentialListener, CredentialStore};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// API base URL; endpoint paths are resolved against it.
    pub base_url: Url,
    /// How long before access token expiry the scheduler renews.
    pub renewal_lead_time: Duration,
    /// Per-request timeout for the underlying HTTP client.
    pub request_timeout: Duration,
}

impl SessionConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            renewal_lead_time: RENEWAL_LEAD_TIME,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Snapshot for health reporting. Never carries token material.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionStatus {
    pub authenticated: bool,
    pub renewal_armed: bool,
    pub renewal_in_flight: bool,
    /// Unix seconds, from the access token's `exp` claim.
    pub access_expires_at: Option<u64>,
    /// Unix seconds at which the armed timer fires.
    pub renew_at: Option<u64>,
}

/// One authenticated application session.
pub struct Session {
    http: reqwest::Client,
    base: Url,
    store: Arc<CredentialStore>,
    renewal: Arc<Renewal>,
    scheduler: Arc<RefreshScheduler>,
    client: ApiClient,
    runtime: Handle,
}

impl Session {
    /// Build a session over `backend`, using the backend's HTTP token endpoints.
    ///
    /// Must be called from within a Tokio runtime. A persisted pair is restored
    /// and scheduled immediately.
    pub fn new(config: SessionConfig, backend: Box<dyn CredentialBackend>) -> Result<Self> {
        let http = build_http_client(config.request_timeout)?;
        let exchange = Arc::new(HttpTokenExchange::new(http.clone(), config.base_url.clone()));
        Self::assemble(config, backend, http, exchange)
    }

    /// Like `new`, with a caller-supplied token exchange.
    pub fn with_exchange(
        config: SessionConfig,
        backend: Box<dyn CredentialBackend>,
        exchange: Arc<dyn TokenExchange>,
    ) -> Result<Self> {
        let http = build_http_client(config.request_timeout)?;
        Self::assemble(config, backend, http, exchange)
    }

    fn assemble(
        config: SessionConfig,
        backend: Box<dyn CredentialBackend>,
        http: reqwest::Client,
        exchange: Arc<dyn TokenExchange>,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| Error::Runtime(e.to_string()))?;
        let store = Arc::new(CredentialStore::load(backend)?);
        let renewal = Arc::new(Renewal::new(store.clone(), exchange)?);
        let scheduler = Arc::new(RefreshScheduler::new(
            renewal.clone(),
            config.renewal_lead_time,
        )?);

        let listener: Weak<dyn CredentialListener> =
            Arc::downgrade(&scheduler) as Weak<dyn CredentialListener>;
        store.set_listener(listener);

        if let Some(pair) = store.get() {
            info!("restored persisted session");
            scheduler.arm(pair.access.expose_str());
        }

        let client = ApiClient::new(
            http.clone(),
            config.base_url.clone(),
            store.clone(),
            renewal.clone(),
        );

        Ok(Self {
            http,
            base: config.base_url,
            store,
            renewal,
            scheduler,
            client,
            runtime,
        })
    }

    /// Log in with identifier and secret and install the issued pair.
    pub async fn login(&self, identifier: &str, secret: &str) -> Result<()> {
        let response = match session_auth::login(&self.http, &self.base, identifier, secret).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "login failed");
                metrics::counter!("session_logins_total", "outcome" => "failure").increment(1);
                return Err(e.into());
            }
        };
        self.store.set(response.into_pair());
        info!("logged in");
        metrics::counter!("session_logins_total", "outcome" => "success").increment(1);
        Ok(())
    }

    /// Submit a TOTP code. Returns whether a session was established.
    pub async fn verify_two_factor(&self, totp_code: &str, email: &str) -> Result<bool> {
        let response =
            session_auth::verify_two_factor(&self.http, &self.base, totp_code, email).await?;
        match response.pair() {
            Some(pair) => {
                self.store.set(pair);
                info!("second factor verified, logged in");
                Ok(true)
            }
            None => {
                debug!("second factor accepted without issuing tokens");
                Ok(false)
            }
        }
    }

    /// End the session locally and revoke the refresh token in the background.
    ///
    /// Revocation is best effort; the local session is gone either way.
    pub fn logout(&self) {
        if let Some(pair) = self.store.get() {
            let exchange = self.renewal.exchange().clone();
            let refresh = pair.refresh;
            self.runtime.spawn(async move {
                if let Err(e) = exchange.revoke(refresh.expose_str()).await {
                    debug!(error = %e, "refresh token revocation failed");
                }
            });
        }
        self.store.clear();
        self.scheduler.disarm();
        info!("logged out");
    }

    /// Force a renewal now, or join the one in flight.
    pub fn refresh_now(&self) -> RenewalFuture {
        self.renewal.renew()
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<RefreshScheduler> {
        &self.scheduler
    }

    pub fn is_authenticated(&self) -> bool {
        self.store.is_present()
    }

    pub fn status(&self) -> SessionStatus {
        let access_expires_at = self.store.get().map(|pair| {
            expiry_of(pair.access.expose_str())
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0)
        });
        let renew_at = self
            .scheduler
            .deadline()
            .and_then(|deadline| deadline.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs());

        SessionStatus {
            authenticated: access_expires_at.is_some(),
            renewal_armed: self.scheduler.is_armed(),
            renewal_in_flight: self.renewal.is_in_flight(),
            access_expires_at,
            renew_at,
        }
    }
}

fn build_http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Http(format!("building HTTP client: {e}")))
}
