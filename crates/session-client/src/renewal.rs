//! Renewal operation: single-flight refresh token exchange
//!
//! Both the refresh scheduler (ahead of expiry) and the request pipeline
//! (after a 401) call `Renewal::renew`. Whichever arrives first starts an
//! episode; everyone arriving while it is pending receives a clone of the
//! same shared outcome. The backend rotates and blacklists refresh tokens, so
//! a second concurrent exchange with the same refresh token would be rejected
//! and force a needless logout.
//!
//! The exchange runs in its own spawned task. Dropping every waiter does not
//! cancel it, and its result is still committed to the store, unless the
//! store epoch moved on (logout or a new login) while it was in flight, in
//! which case the result is discarded.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use reqwest::Url;
use session_auth::{CredentialPair, RefreshResponse};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::store::CredentialStore;

/// Outcome of one renewal episode: `true` if a new pair was installed.
pub type RenewalFuture = Shared<BoxFuture<'static, bool>>;

/// The backend calls a renewal needs.
///
/// Uses `Pin<Box<dyn Future>>` return types so the session can hold an
/// `Arc<dyn TokenExchange>`.
pub trait TokenExchange: Send + Sync {
    /// Exchange a refresh token for a new access token (and possibly a
    /// rotated refresh token).
    fn refresh<'a>(
        &'a self,
        refresh: &'a str,
    ) -> Pin<Box<dyn Future<Output = session_auth::Result<RefreshResponse>> + Send + 'a>>;

    /// Revoke a refresh token on logout. Best effort.
    fn revoke<'a>(
        &'a self,
        refresh: &'a str,
    ) -> Pin<Box<dyn Future<Output = session_auth::Result<()>> + Send + 'a>>;
}

/// `TokenExchange` over the backend's HTTP token endpoints.
pub struct HttpTokenExchange {
    client: reqwest::Client,
    base: Url,
}

impl HttpTokenExchange {
    pub fn new(client: reqwest::Client, base: Url) -> Self {
        Self { client, base }
    }
}

impl TokenExchange for HttpTokenExchange {
    fn refresh<'a>(
        &'a self,
        refresh: &'a str,
    ) -> Pin<Box<dyn Future<Output = session_auth::Result<RefreshResponse>> + Send + 'a>> {
        Box::pin(session_auth::refresh_token(&self.client, &self.base, refresh))
    }

    fn revoke<'a>(
        &'a self,
        refresh: &'a str,
    ) -> Pin<Box<dyn Future<Output = session_auth::Result<()>> + Send + 'a>> {
        Box::pin(session_auth::blacklist(&self.client, &self.base, refresh))
    }
}

struct Episode {
    id: u64,
    outcome: RenewalFuture,
}

/// Collapsing refresh operation shared by the scheduler and the pipeline.
pub struct Renewal {
    store: Arc<CredentialStore>,
    exchange: Arc<dyn TokenExchange>,
    in_flight: Arc<Mutex<Option<Episode>>>,
    next_episode: AtomicU64,
    runtime: Handle,
}

impl Renewal {
    /// Must be called from within a Tokio runtime; episodes are spawned on it.
    pub fn new(store: Arc<CredentialStore>, exchange: Arc<dyn TokenExchange>) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| Error::Runtime(e.to_string()))?;
        Ok(Self {
            store,
            exchange,
            in_flight: Arc::new(Mutex::new(None)),
            next_episode: AtomicU64::new(1),
            runtime,
        })
    }

    /// Start a renewal, or join the one already in flight.
    ///
    /// The exchange starts before this returns; awaiting the returned future
    /// is only needed to observe the outcome.
    pub fn renew(&self) -> RenewalFuture {
        let mut slot = lock(&self.in_flight);
        if let Some(episode) = slot.as_ref() {
            debug!(episode = episode.id, "joining in-flight renewal");
            metrics::counter!("session_renewal_joins_total").increment(1);
            return episode.outcome.clone();
        }

        let (pair, epoch) = self.store.snapshot();
        let Some(pair) = pair else {
            debug!("no refresh credential, renewal fails without exchange");
            record_outcome("no_credential");
            return futures_util::future::ready(false).boxed().shared();
        };

        let id = self.next_episode.fetch_add(1, Ordering::Relaxed);
        debug!(episode = id, epoch, "starting renewal");

        let task = self.runtime.spawn(run_episode(
            self.store.clone(),
            self.exchange.clone(),
            self.in_flight.clone(),
            id,
            epoch,
            pair,
        ));
        let outcome = async move { task.await.unwrap_or(false) }.boxed().shared();
        *slot = Some(Episode {
            id,
            outcome: outcome.clone(),
        });
        outcome
    }

    /// Whether an exchange is currently pending.
    pub fn is_in_flight(&self) -> bool {
        lock(&self.in_flight).is_some()
    }

    pub(crate) fn exchange(&self) -> &Arc<dyn TokenExchange> {
        &self.exchange
    }
}

async fn run_episode(
    store: Arc<CredentialStore>,
    exchange: Arc<dyn TokenExchange>,
    in_flight: Arc<Mutex<Option<Episode>>>,
    id: u64,
    epoch: u64,
    current: CredentialPair,
) -> bool {
    let release = SlotRelease {
        in_flight: in_flight.as_ref(),
        id,
    };

    // A panicking exchange counts as a failed one
    let result = AssertUnwindSafe(exchange.refresh(current.refresh.expose_str()))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            Err(session_auth::Error::TokenExchange(
                "refresh exchange panicked".into(),
            ))
        });
    let next = match result {
        Ok(response) => {
            // Rotation: keep the previous refresh token unless a new one was issued
            let rotated = response.refresh.is_some();
            let refresh = response
                .refresh
                .unwrap_or_else(|| current.refresh.expose().clone());
            debug!(episode = id, rotated, "refresh exchange succeeded");
            Some(CredentialPair::new(response.access, refresh))
        }
        Err(e) => {
            warn!(episode = id, error = %e, "refresh exchange failed, clearing session");
            None
        }
    };
    let renewed = next.is_some();

    // Commit and release the slot together so a caller arriving afterwards
    // starts a fresh episode against the committed pair.
    let event = {
        let mut slot = lock(release.in_flight);
        let event = store.commit(epoch, next);
        release.clear(&mut slot);
        event
    };

    match event {
        Some(event) => {
            store.notify(event);
            if renewed {
                info!(episode = id, "credentials renewed");
                record_outcome("success");
            } else {
                record_outcome("failure");
            }
            renewed
        }
        None => {
            info!(episode = id, "session changed during renewal, result discarded");
            record_outcome("stale");
            false
        }
    }
}

/// Frees the in-flight slot if the episode task ends without committing,
/// e.g. when it is aborted at runtime shutdown.
struct SlotRelease<'a> {
    in_flight: &'a Mutex<Option<Episode>>,
    id: u64,
}

impl SlotRelease<'_> {
    fn clear(&self, slot: &mut Option<Episode>) {
        if slot.as_ref().is_some_and(|episode| episode.id == self.id) {
            *slot = None;
        }
    }
}

impl Drop for SlotRelease<'_> {
    fn drop(&mut self) {
        let mut slot = lock(self.in_flight);
        self.clear(&mut slot);
    }
}

fn record_outcome(outcome: &'static str) {
    metrics::counter!("session_renewals_total", "outcome" => outcome).increment(1);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use session_auth::MemoryBackend;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Scripted exchange: counts calls, optionally waits on a gate, then
    /// answers from `respond`.
    pub(crate) struct FakeExchange {
        pub calls: AtomicUsize,
        pub revokes: AtomicUsize,
        pub seen: Mutex<Vec<String>>,
        gate: Option<Semaphore>,
        respond: Box<dyn Fn(&str, usize) -> session_auth::Result<RefreshResponse> + Send + Sync>,
    }

    impl FakeExchange {
        pub fn new(
            respond: impl Fn(&str, usize) -> session_auth::Result<RefreshResponse>
            + Send
            + Sync
            + 'static,
        ) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                revokes: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
                gate: None,
                respond: Box::new(respond),
            }
        }

        /// Hold every exchange until `release` is called.
        pub fn gated(mut self) -> Self {
            self.gate = Some(Semaphore::new(0));
            self
        }

        pub fn release(&self) {
            if let Some(gate) = &self.gate {
                gate.add_permits(1000);
            }
        }

        /// Always succeeds, rotating `rt_N` and issuing an access token that
        /// expires in `ttl_secs`.
        pub fn rotating(ttl_secs: u64) -> Self {
            Self::new(move |_, n| {
                let exp = session_auth::now_millis() / 1000 + ttl_secs;
                Ok(RefreshResponse {
                    access: session_auth::expiry::unsigned_token_with_exp(exp),
                    refresh: Some(format!("rt_{n}")),
                })
            })
        }

        /// Always rejects the refresh token.
        pub fn rejecting() -> Self {
            Self::new(|_, _| {
                Err(session_auth::Error::InvalidCredentials(
                    "refresh token rejected (401 Unauthorized): Token is blacklisted".into(),
                ))
            })
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn seen(&self) -> Vec<String> {
            lock(&self.seen).clone()
        }
    }

    impl TokenExchange for FakeExchange {
        fn refresh<'a>(
            &'a self,
            refresh: &'a str,
        ) -> Pin<Box<dyn Future<Output = session_auth::Result<RefreshResponse>> + Send + 'a>>
        {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                lock(&self.seen).push(refresh.to_owned());
                if let Some(gate) = &self.gate {
                    let _permit = gate.acquire().await;
                }
                (self.respond)(refresh, n)
            })
        }

        fn revoke<'a>(
            &'a self,
            _refresh: &'a str,
        ) -> Pin<Box<dyn Future<Output = session_auth::Result<()>> + Send + 'a>> {
            Box::pin(async move {
                self.revokes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    fn store_with(pair: Option<CredentialPair>) -> Arc<CredentialStore> {
        let backend = match pair {
            Some(pair) => MemoryBackend::with_pair(pair),
            None => MemoryBackend::new(),
        };
        Arc::new(CredentialStore::load(Box::new(backend)).unwrap())
    }

    #[tokio::test]
    async fn renew_without_refresh_token_skips_exchange() {
        let store = store_with(None);
        let exchange = Arc::new(FakeExchange::rotating(300));
        let renewal = Renewal::new(store, exchange.clone()).unwrap();

        assert!(!renewal.renew().await);
        assert_eq!(exchange.calls(), 0);
    }

    #[tokio::test]
    async fn successful_renewal_installs_rotated_pair() {
        let store = store_with(Some(CredentialPair::new("at_old", "rt_old")));
        let exchange = Arc::new(FakeExchange::rotating(300));
        let renewal = Renewal::new(store.clone(), exchange.clone()).unwrap();

        assert!(renewal.renew().await);

        let pair = store.get().unwrap();
        assert_ne!(pair.access.expose(), "at_old");
        assert_eq!(pair.refresh.expose(), "rt_1");
        assert_eq!(exchange.seen(), ["rt_old"]);
        assert!(!renewal.is_in_flight());
    }

    #[tokio::test]
    async fn renewal_without_rotation_keeps_refresh_token() {
        let store = store_with(Some(CredentialPair::new("at_old", "rt_keep")));
        let exchange = Arc::new(FakeExchange::new(|_, _| {
            Ok(RefreshResponse {
                access: "at_new".into(),
                refresh: None,
            })
        }));
        let renewal = Renewal::new(store.clone(), exchange).unwrap();

        assert!(renewal.renew().await);
        assert_eq!(store.get(), Some(CredentialPair::new("at_new", "rt_keep")));
    }

    #[tokio::test]
    async fn failed_renewal_clears_both_credentials() {
        let store = store_with(Some(CredentialPair::new("at_old", "rt_old")));
        let renewal = Renewal::new(store.clone(), Arc::new(FakeExchange::rejecting())).unwrap();

        assert!(!renewal.renew().await);
        assert!(store.get().is_none());
    }

    #[tokio::test]
    async fn concurrent_triggers_share_one_exchange() {
        let store = store_with(Some(CredentialPair::new("at_old", "rt_old")));
        let exchange = Arc::new(FakeExchange::rotating(300).gated());
        let renewal = Renewal::new(store.clone(), exchange.clone()).unwrap();

        let waiters: Vec<_> = (0..8).map(|_| renewal.renew()).collect();
        tokio::task::yield_now().await;
        assert!(renewal.is_in_flight());

        exchange.release();
        let outcomes = futures_util::future::join_all(waiters).await;

        assert!(outcomes.into_iter().all(|ok| ok));
        assert_eq!(exchange.calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_failure_is_observed_by_every_waiter() {
        let store = store_with(Some(CredentialPair::new("at_old", "rt_old")));
        let exchange = Arc::new(FakeExchange::rejecting().gated());
        let renewal = Renewal::new(store.clone(), exchange.clone()).unwrap();

        let waiters: Vec<_> = (0..3).map(|_| renewal.renew()).collect();
        exchange.release();
        let outcomes = futures_util::future::join_all(waiters).await;

        assert!(outcomes.into_iter().all(|ok| !ok));
        assert_eq!(exchange.calls(), 1);
        assert!(store.get().is_none());
    }

    #[tokio::test]
    async fn sequential_episodes_each_exchange_once() {
        let store = store_with(Some(CredentialPair::new("at_old", "rt_old")));
        let exchange = Arc::new(FakeExchange::rotating(300));
        let renewal = Renewal::new(store.clone(), exchange.clone()).unwrap();

        assert!(renewal.renew().await);
        assert!(renewal.renew().await);

        assert_eq!(exchange.calls(), 2);
        assert_eq!(exchange.seen(), ["rt_old", "rt_1"]);
    }

    #[tokio::test]
    async fn exchange_completes_when_waiters_are_dropped() {
        let store = store_with(Some(CredentialPair::new("at_old", "rt_old")));
        let exchange = Arc::new(FakeExchange::rotating(300).gated());
        let renewal = Renewal::new(store.clone(), exchange.clone()).unwrap();

        drop(renewal.renew());
        exchange.release();

        for _ in 0..50 {
            if !renewal.is_in_flight() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.get().unwrap().refresh.expose(), "rt_1");
    }

    #[tokio::test]
    async fn result_is_discarded_after_logout() {
        let store = store_with(Some(CredentialPair::new("at_old", "rt_old")));
        let exchange = Arc::new(FakeExchange::rotating(300).gated());
        let renewal = Renewal::new(store.clone(), exchange.clone()).unwrap();

        let pending = renewal.renew();
        tokio::task::yield_now().await;
        store.clear();
        exchange.release();

        assert!(!pending.await);
        assert!(store.get().is_none());
    }

    #[tokio::test]
    async fn failure_does_not_clear_a_fresh_login() {
        let store = store_with(Some(CredentialPair::new("at_old", "rt_old")));
        let exchange = Arc::new(FakeExchange::rejecting().gated());
        let renewal = Renewal::new(store.clone(), exchange.clone()).unwrap();

        let pending = renewal.renew();
        tokio::task::yield_now().await;
        store.set(CredentialPair::new("at_login", "rt_login"));
        exchange.release();

        assert!(!pending.await);
        assert_eq!(store.get(), Some(CredentialPair::new("at_login", "rt_login")));
    }

    #[tokio::test]
    async fn panicking_exchange_fails_the_episode_and_frees_the_slot() {
        let store = store_with(Some(CredentialPair::new("at_old", "rt_old")));
        let exchange = Arc::new(FakeExchange::new(|_, n| {
            if n == 1 {
                panic!("exchange blew up");
            }
            Ok(RefreshResponse {
                access: "at_new".into(),
                refresh: Some(format!("rt_{n}")),
            })
        }));
        let renewal = Renewal::new(store.clone(), exchange.clone()).unwrap();

        assert!(!renewal.renew().await);
        assert!(!renewal.is_in_flight());
        assert!(store.get().is_none(), "failed episode clears the session");

        store.set(CredentialPair::new("at_login", "rt_login"));
        assert!(renewal.renew().await);
        assert_eq!(exchange.calls(), 2);
        assert_eq!(store.get(), Some(CredentialPair::new("at_new", "rt_2")));
    }

    #[test]
    fn new_outside_runtime_is_an_error() {
        let store = store_with(None);
        let result = Renewal::new(store, Arc::new(FakeExchange::rejecting()));
        assert!(matches!(result, Err(Error::Runtime(_))));
    }
}
