//! Proactive refresh scheduling
//!
//! One timer per session. Arming computes `expiry - lead_time` from the
//! access token's `exp` claim and spawns a sleep that triggers the renewal
//! operation when it fires. A successful renewal installs a new pair, the
//! store notifies the scheduler, and the scheduler re-arms for the new token,
//! so the chain lasts as long as the session. A failed renewal clears the
//! store, which disarms; there are no automatic retries after that.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use session_auth::{CredentialPair, expiry_of};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::renewal::Renewal;
use crate::store::CredentialListener;

struct ArmedTimer {
    handle: JoinHandle<()>,
    deadline: SystemTime,
}

pub struct RefreshScheduler {
    renewal: Arc<Renewal>,
    lead_time: Duration,
    timer: Mutex<Option<ArmedTimer>>,
    runtime: Handle,
}

impl RefreshScheduler {
    /// Must be called from within a Tokio runtime; timers are spawned on it.
    pub fn new(renewal: Arc<Renewal>, lead_time: Duration) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| Error::Runtime(e.to_string()))?;
        Ok(Self {
            renewal,
            lead_time,
            timer: Mutex::new(None),
            runtime,
        })
    }

    /// Schedule renewal of `access` ahead of its expiry.
    ///
    /// Replaces any armed timer. If the renewal deadline has already passed
    /// (including undecodable tokens, which count as expired) the renewal is
    /// started immediately instead.
    pub fn arm(&self, access: &str) {
        let mut timer = lock(&self.timer);
        if let Some(previous) = timer.take() {
            previous.handle.abort();
        }

        let deadline = expiry_of(access)
            .checked_sub(self.lead_time)
            .unwrap_or(UNIX_EPOCH);
        let delay = deadline
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);

        if delay.is_zero() {
            drop(timer);
            warn!("access token is inside the renewal window, renewing now");
            // Started synchronously; the outcome arrives through the store.
            drop(self.renewal.renew());
            return;
        }

        debug!(delay_secs = delay.as_secs(), "renewal timer armed");
        let renewal = self.renewal.clone();
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            debug!("renewal timer fired");
            drop(renewal.renew());
        });
        *timer = Some(ArmedTimer { handle, deadline });
    }

    /// Cancel the pending timer. Does not cancel an exchange already in flight.
    pub fn disarm(&self) {
        if let Some(previous) = lock(&self.timer).take() {
            previous.handle.abort();
            debug!("renewal timer disarmed");
        }
    }

    /// Whether a timer is waiting to fire.
    pub fn is_armed(&self) -> bool {
        lock(&self.timer)
            .as_ref()
            .is_some_and(|timer| !timer.handle.is_finished())
    }

    /// When the armed timer fires, if one is waiting.
    pub fn deadline(&self) -> Option<SystemTime> {
        lock(&self.timer)
            .as_ref()
            .filter(|timer| !timer.handle.is_finished())
            .map(|timer| timer.deadline)
    }

    pub fn lead_time(&self) -> Duration {
        self.lead_time
    }
}

impl CredentialListener for RefreshScheduler {
    fn credentials_set(&self, pair: &CredentialPair) {
        self.arm(pair.access.expose_str());
    }

    fn credentials_cleared(&self) {
        self.disarm();
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.timer).take() {
            timer.handle.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
