//! Credential store: the single shared mutable session resource
//!
//! Holds the current credential pair in memory and writes through to a
//! `CredentialBackend`. Reads and writes are synchronous and strongly
//! ordered: a `get` issued after `set` returns always sees the new pair.
//!
//! Every mutation bumps an epoch. A renewal episode records the epoch when it
//! starts and only commits its result if nothing else (logout, a fresh login)
//! changed the store in between.
//!
//! `set`/`clear` notify the registered `CredentialListener` (the refresh
//! scheduler) synchronously, after the state lock is released.

use std::sync::{Mutex, MutexGuard, PoisonError, Weak};

use session_auth::{CredentialBackend, CredentialPair};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Observer of credential changes.
pub trait CredentialListener: Send + Sync {
    /// A new pair was installed.
    fn credentials_set(&self, pair: &CredentialPair);

    /// The pair was removed.
    fn credentials_cleared(&self);
}

/// Change produced by a committed write, delivered to the listener.
#[derive(Debug, Clone)]
pub(crate) enum StoreEvent {
    Set(CredentialPair),
    Cleared,
}

struct StoreState {
    pair: Option<CredentialPair>,
    epoch: u64,
}

pub struct CredentialStore {
    state: Mutex<StoreState>,
    backend: Box<dyn CredentialBackend>,
    listener: Mutex<Option<Weak<dyn CredentialListener>>>,
}

impl CredentialStore {
    /// Build a store over `backend`, restoring any persisted pair.
    pub fn load(backend: Box<dyn CredentialBackend>) -> Result<Self> {
        let pair = backend
            .load()
            .map_err(|e| Error::Credential(format!("loading persisted credentials: {e}")))?;
        debug!(restored = pair.is_some(), "credential store initialized");
        Ok(Self {
            state: Mutex::new(StoreState { pair, epoch: 0 }),
            backend,
            listener: Mutex::new(None),
        })
    }

    /// Register the observer notified on `set`/`clear`. Replaces any previous one.
    pub fn set_listener(&self, listener: Weak<dyn CredentialListener>) {
        *lock(&self.listener) = Some(listener);
    }

    /// Current pair, if a session is established.
    pub fn get(&self) -> Option<CredentialPair> {
        lock(&self.state).pair.clone()
    }

    /// Whether a pair is present.
    pub fn is_present(&self) -> bool {
        lock(&self.state).pair.is_some()
    }

    /// Mutation counter; changes on every `set`, `clear` and committed renewal.
    pub fn epoch(&self) -> u64 {
        lock(&self.state).epoch
    }

    /// Pair and epoch read under one lock.
    pub(crate) fn snapshot(&self) -> (Option<CredentialPair>, u64) {
        let state = lock(&self.state);
        (state.pair.clone(), state.epoch)
    }

    /// Install a new pair (login or externally obtained tokens).
    pub fn set(&self, pair: CredentialPair) {
        let event = {
            let mut state = lock(&self.state);
            self.write(&mut state, Some(pair))
        };
        self.notify(event);
    }

    /// Remove the pair (logout or unrecoverable renewal failure).
    pub fn clear(&self) {
        let event = {
            let mut state = lock(&self.state);
            self.write(&mut state, None)
        };
        self.notify(event);
    }

    /// Apply a renewal outcome if the store is still at `epoch`.
    ///
    /// Returns the event to deliver, or `None` when the write was discarded
    /// because the store changed since the episode started. The caller
    /// delivers the event with `notify` once it has released its own locks.
    pub(crate) fn commit(&self, epoch: u64, next: Option<CredentialPair>) -> Option<StoreEvent> {
        let mut state = lock(&self.state);
        if state.epoch != epoch {
            debug!(
                expected = epoch,
                current = state.epoch,
                "store changed during renewal, discarding result"
            );
            return None;
        }
        Some(self.write(&mut state, next))
    }

    /// Deliver a change to the listener.
    pub(crate) fn notify(&self, event: StoreEvent) {
        let listener = lock(&self.listener).as_ref().and_then(Weak::upgrade);
        let Some(listener) = listener else {
            return;
        };
        match event {
            StoreEvent::Set(pair) => listener.credentials_set(&pair),
            StoreEvent::Cleared => listener.credentials_cleared(),
        }
    }

    fn write(&self, state: &mut StoreState, next: Option<CredentialPair>) -> StoreEvent {
        state.epoch += 1;
        // Persistence failures are logged; the in-memory pair stays authoritative.
        let event = match next {
            Some(pair) => {
                if let Err(e) = self.backend.save(&pair) {
                    warn!(error = %e, "failed to persist credentials");
                }
                state.pair = Some(pair.clone());
                StoreEvent::Set(pair)
            }
            None => {
                if let Err(e) = self.backend.clear() {
                    warn!(error = %e, "failed to clear persisted credentials");
                }
                state.pair = None;
                StoreEvent::Cleared
            }
        };
        debug!(epoch = state.epoch, present = state.pair.is_some(), "credential store updated");
        event
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
