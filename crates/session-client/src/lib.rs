//! Authenticated API session with proactive and reactive token renewal
//!
//! A `Session` owns one credential pair and keeps it valid:
//!
//! 1. Login installs the pair in the `CredentialStore` (persisted through a
//!    `CredentialBackend`)
//! 2. The `RefreshScheduler` arms a timer for `exp - lead_time`
//! 3. When it fires, the `Renewal` operation exchanges the refresh token and
//!    installs the new pair, which re-arms the timer
//! 4. `ApiClient` attaches the access token to every request; on 401 it joins
//!    (or starts) a renewal and replays the request once
//! 5. A failed exchange clears the store; callers see
//!    `Error::requires_login()`
//!
//! Renewals are single-flight: any number of concurrent triggers, from the
//! timer or from 401s, share one exchange.

pub mod client;
pub mod error;
pub mod renewal;
pub mod scheduler;
pub mod session;
pub mod store;

pub use client::{ApiClient, ApiRequest};
pub use error::{Error, Result};
pub use renewal::{HttpTokenExchange, Renewal, RenewalFuture, TokenExchange};
pub use scheduler::RefreshScheduler;
pub use session::{Session, SessionConfig, SessionStatus};
pub use store::{CredentialListener, CredentialStore};
