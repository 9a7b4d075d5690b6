//! Session authentication wire contract
//!
//! Provides the backend token endpoint calls (login, two-factor verification,
//! refresh, blacklist), credential persistence backends, and the access token
//! expiry estimator. This crate has no notion of scheduling or request
//! replay; `session-client` builds the live session on top of it.
//!
//! Credential flow:
//! 1. Caller logs in via `token::login()` (or `token::verify_two_factor()`)
//! 2. The returned pair is persisted through a `CredentialBackend`
//! 3. `expiry::expiry_of()` tells the scheduler when to renew
//! 4. Renewal calls `token::refresh_token()` with the refresh credential
//! 5. On logout, `token::blacklist()` revokes the refresh credential

pub mod constants;
pub mod credentials;
pub mod error;
pub mod expiry;
pub mod token;

pub use constants::*;
pub use credentials::{CredentialBackend, CredentialPair, FileBackend, MemoryBackend};
pub use error::{Error, Result};
pub use expiry::{expiry_of, expiry_of_millis, now_millis};
pub use token::{
    LoginResponse, RefreshResponse, TwoFactorResponse, blacklist, endpoint, login, parse_base_url,
    refresh_token, verify_two_factor,
};
