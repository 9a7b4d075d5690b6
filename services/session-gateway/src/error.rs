//! Service-specific error types

use thiserror::Error;

/// Gateway startup errors.
///
/// Per-request failures are turned into HTTP responses by the proxy and
/// admin handlers; they never propagate as Rust errors.
#[derive(Error, Debug)]
pub enum Error {
    #[error("credential file {path} unusable: {source}")]
    CredentialFile {
        path: String,
        #[source]
        source: session_auth::Error,
    },

    #[error("invalid backend URL: {0}")]
    BaseUrl(#[from] session_auth::Error),

    #[error("session setup failed: {0}")]
    Session(#[from] session_client::Error),

    #[error("startup login for {identifier} has no secret, set SESSION_SECRET or login.secret_file")]
    MissingSecret { identifier: String },
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;
