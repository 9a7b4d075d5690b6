//! Error types for session and pipeline operations

/// Errors from authenticated API calls and session management.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport failure (connect, timeout, body read). Never retried here.
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// The backend answered with a non-success status.
    ///
    /// `requires_login` is set when a 401 could not be recovered by renewing
    /// the credential pair; the store has been cleared and the caller must
    /// authenticate again.
    #[error("backend returned {status}: {body}")]
    Status {
        status: u16,
        body: String,
        requires_login: bool,
    },

    #[error("authentication failed: {0}")]
    Auth(#[from] session_auth::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("credential store error: {0}")]
    Credential(String),

    #[error("no async runtime: {0}")]
    Runtime(String),
}

impl Error {
    /// Whether the caller has to log in again before retrying.
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            Error::Status {
                requires_login: true,
                ..
            }
        )
    }

    /// HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Status { status, .. } => Some(*status),
            Error::Auth(e) => e.status(),
            _ => None,
        }
    }
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;
