//! Backend endpoint paths and session constants
//!
//! Paths are relative to the configured API base URL (which ends in `/api/`
//! on the reference backend). Storage keys match the keys the web client
//! used in browser local storage so a credential file can be inspected with
//! the same names.

use std::time::Duration;

/// Login endpoint: `{email, password}` -> `{access, refresh}`
pub const LOGIN_PATH: &str = "login/";

/// TOTP second factor: `{totp_code, email}` -> `{access, refresh, ...}`
pub const VERIFY_TWO_FACTOR_PATH: &str = "verify-2fa/";

/// Refresh endpoint: `{refresh}` -> `{access}` or `{access, refresh}`
pub const REFRESH_PATH: &str = "token/refresh/";

/// Refresh token revocation on logout: `{refresh}`
pub const BLACKLIST_PATH: &str = "token/blacklist/";

/// Persisted key holding the access credential
pub const ACCESS_TOKEN_KEY: &str = "accessToken";

/// Persisted key holding the refresh credential
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";

/// How long before access token expiry the scheduler renews it.
pub const RENEWAL_LEAD_TIME: Duration = Duration::from_secs(60);
