//! Backend token endpoint calls
//!
//! Handles the four token endpoint interactions:
//! 1. Login with identifier + secret
//! 2. TOTP second-factor verification (also returns a pair on success)
//! 3. Token refresh (proactive and 401-driven)
//! 4. Refresh token blacklisting on logout
//!
//! All four POST JSON to paths under the configured API base URL. None of
//! them attach a bearer credential; they are the calls that produce one.

use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{BLACKLIST_PATH, LOGIN_PATH, REFRESH_PATH, VERIFY_TWO_FACTOR_PATH};
use crate::credentials::CredentialPair;
use crate::error::{Error, Result};

/// Response from the login endpoint.
#[derive(Debug, Deserialize, Serialize)]
pub struct LoginResponse {
    pub access: String,
    pub refresh: String,
}

impl LoginResponse {
    pub fn into_pair(self) -> CredentialPair {
        CredentialPair::new(self.access, self.refresh)
    }
}

/// Response from the refresh endpoint.
///
/// `refresh` is present only when the backend rotates refresh tokens.
#[derive(Debug, Deserialize, Serialize)]
pub struct RefreshResponse {
    pub access: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<String>,
}

/// Response from the second-factor endpoint.
///
/// Tokens are only issued when verification completes the login; other
/// fields are passed through for the caller.
#[derive(Debug, Deserialize, Serialize)]
pub struct TwoFactorResponse {
    #[serde(default)]
    pub access: Option<String>,
    #[serde(default)]
    pub refresh: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TwoFactorResponse {
    /// The issued pair, if verification returned both tokens.
    pub fn pair(&self) -> Option<CredentialPair> {
        match (&self.access, &self.refresh) {
            (Some(access), Some(refresh)) => Some(CredentialPair::new(access, refresh)),
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct TwoFactorRequest<'a> {
    totp_code: &'a str,
    email: &'a str,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

/// Parse and normalize an API base URL.
///
/// Endpoint paths are joined relative to the base, so the base must end in
/// `/` or the last path segment would be replaced.
pub fn parse_base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw).map_err(|e| Error::BaseUrl(format!("{raw}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::BaseUrl(format!(
            "{raw}: scheme must be http or https"
        )));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Resolve an endpoint path against the base URL.
///
/// The result must stay on the base's origin and under its path: absolute
/// URLs and `..` segments that leave the base are rejected, since requests to
/// the resolved URL carry the session credential.
pub fn endpoint(base: &Url, path: &str) -> Result<Url> {
    let url = base
        .join(path.trim_start_matches('/'))
        .map_err(|e| Error::BaseUrl(format!("joining {path}: {e}")))?;
    let same_origin = url.scheme() == base.scheme()
        && url.host_str() == base.host_str()
        && url.port_or_known_default() == base.port_or_known_default();
    if !same_origin || !url.path().starts_with(base.path()) {
        return Err(Error::OutsideBase(path.to_owned()));
    }
    Ok(url)
}

/// Exchange identifier + secret for a credential pair.
pub async fn login(
    client: &reqwest::Client,
    base: &Url,
    identifier: &str,
    secret: &str,
) -> Result<LoginResponse> {
    let url = endpoint(base, LOGIN_PATH)?;
    let response = client
        .post(url)
        .json(&LoginRequest {
            email: identifier,
            password: secret,
        })
        .send()
        .await
        .map_err(|e| Error::Http(format!("login request failed: {e}")))?;

    let response = reject_unless_success(response).await?;
    response
        .json::<LoginResponse>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid login response: {e}")))
}

/// Complete a login with a TOTP code.
pub async fn verify_two_factor(
    client: &reqwest::Client,
    base: &Url,
    totp_code: &str,
    email: &str,
) -> Result<TwoFactorResponse> {
    let url = endpoint(base, VERIFY_TWO_FACTOR_PATH)?;
    let response = client
        .post(url)
        .json(&TwoFactorRequest { totp_code, email })
        .send()
        .await
        .map_err(|e| Error::Http(format!("2FA verification request failed: {e}")))?;

    let response = reject_unless_success(response).await?;
    response
        .json::<TwoFactorResponse>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid 2FA response: {e}")))
}

/// Exchange a refresh token for a new access token.
///
/// Called by the renewal operation, both ahead of expiry and after a 401.
pub async fn refresh_token(
    client: &reqwest::Client,
    base: &Url,
    refresh: &str,
) -> Result<RefreshResponse> {
    let url = endpoint(base, REFRESH_PATH)?;
    let response = client
        .post(url)
        .json(&RefreshRequest { refresh })
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let message = error_message(response).await;

        // 401/403 means the refresh token is expired, blacklisted or rotated away
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidCredentials(format!(
                "refresh token rejected ({status}): {message}"
            )));
        }

        return Err(Error::TokenExchange(format!(
            "token refresh returned {status}: {message}"
        )));
    }

    response
        .json::<RefreshResponse>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid refresh response: {e}")))
}

/// Revoke a refresh token. Callers treat this as best effort.
pub async fn blacklist(client: &reqwest::Client, base: &Url, refresh: &str) -> Result<()> {
    let url = endpoint(base, BLACKLIST_PATH)?;
    let response = client
        .post(url)
        .json(&RefreshRequest { refresh })
        .send()
        .await
        .map_err(|e| Error::Http(format!("token blacklist request failed: {e}")))?;

    reject_unless_success(response).await?;
    debug!("refresh token blacklisted");
    Ok(())
}

async fn reject_unless_success(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(Error::Rejected {
        status: status.as_u16(),
        message: error_message(response).await,
    })
}

/// Extract a readable message from an error response.
///
/// The backend answers with `{"error": "..."}` or `{"detail": "..."}`; other
/// bodies are returned verbatim.
async fn error_message(response: reqwest::Response) -> String {
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<no body>"));
    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(json) => json
            .get("error")
            .or_else(|| json.get("detail"))
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .unwrap_or(body),
        Err(_) => body,
    }
}
