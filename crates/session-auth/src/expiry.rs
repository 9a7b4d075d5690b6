//! Access token expiry estimation
//!
//! Access tokens are JWTs: three `.`-separated base64url segments, the middle
//! one a JSON claims object carrying `exp` in seconds since the unix epoch.
//! The signature is not checked; the backend does that. We only need the
//! claim to decide when to renew.
//!
//! Decoding fails soft. Anything unreadable is reported as expiring "now",
//! which makes the scheduler renew immediately instead of erroring out.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use tracing::debug;

/// Expiry instant of `access`, or `SystemTime::now()` if it can't be decoded.
pub fn expiry_of(access: &str) -> SystemTime {
    match decode_exp(access) {
        // Out of range for this platform's clock: treat as undecodable
        Some(exp_millis) => UNIX_EPOCH
            .checked_add(Duration::from_millis(exp_millis))
            .unwrap_or_else(SystemTime::now),
        None => SystemTime::now(),
    }
}

/// Expiry of `access` as unix milliseconds, or the current time if it can't
/// be decoded.
pub fn expiry_of_millis(access: &str) -> u64 {
    decode_exp(access).unwrap_or_else(now_millis)
}

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn decode_exp(access: &str) -> Option<u64> {
    let mut segments = access.split('.');
    let (_header, payload) = (segments.next()?, segments.next()?);
    if segments.next().is_none() {
        debug!("access token is not a three-segment JWT");
        return None;
    }

    let bytes = match URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!(error = %e, "access token payload is not base64url");
            return None;
        }
    };
    let claims: serde_json::Value = match serde_json::from_slice(&bytes) {
        Ok(claims) => claims,
        Err(e) => {
            debug!(error = %e, "access token payload is not JSON");
            return None;
        }
    };

    let exp = claims.get("exp")?;
    let seconds = exp
        .as_u64()
        .or_else(|| exp.as_f64().filter(|s| s.is_finite() && *s >= 0.0).map(|s| s as u64))?;
    seconds.checked_mul(1000)
}

/// Build an unsigned JWT-shaped token with the given `exp`. Test helper shared
/// with `session-client`.
#[doc(hidden)]
pub fn unsigned_token_with_exp(exp_secs: u64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let claims = serde_json::json!({ "token_type": "access", "exp": exp_secs, "user_id": 1 });
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
    format!("{header}.{payload}.sig")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_exp_claim_to_millis() {
        let token = unsigned_token_with_exp(1_735_500_000);
        assert_eq!(expiry_of_millis(&token), 1_735_500_000_000);
        assert_eq!(
            expiry_of(&token),
            UNIX_EPOCH + Duration::from_secs(1_735_500_000)
        );
    }

    #[test]
    fn accepts_padded_payload() {
        let token = unsigned_token_with_exp(1_800_000_000);
        let mut parts: Vec<String> = token.split('.').map(str::to_owned).collect();
        parts[1].push_str("==");
        let padded = parts.join(".");
        assert_eq!(expiry_of_millis(&padded), 1_800_000_000_000);
    }

    #[test]
    fn malformed_token_is_treated_as_expired() {
        let before = SystemTime::now();
        for token in ["", "opaque", "a.b", "a.!!!.c", "a.bm90LWpzb24.c"] {
            let expiry = expiry_of(token);
            assert!(expiry >= before, "{token:?} should expire now");
            assert!(expiry <= SystemTime::now(), "{token:?} should not be in the future");
        }
    }

    #[test]
    fn huge_exp_claim_does_not_panic() {
        let token = unsigned_token_with_exp(u64::MAX / 1000);
        let expiry = expiry_of(&token);
        let century = Duration::from_secs(100 * 365 * 24 * 3600);
        assert!(expiry > SystemTime::now() + century || expiry <= SystemTime::now());

        let overflowing = unsigned_token_with_exp(u64::MAX);
        assert!(expiry_of(&overflowing) <= SystemTime::now());
    }

    #[test]
    fn missing_exp_claim_is_treated_as_expired() {
        let payload = URL_SAFE_NO_PAD.encode(br#"{"user_id":7}"#);
        let token = format!("h.{payload}.s");
        assert!(expiry_of(&token) <= SystemTime::now());
    }

    #[test]
    fn non_numeric_exp_is_treated_as_expired() {
        let payload = URL_SAFE_NO_PAD.encode(br#"{"exp":"tomorrow"}"#);
        let token = format!("h.{payload}.s");
        let now = now_millis();
        assert!(expiry_of_millis(&token) >= now);
        assert!(expiry_of_millis(&token) <= now_millis());
    }
}
