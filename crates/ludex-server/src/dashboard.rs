//! Dashboard password authentication and session tokens.
//!
//! Single-tenant: one password per server instance, registered once. The
//! password is stretched with scrypt under a fresh random salt; login
//! re-derives with the stored salt and compares in constant time. Session
//! tokens are high-entropy random values the server only checks for
//! existence. No expiry unless someone logs the token out.

use axum::http::HeaderMap;
use rand::Rng;
use scrypt::Params;
use subtle::ConstantTimeEq;

use crate::error::ApiError;
use crate::state::AppState;

/// Key under which the password record is persisted.
const PASSWORD_KEY: &str = "dashboard_password";

/// scrypt cost parameters for an interactive login (N = 2^15, r = 8, p = 1).
const SCRYPT_LOG_N: u8 = 15;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;
const DERIVED_LEN: usize = 32;
const SALT_LEN: usize = 16;

const MIN_PASSWORD_LEN: usize = 8;

/// Register the instance password. A second registration is rejected;
/// changing the password means wiping the record out of band.
pub fn register_password(state: &AppState, password: &str) -> Result<(), ApiError> {
    if password.len() < MIN_PASSWORD_LEN {
        return Err(ApiError::Validation(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }

    if state.db.get_state(PASSWORD_KEY)?.is_some() {
        return Err(ApiError::Conflict(
            "a dashboard password is already registered for this instance".into(),
        ));
    }

    let salt: [u8; SALT_LEN] = rand::rng().random();
    let derived = derive(password, &salt, SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P)?;

    // Record carries its own parameters so the cost can be raised later
    // without invalidating existing installs.
    let record = format!(
        "{SCRYPT_LOG_N}:{SCRYPT_R}:{SCRYPT_P}:{}:{}",
        hex::encode(salt),
        hex::encode(derived)
    );
    state.db.set_state(PASSWORD_KEY, &record)?;

    tracing::info!("dashboard password registered");
    Ok(())
}

/// Verify the password and mint a new session token.
pub fn login(state: &AppState, password: &str, now_ms: i64) -> Result<String, ApiError> {
    let Some(record) = state.db.get_state(PASSWORD_KEY)? else {
        return Err(ApiError::Unauthorized(
            "no dashboard password registered".into(),
        ));
    };

    let (log_n, r, p, salt, stored) = parse_record(&record)?;
    let derived = derive(password, &salt, log_n, r, p)?;

    if !bool::from(derived.as_slice().ct_eq(stored.as_slice())) {
        return Err(ApiError::Unauthorized("invalid password".into()));
    }

    let token_bytes: [u8; 32] = rand::rng().random();
    let token = hex::encode(token_bytes);
    state.db.insert_dashboard_session(&token, now_ms)?;

    tracing::info!("dashboard login");
    Ok(token)
}

/// Invalidate the presented session token. Returns whether one was removed.
pub fn logout(state: &AppState, headers: &HeaderMap) -> Result<bool, ApiError> {
    let Some(token) = bearer_token(headers) else {
        return Ok(false);
    };
    Ok(state.db.delete_dashboard_session(&token)?)
}

/// Whether the request carries a currently-valid session token.
pub fn session_is_valid(state: &AppState, headers: &HeaderMap) -> bool {
    match bearer_token(headers) {
        Some(token) => state.db.dashboard_session_exists(&token).unwrap_or(false),
        None => false,
    }
}

/// Gate for protected dashboard endpoints.
pub fn require_session(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if session_is_valid(state, headers) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized(
            "missing or invalid dashboard session".into(),
        ))
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("authorization")?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?;
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

fn derive(password: &str, salt: &[u8], log_n: u8, r: u32, p: u32) -> Result<Vec<u8>, ApiError> {
    let params = Params::new(log_n, r, p, DERIVED_LEN)
        .map_err(|e| ApiError::Internal(format!("bad scrypt parameters: {e}")))?;
    let mut out = vec![0u8; DERIVED_LEN];
    scrypt::scrypt(password.as_bytes(), salt, &params, &mut out)
        .map_err(|e| ApiError::Internal(format!("scrypt failed: {e}")))?;
    Ok(out)
}

fn parse_record(record: &str) -> Result<(u8, u32, u32, Vec<u8>, Vec<u8>), ApiError> {
    let corrupt = || ApiError::Internal("corrupt password record".into());

    let parts: Vec<&str> = record.split(':').collect();
    if parts.len() != 5 {
        return Err(corrupt());
    }
    let log_n: u8 = parts[0].parse().map_err(|_| corrupt())?;
    let r: u32 = parts[1].parse().map_err(|_| corrupt())?;
    let p: u32 = parts[2].parse().map_err(|_| corrupt())?;
    let salt = hex::decode(parts[3]).map_err(|_| corrupt())?;
    let hash = hex::decode(parts[4]).map_err(|_| corrupt())?;
    Ok((log_n, r, p, salt, hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::Storage;

    fn state() -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Storage::open(&dir.path().join("dash.db")).unwrap();
        (AppState::new(Config::default(), db), dir)
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", format!("Bearer {token}").parse().unwrap());
        headers
    }

    #[test]
    fn register_login_round_trip() {
        let (state, _dir) = state();
        register_password(&state, "correct horse battery").unwrap();

        let token = login(&state, "correct horse battery", 1_000).unwrap();
        assert_eq!(token.len(), 64);
        assert!(session_is_valid(&state, &bearer(&token)));
    }

    #[test]
    fn wrong_password_is_rejected() {
        let (state, _dir) = state();
        register_password(&state, "correct horse battery").unwrap();

        assert!(login(&state, "incorrect horse", 1_000).is_err());
    }

    #[test]
    fn second_registration_conflicts() {
        let (state, _dir) = state();
        register_password(&state, "first password").unwrap();

        let err = register_password(&state, "second password").unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[test]
    fn short_password_is_rejected() {
        let (state, _dir) = state();
        assert!(register_password(&state, "short").is_err());
    }

    #[test]
    fn login_without_registration_is_unauthorized() {
        let (state, _dir) = state();
        let err = login(&state, "whatever password", 0).unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));
    }

    #[test]
    fn logout_invalidates_token() {
        let (state, _dir) = state();
        register_password(&state, "correct horse battery").unwrap();
        let token = login(&state, "correct horse battery", 1_000).unwrap();

        assert!(logout(&state, &bearer(&token)).unwrap());
        assert!(!session_is_valid(&state, &bearer(&token)));
        // Second logout finds nothing.
        assert!(!logout(&state, &bearer(&token)).unwrap());
    }

    #[test]
    fn garbage_tokens_are_invalid() {
        let (state, _dir) = state();
        assert!(!session_is_valid(&state, &HeaderMap::new()));
        assert!(!session_is_valid(&state, &bearer("deadbeef")));

        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Basic abc".parse().unwrap());
        assert!(!session_is_valid(&state, &headers));
    }
}
