//! Signed-request verification for extension calls.
//!
//! Every extension request (after registration itself) carries three
//! headers: the claimed extension id, the client's timestamp, and an
//! Ed25519 signature over the canonical payload of
//! `method + path + body + timestamp`. Authorization is four ordered
//! checks, each short-circuiting to a 403 with its reason:
//!
//! 1. the extension id resolves to a registration ("unregistered")
//! 2. that registration is trusted ("untrusted"; covers pending and rejected)
//! 3. the timestamp is inside the freshness window ("stale or replayed timestamp")
//! 4. the signature verifies against the stored public key ("bad signature")
//!
//! Trust status is read from storage on every call, never cached across
//! requests: a revocation must bind on the very next request, even one
//! already in flight behind it.

use axum::http::HeaderMap;

use crate::error::ApiError;
use crate::state::AppState;
use crate::trust::{ExtensionRegistration, RegistrationStatus};

pub const EXTENSION_ID_HEADER: &str = "x-extension-id";
pub const TIMESTAMP_HEADER: &str = "x-timestamp";
pub const SIGNATURE_HEADER: &str = "x-signature";

/// Verify a signed extension request. Returns the trusted registration on
/// success so handlers can attribute the push.
pub fn authorize_extension(
    state: &AppState,
    method: &str,
    path: &str,
    headers: &HeaderMap,
    body: &[u8],
    now_ms: i64,
) -> Result<ExtensionRegistration, ApiError> {
    let Some((extension_id, timestamp_ms, signature_hex)) = auth_headers(headers) else {
        return Err(ApiError::Forbidden("malformed authentication headers".into()));
    };

    let Some(registration) = state.db.get_registration_by_extension_id(&extension_id)? else {
        return Err(ApiError::Forbidden("unregistered".into()));
    };

    if registration.status != RegistrationStatus::Trusted {
        return Err(ApiError::Forbidden("untrusted".into()));
    }

    let window_ms = state.config.freshness_window_secs * 1000;
    if (now_ms - timestamp_ms).abs() > window_ms {
        return Err(ApiError::Forbidden("stale or replayed timestamp".into()));
    }

    let message = ludex_core::payload::signing_bytes(method, path, body, timestamp_ms)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let public_key = hex::decode(&registration.public_key).unwrap_or_default();
    let signature = hex::decode(&signature_hex).unwrap_or_default();
    if !ludex_core::verify(&public_key, &message, &signature) {
        return Err(ApiError::Forbidden("bad signature".into()));
    }

    Ok(registration)
}

/// Pull and parse the three auth headers. `None` on anything malformed.
fn auth_headers(headers: &HeaderMap) -> Option<(String, i64, String)> {
    let extension_id = headers.get(EXTENSION_ID_HEADER)?.to_str().ok()?;
    let timestamp: i64 = headers.get(TIMESTAMP_HEADER)?.to_str().ok()?.parse().ok()?;
    let signature = headers.get(SIGNATURE_HEADER)?.to_str().ok()?;
    if extension_id.is_empty() || signature.is_empty() {
        return None;
    }
    Some((extension_id.to_string(), timestamp, signature.to_string()))
}
