//! Extension registration lifecycle.
//!
//! Every extension instance must be registered and explicitly approved by
//! the dashboard user before its signed requests are accepted. The state
//! machine is small and strict:
//!
//! ```text
//! register        approve           revoke
//!   ──────> pending ──────> trusted ──────> rejected
//!              │  reject                       ▲
//!              └───────────────────────────────┘
//! ```
//!
//! `remove` deletes the row from any state and is irreversible.
//!
//! One non-removed registration per extension id: re-registering over a
//! `pending` or `rejected` row resets it to `pending` with the newly
//! submitted key and metadata (reinstall / key rotation), while
//! re-registering over a `trusted` row is a conflict: a trusted key is
//! never silently replaced.

use serde::{Deserialize, Serialize};

use crate::broadcast::ServerEvent;
use crate::error::ApiError;
use crate::state::AppState;

/// Registration trust states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationStatus {
    Pending,
    Trusted,
    Rejected,
}

impl RegistrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Trusted => "trusted",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "trusted" => Some(Self::Trusted),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// A stored extension registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionRegistration {
    /// Server-assigned, stable.
    pub id: i64,
    /// External device identity, stable across re-registration.
    pub extension_id: String,
    /// 64-char hex Ed25519 public key.
    pub public_key: String,
    pub hostname: Option<String>,
    pub os: Option<String>,
    pub extension_version: Option<String>,
    pub status: RegistrationStatus,
    pub created_at: i64,
    pub last_updated_at: i64,
}

/// Registration command submitted by an extension.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterCommand {
    pub extension_id: String,
    pub public_key: String,
    pub hostname: Option<String>,
    pub os: Option<String>,
    pub extension_version: Option<String>,
}

/// What `Storage::register_extension` did with the command.
#[derive(Debug)]
pub enum RegisterOutcome {
    /// First registration for this extension id.
    Created(ExtensionRegistration),
    /// An existing non-trusted row was reset to pending.
    Reset(ExtensionRegistration),
    /// A trusted registration already exists for this extension id.
    TrustedExists,
}

/// Result of a conditional status transition.
#[derive(Debug)]
pub enum Transition {
    Done(ExtensionRegistration),
    NotFound,
    /// The row exists but is not in the required from-state.
    Ineligible(RegistrationStatus),
}

const MAX_EXTENSION_ID_LEN: usize = 128;
const MAX_METADATA_LEN: usize = 256;

/// Register an extension. Returns the registration id and broadcasts the
/// full registration so the dashboard can show the approval prompt.
pub fn register(state: &AppState, cmd: &RegisterCommand, now_ms: i64) -> Result<i64, ApiError> {
    validate(cmd)?;

    let registration = match state.db.register_extension(cmd, now_ms)? {
        RegisterOutcome::Created(r) => {
            tracing::info!(extension_id = %r.extension_id, id = r.id, "extension registered");
            r
        }
        RegisterOutcome::Reset(r) => {
            tracing::info!(extension_id = %r.extension_id, id = r.id, "extension re-registered, reset to pending");
            r
        }
        RegisterOutcome::TrustedExists => {
            return Err(ApiError::Conflict(format!(
                "extension {} already has a trusted registration",
                cmd.extension_id
            )));
        }
    };

    let id = registration.id;
    state
        .broadcaster
        .broadcast(ServerEvent::CreatedExtensionRegistration { registration });
    Ok(id)
}

/// Approve a pending registration.
pub fn approve(state: &AppState, id: i64, now_ms: i64) -> Result<(), ApiError> {
    transition(
        state,
        id,
        RegistrationStatus::Pending,
        RegistrationStatus::Trusted,
        now_ms,
    )
}

/// Reject a pending registration.
pub fn reject(state: &AppState, id: i64, now_ms: i64) -> Result<(), ApiError> {
    transition(
        state,
        id,
        RegistrationStatus::Pending,
        RegistrationStatus::Rejected,
        now_ms,
    )
}

/// Revoke trust from an approved registration. Takes effect on the very
/// next signed request, since the authenticator re-reads status per call.
pub fn revoke(state: &AppState, id: i64, now_ms: i64) -> Result<(), ApiError> {
    transition(
        state,
        id,
        RegistrationStatus::Trusted,
        RegistrationStatus::Rejected,
        now_ms,
    )
}

/// Delete a registration regardless of status. Irreversible.
pub fn remove(state: &AppState, id: i64) -> Result<(), ApiError> {
    if state.db.remove_registration(id)? {
        tracing::info!(id, "registration removed");
        Ok(())
    } else {
        Err(ApiError::NotFound(format!("no registration with id {id}")))
    }
}

fn transition(
    state: &AppState,
    id: i64,
    from: RegistrationStatus,
    to: RegistrationStatus,
    now_ms: i64,
) -> Result<(), ApiError> {
    match state.db.transition_registration(id, from, to, now_ms)? {
        Transition::Done(r) => {
            tracing::info!(id, extension_id = %r.extension_id, status = to.as_str(), "registration transitioned");
            Ok(())
        }
        Transition::NotFound => Err(ApiError::NotFound(format!("no registration with id {id}"))),
        Transition::Ineligible(current) => Err(ApiError::Conflict(format!(
            "registration {id} is {}, expected {}",
            current.as_str(),
            from.as_str()
        ))),
    }
}

fn validate(cmd: &RegisterCommand) -> Result<(), ApiError> {
    if cmd.extension_id.is_empty() || cmd.extension_id.len() > MAX_EXTENSION_ID_LEN {
        return Err(ApiError::Validation(format!(
            "extensionId must be 1..={MAX_EXTENSION_ID_LEN} characters"
        )));
    }

    match hex::decode(&cmd.public_key) {
        Ok(bytes) if bytes.len() == 32 => {}
        _ => {
            return Err(ApiError::Validation(
                "publicKey must be 64 hex characters (32-byte Ed25519 key)".into(),
            ));
        }
    }

    for (field, value) in [
        ("hostname", &cmd.hostname),
        ("os", &cmd.os),
        ("extensionVersion", &cmd.extension_version),
    ] {
        if let Some(v) = value {
            if v.len() > MAX_METADATA_LEN {
                return Err(ApiError::Validation(format!(
                    "{field} must be at most {MAX_METADATA_LEN} characters"
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd() -> RegisterCommand {
        RegisterCommand {
            extension_id: "ext-1".into(),
            public_key: "ab".repeat(32),
            hostname: Some("desk".into()),
            os: Some("Windows 11".into()),
            extension_version: Some("1.4.0".into()),
        }
    }

    #[test]
    fn validate_accepts_well_formed_command() {
        assert!(validate(&cmd()).is_ok());
    }

    #[test]
    fn validate_rejects_bad_public_key() {
        let mut c = cmd();
        c.public_key = "not-hex".into();
        assert!(validate(&c).is_err());

        c.public_key = "ab".repeat(16); // right charset, wrong length
        assert!(validate(&c).is_err());
    }

    #[test]
    fn validate_rejects_empty_extension_id() {
        let mut c = cmd();
        c.extension_id = String::new();
        assert!(validate(&c).is_err());
    }

    #[test]
    fn status_round_trip() {
        for status in [
            RegistrationStatus::Pending,
            RegistrationStatus::Trusted,
            RegistrationStatus::Rejected,
        ] {
            assert_eq!(RegistrationStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RegistrationStatus::parse("removed"), None);
    }
}
