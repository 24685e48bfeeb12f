//! Play-session tracking: open, close, and staleness recovery.
//!
//! A session is opened by the extension when a game launches and closed when
//! it exits. Extensions crash and laptops sleep, so any session left
//! `inProgress` past the configured threshold is swept to `stale` instead of
//! lingering open forever; the sweep runs opportunistically before every
//! recent-sessions read.

use serde::{Deserialize, Serialize};

use crate::broadcast::ServerEvent;
use crate::error::ApiError;
use crate::state::AppState;

/// Play-session lifecycle states. `Closed` and `Stale` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    InProgress,
    Closed,
    Stale,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "inProgress",
            Self::Closed => "closed",
            Self::Stale => "stale",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inProgress" => Some(Self::InProgress),
            "closed" => Some(Self::Closed),
            "stale" => Some(Self::Stale),
            _ => None,
        }
    }
}

/// A tracked play session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSession {
    /// Client-generated, single-use id.
    pub session_id: String,
    pub game_id: String,
    pub game_name: String,
    /// UNIX milliseconds, from the client clock.
    pub start_time: i64,
    /// Set on close; null while open or stale.
    pub end_time: Option<i64>,
    /// Whole seconds, clamped to >= 0. Set on close.
    pub duration_secs: Option<i64>,
    pub status: SessionStatus,
}

/// Request body for opening a session.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenCommand {
    pub session_id: String,
    pub game_id: String,
    pub game_name: String,
    /// Client wall clock at launch, UNIX milliseconds.
    pub client_utc_now: i64,
}

/// Request body for closing a session.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseCommand {
    pub session_id: String,
    /// Client wall clock at exit, UNIX milliseconds.
    pub client_utc_now: i64,
}

/// Open a new session. Duplicate session ids are rejected: the check and
/// the insert happen atomically inside the storage layer, so two interleaved
/// opens of the same id cannot both succeed.
pub fn open(state: &AppState, cmd: &OpenCommand) -> Result<GameSession, ApiError> {
    if cmd.session_id.is_empty() || cmd.game_id.is_empty() {
        return Err(ApiError::Validation(
            "sessionId and gameId must be non-empty".into(),
        ));
    }

    let Some(session) = state.db.open_session(cmd)? else {
        return Err(ApiError::Conflict(format!(
            "session {} already exists",
            cmd.session_id
        )));
    };

    tracing::info!(session_id = %session.session_id, game = %session.game_name, "session opened");
    state.broadcaster.broadcast(ServerEvent::SessionOpened {
        session: session.clone(),
    });
    Ok(session)
}

/// Close a session. Returns `None` (not an error) when no matching
/// `inProgress` session exists: already-closed, stale, and unknown ids all
/// report failure without mutating anything.
pub fn close(state: &AppState, cmd: &CloseCommand) -> Result<Option<GameSession>, ApiError> {
    let Some(session) = state.db.close_session(&cmd.session_id, cmd.client_utc_now)? else {
        return Ok(None);
    };

    tracing::info!(
        session_id = %session.session_id,
        duration_secs = session.duration_secs.unwrap_or(0),
        "session closed"
    );
    state.broadcaster.broadcast(ServerEvent::SessionClosed {
        session: session.clone(),
    });
    Ok(Some(session))
}

/// Sweep over-age `inProgress` sessions to `stale`, then list recent
/// sessions across all states, most recent start first.
pub fn get_recent(
    state: &AppState,
    now_ms: i64,
    limit: usize,
) -> Result<Vec<GameSession>, ApiError> {
    let cutoff = now_ms - state.config.session_stale_secs * 1000;
    let swept = state.db.sweep_stale_sessions(cutoff)?;
    if swept > 0 {
        tracing::info!(count = swept, "swept stale sessions");
        state
            .broadcaster
            .broadcast(ServerEvent::RecentGameSessionsUpdated { stale: swept });
    }

    Ok(state.db.recent_sessions(limit)?)
}

/// Duration between open and close, whole seconds, clamped to zero for
/// clients whose clock went backwards between the two calls.
pub fn duration_secs(start_ms: i64, end_ms: i64) -> i64 {
    ((end_ms - start_ms) / 1000).max(0)
}
