//! Note reconciliation.
//!
//! Notes can be edited on the extension side while offline and on the
//! dashboard while the extension is away. Reconciliation is last-writer-wins
//! per note: whichever copy carries the greater `lastUpdatedAt` wins whole,
//! tombstone and all. Deletions are soft (`deletedAt`), so a delete on one
//! side propagates to the other instead of being resurrected.
//!
//! The synchronization id is an opaque token for the merged state; it
//! rotates on every merge, and a cheap sync-check against it lets the
//! extension skip reconciliation entirely when nothing changed server-side.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::state::AppState;

/// Key under which the current synchronization id is persisted.
const SYNC_ID_KEY: &str = "note_sync_id";

/// A free-form note, optionally attached to a game and/or session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameNote {
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub image_path: Option<String>,
    #[serde(default)]
    pub game_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub created_at: i64,
    pub last_updated_at: i64,
    /// Soft-delete tombstone; null means alive.
    #[serde(default)]
    pub deleted_at: Option<i64>,
}

/// Reconcile request body: the client's full note set, tombstones included.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileRequest {
    pub notes: Vec<GameNote>,
}

/// Reconcile response: new baseline for the client.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileResponse {
    pub sync_id: String,
    pub notes: Vec<GameNote>,
}

/// Merge the client's note set into the server's. Pure: no storage access.
///
/// Per id present on both sides the copy with the strictly greater
/// `last_updated_at` wins in full; ties keep the server copy. One-sided
/// notes are adopted as-is. Output is ordered by note id.
pub fn merge(server: Vec<GameNote>, client: Vec<GameNote>) -> Vec<GameNote> {
    let mut by_id: BTreeMap<String, GameNote> = server
        .into_iter()
        .map(|note| (note.id.clone(), note))
        .collect();

    for note in client {
        match by_id.entry(note.id.clone()) {
            Entry::Occupied(mut existing) => {
                if note.last_updated_at > existing.get().last_updated_at {
                    existing.insert(note);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(note);
            }
        }
    }

    by_id.into_values().collect()
}

/// Run a full reconciliation: merge, persist the merged set atomically,
/// rotate the synchronization id, and hand both back to the client.
pub fn reconcile(state: &AppState, client: Vec<GameNote>) -> Result<ReconcileResponse, ApiError> {
    for note in &client {
        if note.id.is_empty() {
            return Err(ApiError::Validation("every note needs a non-empty id".into()));
        }
    }

    let server = state.db.all_notes()?;
    let merged = merge(server, client);

    state.db.replace_notes(&merged)?;

    let sync_id = new_sync_id();
    state.db.set_state(SYNC_ID_KEY, &sync_id)?;

    tracing::info!(notes = merged.len(), "notes reconciled");
    Ok(ReconcileResponse {
        sync_id,
        notes: merged,
    })
}

/// Cheap check: does the client's synchronization id match the server's?
/// A server that has never reconciled reports a mismatch, forcing the
/// client through a first full reconciliation.
pub fn sync_check(state: &AppState, client_sync_id: &str) -> Result<bool, ApiError> {
    Ok(state
        .db
        .get_state(SYNC_ID_KEY)?
        .is_some_and(|current| current == client_sync_id))
}

/// A fresh opaque synchronization id (32 random bytes, hex).
pub fn new_sync_id() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
