//! Catalog synchronization.
//!
//! The extension pushes its full game list; the snapshot is authoritative
//! for membership. Per game, a BLAKE3 content hash over the canonical
//! attribute bytes decides whether anything is written at all; identical
//! snapshots are no-ops and do not broadcast. Relation junction rows are
//! replaced, never merged, inside the same transaction as the game row, so
//! a failed update can never leave a game pointing at a stale relation set.

use std::collections::{HashMap, HashSet};

use ciborium::Value;
use ludex_core::ContentHash;
use ludex_core::payload::{cbor_int, cbor_map, cbor_text, to_canonical_bytes};
use serde::{Deserialize, Serialize};

use crate::broadcast::ServerEvent;
use crate::error::ApiError;
use crate::state::AppState;

/// A reference entity (genre, platform, or company) nested in a game DTO.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefEntry {
    pub id: String,
    pub name: String,
}

/// One game in the pushed snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameDto {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub sort_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub release_date: Option<String>,
    #[serde(default)]
    pub playtime_secs: i64,
    #[serde(default)]
    pub installed: bool,
    #[serde(default)]
    pub cover_path: Option<String>,
    #[serde(default)]
    pub background_path: Option<String>,
    #[serde(default)]
    pub genres: Vec<RefEntry>,
    #[serde(default)]
    pub platforms: Vec<RefEntry>,
    #[serde(default)]
    pub developers: Vec<RefEntry>,
    #[serde(default)]
    pub publishers: Vec<RefEntry>,
}

/// Full-snapshot push body.
#[derive(Debug, Clone, Deserialize)]
pub struct LibrarySnapshot {
    pub games: Vec<GameDto>,
}

/// What a sync pass did.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub added: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub removed: usize,
}

impl SyncOutcome {
    pub fn library_changed(&self) -> bool {
        self.added > 0 || self.changed > 0 || self.removed > 0
    }
}

/// Aggregate manifest served to the extension for conditional fetches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryManifest {
    /// BLAKE3 over the sorted (game id, content hash) pairs.
    pub hash: String,
    pub games: usize,
    pub genres: usize,
    pub platforms: usize,
    pub companies: usize,
}

impl GameDto {
    /// Content hash over the mutable attribute set.
    ///
    /// Covers the scalar attributes plus the sorted relation sets: a game
    /// whose only change is a genre assignment must still hash differently,
    /// otherwise the junction replacement in the sync pass would be skipped.
    pub fn content_hash(&self) -> ludex_core::Result<ContentHash> {
        let map = cbor_map(vec![
            ("name", cbor_text(&self.name)),
            ("sortName", opt_text(&self.sort_name)),
            ("description", opt_text(&self.description)),
            ("releaseDate", opt_text(&self.release_date)),
            ("playtimeSecs", cbor_int(self.playtime_secs)),
            ("installed", Value::Bool(self.installed)),
            ("coverPath", opt_text(&self.cover_path)),
            ("backgroundPath", opt_text(&self.background_path)),
            ("genres", relation_set(&self.genres)),
            ("platforms", relation_set(&self.platforms)),
            ("developers", relation_set(&self.developers)),
            ("publishers", relation_set(&self.publishers)),
        ]);
        let bytes = to_canonical_bytes(&map)?;
        Ok(ContentHash::digest(&bytes))
    }
}

fn opt_text(v: &Option<String>) -> Value {
    match v {
        Some(s) => cbor_text(s),
        None => Value::Null,
    }
}

fn relation_set(entries: &[RefEntry]) -> Value {
    let mut pairs: Vec<(String, String)> = entries
        .iter()
        .map(|e| (e.id.clone(), e.name.clone()))
        .collect();
    pairs.sort();
    Value::Array(
        pairs
            .into_iter()
            .map(|(id, name)| Value::Array(vec![cbor_text(&id), cbor_text(&name)]))
            .collect(),
    )
}

/// Reconcile a pushed snapshot against stored state.
pub fn sync_snapshot(state: &AppState, snapshot: &LibrarySnapshot) -> Result<SyncOutcome, ApiError> {
    let stored_hashes: HashMap<String, String> = state.db.game_hashes()?;
    let mut outcome = SyncOutcome::default();

    for game in &snapshot.games {
        if game.id.is_empty() || game.name.is_empty() {
            return Err(ApiError::Validation(
                "every game needs a non-empty id and name".into(),
            ));
        }

        // Reference tables only grow from this path.
        for genre in &game.genres {
            state.db.upsert_genre(genre)?;
        }
        for platform in &game.platforms {
            state.db.upsert_platform(platform)?;
        }
        for company in game.developers.iter().chain(&game.publishers) {
            state.db.upsert_company(company)?;
        }

        let hash = game.content_hash().map_err(ApiError::sync)?;
        let hash_hex = hash.to_hex();

        match stored_hashes.get(&game.id) {
            None => {
                state.db.upsert_game(game, &hash_hex)?;
                outcome.added += 1;
            }
            Some(stored) if *stored != hash_hex => {
                state.db.upsert_game(game, &hash_hex)?;
                outcome.changed += 1;
            }
            Some(_) => outcome.unchanged += 1,
        }
    }

    // The snapshot is authoritative for membership: anything we hold that
    // the extension no longer reports is gone, junction rows included.
    let keep: HashSet<String> = snapshot.games.iter().map(|g| g.id.clone()).collect();
    outcome.removed = state.db.delete_games_absent(&keep)?;

    let manifest = build_manifest(state)?;
    state.db.save_manifest(&manifest)?;

    if outcome.library_changed() {
        tracing::info!(
            added = outcome.added,
            changed = outcome.changed,
            removed = outcome.removed,
            "library updated"
        );
        state.broadcaster.broadcast(ServerEvent::GameLibraryUpdated {
            added: outcome.added,
            changed: outcome.changed,
            removed: outcome.removed,
        });
    }

    Ok(outcome)
}

/// Recompute the aggregate manifest from stored state.
pub fn build_manifest(state: &AppState) -> Result<LibraryManifest, ApiError> {
    let mut pairs: Vec<(String, String)> = state.db.game_hashes()?.into_iter().collect();
    pairs.sort();

    let value = Value::Array(
        pairs
            .iter()
            .map(|(id, hash)| Value::Array(vec![cbor_text(id), cbor_text(hash)]))
            .collect(),
    );
    let bytes = to_canonical_bytes(&value).map_err(ApiError::sync)?;
    let counts = state.db.library_counts()?;

    Ok(LibraryManifest {
        hash: ContentHash::digest(&bytes).to_hex(),
        games: counts.games,
        genres: counts.genres,
        platforms: counts.platforms,
        companies: counts.companies,
    })
}

/// Entity counts for the manifest.
#[derive(Debug, Clone, Copy, Default)]
pub struct LibraryCounts {
    pub games: usize,
    pub genres: usize,
    pub platforms: usize,
    pub companies: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn game() -> GameDto {
        GameDto {
            id: "g1".into(),
            name: "Outer Wilds".into(),
            sort_name: None,
            description: Some("22 minutes".into()),
            release_date: Some("2019-05-28".into()),
            playtime_secs: 54_000,
            installed: true,
            cover_path: None,
            background_path: None,
            genres: vec![RefEntry {
                id: "adv".into(),
                name: "Adventure".into(),
            }],
            platforms: vec![RefEntry {
                id: "pc".into(),
                name: "PC".into(),
            }],
            developers: vec![RefEntry {
                id: "mobius".into(),
                name: "Mobius Digital".into(),
            }],
            publishers: vec![],
        }
    }

    #[test]
    fn content_hash_is_stable() {
        let g = game();
        assert_eq!(
            g.content_hash().unwrap(),
            g.content_hash().unwrap(),
            "same attributes must produce the same hash"
        );
    }

    #[test]
    fn scalar_change_rotates_hash() {
        let g1 = game();
        let mut g2 = game();
        g2.playtime_secs += 60;
        assert_ne!(g1.content_hash().unwrap(), g2.content_hash().unwrap());
    }

    #[test]
    fn relation_change_rotates_hash() {
        let g1 = game();
        let mut g2 = game();
        g2.genres.push(RefEntry {
            id: "puz".into(),
            name: "Puzzle".into(),
        });
        assert_ne!(g1.content_hash().unwrap(), g2.content_hash().unwrap());
    }

    fn state() -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = crate::storage::Storage::open(&dir.path().join("catalog.db")).unwrap();
        (AppState::new(crate::config::Config::default(), db), dir)
    }

    fn second_game() -> GameDto {
        GameDto {
            id: "g2".into(),
            name: "Hollow Knight".into(),
            sort_name: None,
            description: None,
            release_date: Some("2017-02-24".into()),
            playtime_secs: 90_000,
            installed: false,
            cover_path: None,
            background_path: None,
            genres: vec![RefEntry {
                id: "mv".into(),
                name: "Metroidvania".into(),
            }],
            platforms: vec![RefEntry {
                id: "pc".into(),
                name: "PC".into(),
            }],
            developers: vec![RefEntry {
                id: "cherry".into(),
                name: "Team Cherry".into(),
            }],
            publishers: vec![RefEntry {
                id: "cherry".into(),
                name: "Team Cherry".into(),
            }],
        }
    }

    #[test]
    fn sync_is_idempotent_and_broadcasts_once() {
        let (state, _dir) = state();
        let (_guard, mut rx) = state.broadcaster.subscribe(true);
        let snapshot = LibrarySnapshot {
            games: vec![game(), second_game()],
        };

        let first = sync_snapshot(&state, &snapshot).unwrap();
        assert_eq!(first.added, 2);
        assert!(first.library_changed());
        assert!(matches!(
            rx.try_recv(),
            Ok(ServerEvent::GameLibraryUpdated { added: 2, .. })
        ));

        // Same snapshot again: zero changes, no broadcast.
        let second = sync_snapshot(&state, &snapshot).unwrap();
        assert_eq!(second.added, 0);
        assert_eq!(second.changed, 0);
        assert_eq!(second.removed, 0);
        assert_eq!(second.unchanged, 2);
        assert!(rx.try_recv().is_err(), "no-op sync must not broadcast");
    }

    #[test]
    fn snapshot_membership_is_authoritative() {
        let (state, _dir) = state();
        sync_snapshot(
            &state,
            &LibrarySnapshot {
                games: vec![game(), second_game()],
            },
        )
        .unwrap();

        // g2 vanishes from the next snapshot.
        let outcome = sync_snapshot(
            &state,
            &LibrarySnapshot {
                games: vec![game()],
            },
        )
        .unwrap();
        assert_eq!(outcome.removed, 1);

        let hashes = state.db.game_hashes().unwrap();
        assert!(hashes.contains_key("g1"));
        assert!(!hashes.contains_key("g2"));

        // No orphaned junction rows survive the delete.
        let (genres, platforms, devs, pubs) = state.db.game_relation_counts("g2").unwrap();
        assert_eq!((genres, platforms, devs, pubs), (0, 0, 0, 0));

        // Reference tables only grow: g2's genre is still known.
        let genre_ids: Vec<String> = state
            .db
            .list_genres()
            .unwrap()
            .into_iter()
            .map(|g| g.id)
            .collect();
        assert!(genre_ids.contains(&"mv".to_string()));
    }

    #[test]
    fn changed_game_replaces_relations_not_merges() {
        let (state, _dir) = state();
        sync_snapshot(
            &state,
            &LibrarySnapshot {
                games: vec![game()],
            },
        )
        .unwrap();

        let mut updated = game();
        updated.genres = vec![RefEntry {
            id: "puz".into(),
            name: "Puzzle".into(),
        }];
        let outcome = sync_snapshot(
            &state,
            &LibrarySnapshot {
                games: vec![updated],
            },
        )
        .unwrap();
        assert_eq!(outcome.changed, 1);

        // Exactly the new set; the old "adv" row did not survive.
        let (genres, _, _, _) = state.db.game_relation_counts("g1").unwrap();
        assert_eq!(genres, 1);
    }

    #[test]
    fn manifest_tracks_library_content() {
        let (state, _dir) = state();
        sync_snapshot(
            &state,
            &LibrarySnapshot {
                games: vec![game()],
            },
        )
        .unwrap();
        let first = state.db.load_manifest().unwrap().unwrap();
        assert_eq!(first.games, 1);
        assert_eq!(first.genres, 1);

        sync_snapshot(
            &state,
            &LibrarySnapshot {
                games: vec![game(), second_game()],
            },
        )
        .unwrap();
        let second = state.db.load_manifest().unwrap().unwrap();
        assert_eq!(second.games, 2);
        assert_ne!(first.hash, second.hash);

        // Unchanged content keeps the hash stable.
        sync_snapshot(
            &state,
            &LibrarySnapshot {
                games: vec![game(), second_game()],
            },
        )
        .unwrap();
        let third = state.db.load_manifest().unwrap().unwrap();
        assert_eq!(second.hash, third.hash);
    }

    #[test]
    fn relation_order_does_not_rotate_hash() {
        let mut g1 = game();
        g1.genres = vec![
            RefEntry {
                id: "adv".into(),
                name: "Adventure".into(),
            },
            RefEntry {
                id: "puz".into(),
                name: "Puzzle".into(),
            },
        ];
        let mut g2 = g1.clone();
        g2.genres.reverse();
        assert_eq!(g1.content_hash().unwrap(), g2.content_hash().unwrap());
    }
}
