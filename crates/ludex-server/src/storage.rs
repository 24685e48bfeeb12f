//! SQLite persistence.
//!
//! A single shared connection behind a mutex. Multi-statement updates (the
//! per-game relation replacement, the note-set replacement, registration
//! check-and-transition) run inside explicit transactions: a failure rolls
//! the whole step back, never leaving a game row pointing at a partial
//! relation set. Check-and-act sequences hold the connection lock for their
//! full duration, so interleaved requests cannot race them.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::info;

use crate::catalog::{GameDto, LibraryCounts, LibraryManifest, RefEntry};
use crate::notes::GameNote;
use crate::sessions::{self, GameSession, OpenCommand, SessionStatus};
use crate::trust::{
    ExtensionRegistration, RegisterCommand, RegisterOutcome, RegistrationStatus, Transition,
};

/// Persistent storage backed by SQLite.
pub struct Storage {
    conn: Mutex<Connection>,
}

impl Storage {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;

        // WAL for concurrent dashboard reads while the extension pushes.
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS extension_registrations (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                extension_id      TEXT NOT NULL UNIQUE,
                public_key        TEXT NOT NULL,
                hostname          TEXT,
                os                TEXT,
                extension_version TEXT,
                status            TEXT NOT NULL,
                created_at        INTEGER NOT NULL,
                last_updated_at   INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS game_sessions (
                session_id    TEXT PRIMARY KEY,
                game_id       TEXT NOT NULL,
                game_name     TEXT NOT NULL,
                start_time    INTEGER NOT NULL,
                end_time      INTEGER,
                duration_secs INTEGER,
                status        TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_start
                ON game_sessions(start_time DESC);
            CREATE INDEX IF NOT EXISTS idx_sessions_status
                ON game_sessions(status);

            CREATE TABLE IF NOT EXISTS games (
                id              TEXT PRIMARY KEY,
                name            TEXT NOT NULL,
                sort_name       TEXT,
                description     TEXT,
                release_date    TEXT,
                playtime_secs   INTEGER NOT NULL DEFAULT 0,
                installed       INTEGER NOT NULL DEFAULT 0,
                cover_path      TEXT,
                background_path TEXT,
                content_hash    TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS genres (
                id   TEXT PRIMARY KEY,
                name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS platforms (
                id   TEXT PRIMARY KEY,
                name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS companies (
                id   TEXT PRIMARY KEY,
                name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS game_genres (
                game_id  TEXT NOT NULL,
                genre_id TEXT NOT NULL,
                PRIMARY KEY (game_id, genre_id)
            );

            CREATE TABLE IF NOT EXISTS game_platforms (
                game_id     TEXT NOT NULL,
                platform_id TEXT NOT NULL,
                PRIMARY KEY (game_id, platform_id)
            );

            CREATE TABLE IF NOT EXISTS game_developers (
                game_id    TEXT NOT NULL,
                company_id TEXT NOT NULL,
                PRIMARY KEY (game_id, company_id)
            );

            CREATE TABLE IF NOT EXISTS game_publishers (
                game_id    TEXT NOT NULL,
                company_id TEXT NOT NULL,
                PRIMARY KEY (game_id, company_id)
            );

            CREATE TABLE IF NOT EXISTS game_notes (
                id              TEXT PRIMARY KEY,
                title           TEXT NOT NULL,
                content         TEXT NOT NULL,
                image_path      TEXT,
                game_id         TEXT,
                session_id      TEXT,
                created_at      INTEGER NOT NULL,
                last_updated_at INTEGER NOT NULL,
                deleted_at      INTEGER
            );

            CREATE TABLE IF NOT EXISTS dashboard_sessions (
                token      TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS server_state (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;

        info!("database opened: {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── Extension registrations ──

    /// Register an extension. One non-removed row per extension id:
    /// a pending/rejected row is reset to pending with the new key and
    /// metadata; a trusted row is left untouched and reported.
    pub fn register_extension(
        &self,
        cmd: &RegisterCommand,
        now_ms: i64,
    ) -> Result<RegisterOutcome, rusqlite::Error> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let existing = tx
            .query_row(
                "SELECT id, extension_id, public_key, hostname, os, extension_version,
                        status, created_at, last_updated_at
                 FROM extension_registrations WHERE extension_id = ?1",
                params![cmd.extension_id],
                row_to_registration,
            )
            .optional()?;

        let outcome = match existing {
            Some(reg) if reg.status == RegistrationStatus::Trusted => {
                RegisterOutcome::TrustedExists
            }
            Some(reg) => {
                tx.execute(
                    "UPDATE extension_registrations
                     SET public_key = ?1, hostname = ?2, os = ?3, extension_version = ?4,
                         status = 'pending', last_updated_at = ?5
                     WHERE id = ?6",
                    params![
                        cmd.public_key,
                        cmd.hostname,
                        cmd.os,
                        cmd.extension_version,
                        now_ms,
                        reg.id
                    ],
                )?;
                RegisterOutcome::Reset(ExtensionRegistration {
                    public_key: cmd.public_key.clone(),
                    hostname: cmd.hostname.clone(),
                    os: cmd.os.clone(),
                    extension_version: cmd.extension_version.clone(),
                    status: RegistrationStatus::Pending,
                    last_updated_at: now_ms,
                    ..reg
                })
            }
            None => {
                tx.execute(
                    "INSERT INTO extension_registrations
                         (extension_id, public_key, hostname, os, extension_version,
                          status, created_at, last_updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?6)",
                    params![
                        cmd.extension_id,
                        cmd.public_key,
                        cmd.hostname,
                        cmd.os,
                        cmd.extension_version,
                        now_ms
                    ],
                )?;
                RegisterOutcome::Created(ExtensionRegistration {
                    id: tx.last_insert_rowid(),
                    extension_id: cmd.extension_id.clone(),
                    public_key: cmd.public_key.clone(),
                    hostname: cmd.hostname.clone(),
                    os: cmd.os.clone(),
                    extension_version: cmd.extension_version.clone(),
                    status: RegistrationStatus::Pending,
                    created_at: now_ms,
                    last_updated_at: now_ms,
                })
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    /// Look up a registration by extension id.
    pub fn get_registration_by_extension_id(
        &self,
        extension_id: &str,
    ) -> Result<Option<ExtensionRegistration>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, extension_id, public_key, hostname, os, extension_version,
                    status, created_at, last_updated_at
             FROM extension_registrations WHERE extension_id = ?1",
            params![extension_id],
            row_to_registration,
        )
        .optional()
    }

    /// All registrations, newest first.
    pub fn list_registrations(&self) -> Result<Vec<ExtensionRegistration>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, extension_id, public_key, hostname, os, extension_version,
                    status, created_at, last_updated_at
             FROM extension_registrations ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], row_to_registration)?;
        rows.collect()
    }

    /// Conditionally move a registration from one status to another.
    /// The read and the write share one transaction, so a concurrent
    /// transition cannot slip between them.
    pub fn transition_registration(
        &self,
        id: i64,
        from: RegistrationStatus,
        to: RegistrationStatus,
        now_ms: i64,
    ) -> Result<Transition, rusqlite::Error> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let existing = tx
            .query_row(
                "SELECT id, extension_id, public_key, hostname, os, extension_version,
                        status, created_at, last_updated_at
                 FROM extension_registrations WHERE id = ?1",
                params![id],
                row_to_registration,
            )
            .optional()?;

        let result = match existing {
            None => Transition::NotFound,
            Some(reg) if reg.status != from => Transition::Ineligible(reg.status),
            Some(reg) => {
                tx.execute(
                    "UPDATE extension_registrations
                     SET status = ?1, last_updated_at = ?2 WHERE id = ?3",
                    params![to.as_str(), now_ms, id],
                )?;
                Transition::Done(ExtensionRegistration {
                    status: to,
                    last_updated_at: now_ms,
                    ..reg
                })
            }
        };

        tx.commit()?;
        Ok(result)
    }

    /// Delete a registration regardless of status.
    pub fn remove_registration(&self, id: i64) -> Result<bool, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "DELETE FROM extension_registrations WHERE id = ?1",
            params![id],
        )?;
        Ok(rows > 0)
    }

    // ── Game sessions ──

    /// Insert a new in-progress session. Returns `None` when the id is
    /// already taken (any state); the existence check and the insert share
    /// one transaction under the connection lock.
    pub fn open_session(&self, cmd: &OpenCommand) -> Result<Option<GameSession>, rusqlite::Error> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let taken: i64 = tx.query_row(
            "SELECT COUNT(*) FROM game_sessions WHERE session_id = ?1",
            params![cmd.session_id],
            |row| row.get(0),
        )?;
        if taken > 0 {
            return Ok(None);
        }

        tx.execute(
            "INSERT INTO game_sessions
                 (session_id, game_id, game_name, start_time, end_time, duration_secs, status)
             VALUES (?1, ?2, ?3, ?4, NULL, NULL, ?5)",
            params![
                cmd.session_id,
                cmd.game_id,
                cmd.game_name,
                cmd.client_utc_now,
                SessionStatus::InProgress.as_str()
            ],
        )?;
        tx.commit()?;

        Ok(Some(GameSession {
            session_id: cmd.session_id.clone(),
            game_id: cmd.game_id.clone(),
            game_name: cmd.game_name.clone(),
            start_time: cmd.client_utc_now,
            end_time: None,
            duration_secs: None,
            status: SessionStatus::InProgress,
        }))
    }

    /// Close an in-progress session. Returns `None` without mutating
    /// anything when no matching in-progress row exists.
    pub fn close_session(
        &self,
        session_id: &str,
        client_now_ms: i64,
    ) -> Result<Option<GameSession>, rusqlite::Error> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let open = tx
            .query_row(
                "SELECT session_id, game_id, game_name, start_time, end_time, duration_secs, status
                 FROM game_sessions WHERE session_id = ?1 AND status = 'inProgress'",
                params![session_id],
                row_to_session,
            )
            .optional()?;

        let Some(mut session) = open else {
            return Ok(None);
        };

        let duration = sessions::duration_secs(session.start_time, client_now_ms);
        tx.execute(
            "UPDATE game_sessions
             SET end_time = ?1, duration_secs = ?2, status = ?3
             WHERE session_id = ?4",
            params![
                client_now_ms,
                duration,
                SessionStatus::Closed.as_str(),
                session_id
            ],
        )?;
        tx.commit()?;

        session.end_time = Some(client_now_ms);
        session.duration_secs = Some(duration);
        session.status = SessionStatus::Closed;
        Ok(Some(session))
    }

    /// Reclassify in-progress sessions older than the cutoff to stale.
    /// Returns the number of sessions swept.
    pub fn sweep_stale_sessions(&self, cutoff_ms: i64) -> Result<usize, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE game_sessions SET status = 'stale'
             WHERE status = 'inProgress' AND start_time < ?1",
            params![cutoff_ms],
        )
    }

    /// Recent sessions across all states, most recent start first.
    pub fn recent_sessions(&self, limit: usize) -> Result<Vec<GameSession>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT session_id, game_id, game_name, start_time, end_time, duration_secs, status
             FROM game_sessions ORDER BY start_time DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], row_to_session)?;
        rows.collect()
    }

    // ── Catalog ──

    /// Upsert a genre by id. Reference tables only grow from sync.
    pub fn upsert_genre(&self, entry: &RefEntry) -> Result<(), rusqlite::Error> {
        self.upsert_reference("genres", entry)
    }

    /// Upsert a platform by id.
    pub fn upsert_platform(&self, entry: &RefEntry) -> Result<(), rusqlite::Error> {
        self.upsert_reference("platforms", entry)
    }

    /// Upsert a company (developer or publisher) by id.
    pub fn upsert_company(&self, entry: &RefEntry) -> Result<(), rusqlite::Error> {
        self.upsert_reference("companies", entry)
    }

    fn upsert_reference(&self, table: &str, entry: &RefEntry) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!(
                "INSERT INTO {table} (id, name) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name"
            ),
            params![entry.id, entry.name],
        )?;
        Ok(())
    }

    /// Content hashes of all stored games, keyed by game id.
    pub fn game_hashes(&self) -> Result<HashMap<String, String>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id, content_hash FROM games")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect()
    }

    /// Upsert a game row and replace its relation junction rows with exactly
    /// the sets in the DTO. One transaction: a failure anywhere rolls back
    /// the row and every junction change together.
    pub fn upsert_game(&self, game: &GameDto, content_hash: &str) -> Result<(), rusqlite::Error> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO games
                 (id, name, sort_name, description, release_date, playtime_secs,
                  installed, cover_path, background_path, content_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 sort_name = excluded.sort_name,
                 description = excluded.description,
                 release_date = excluded.release_date,
                 playtime_secs = excluded.playtime_secs,
                 installed = excluded.installed,
                 cover_path = excluded.cover_path,
                 background_path = excluded.background_path,
                 content_hash = excluded.content_hash",
            params![
                game.id,
                game.name,
                game.sort_name,
                game.description,
                game.release_date,
                game.playtime_secs,
                game.installed as i32,
                game.cover_path,
                game.background_path,
                content_hash
            ],
        )?;

        // Replace, not merge: stale junction rows must not survive.
        tx.execute("DELETE FROM game_genres WHERE game_id = ?1", params![game.id])?;
        for genre in &game.genres {
            tx.execute(
                "INSERT OR IGNORE INTO game_genres (game_id, genre_id) VALUES (?1, ?2)",
                params![game.id, genre.id],
            )?;
        }

        tx.execute(
            "DELETE FROM game_platforms WHERE game_id = ?1",
            params![game.id],
        )?;
        for platform in &game.platforms {
            tx.execute(
                "INSERT OR IGNORE INTO game_platforms (game_id, platform_id) VALUES (?1, ?2)",
                params![game.id, platform.id],
            )?;
        }

        tx.execute(
            "DELETE FROM game_developers WHERE game_id = ?1",
            params![game.id],
        )?;
        for dev in &game.developers {
            tx.execute(
                "INSERT OR IGNORE INTO game_developers (game_id, company_id) VALUES (?1, ?2)",
                params![game.id, dev.id],
            )?;
        }

        tx.execute(
            "DELETE FROM game_publishers WHERE game_id = ?1",
            params![game.id],
        )?;
        for publisher in &game.publishers {
            tx.execute(
                "INSERT OR IGNORE INTO game_publishers (game_id, company_id) VALUES (?1, ?2)",
                params![game.id, publisher.id],
            )?;
        }

        tx.commit()
    }

    /// Delete every stored game absent from `keep`, junction rows included.
    /// Returns how many games were removed.
    pub fn delete_games_absent(&self, keep: &HashSet<String>) -> Result<usize, rusqlite::Error> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let stored: Vec<String> = {
            let mut stmt = tx.prepare("SELECT id FROM games")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };

        let doomed: Vec<&String> = stored.iter().filter(|id| !keep.contains(*id)).collect();
        for id in &doomed {
            tx.execute("DELETE FROM games WHERE id = ?1", params![id])?;
            tx.execute("DELETE FROM game_genres WHERE game_id = ?1", params![id])?;
            tx.execute("DELETE FROM game_platforms WHERE game_id = ?1", params![id])?;
            tx.execute("DELETE FROM game_developers WHERE game_id = ?1", params![id])?;
            tx.execute("DELETE FROM game_publishers WHERE game_id = ?1", params![id])?;
        }

        tx.commit()?;
        Ok(doomed.len())
    }

    /// Junction rows for one game, for membership assertions in tests.
    #[cfg(test)]
    pub fn game_relation_counts(&self, game_id: &str) -> Result<(i64, i64, i64, i64), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let count = |table: &str, column: &str| -> Result<i64, rusqlite::Error> {
            conn.query_row(
                &format!("SELECT COUNT(*) FROM {table} WHERE {column} = ?1"),
                params![game_id],
                |row| row.get(0),
            )
        };
        Ok((
            count("game_genres", "game_id")?,
            count("game_platforms", "game_id")?,
            count("game_developers", "game_id")?,
            count("game_publishers", "game_id")?,
        ))
    }

    /// Entity counts for the library manifest.
    pub fn library_counts(&self) -> Result<LibraryCounts, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let count = |table: &str| -> Result<usize, rusqlite::Error> {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n as usize)
        };
        Ok(LibraryCounts {
            games: count("games")?,
            genres: count("genres")?,
            platforms: count("platforms")?,
            companies: count("companies")?,
        })
    }

    /// Persist the aggregate manifest.
    pub fn save_manifest(&self, manifest: &LibraryManifest) -> Result<(), rusqlite::Error> {
        let json = serde_json::to_string(manifest)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        self.set_state("library_manifest", &json)
    }

    /// Load the stored manifest, if a sync has ever run.
    pub fn load_manifest(&self) -> Result<Option<LibraryManifest>, rusqlite::Error> {
        let Some(json) = self.get_state("library_manifest")? else {
            return Ok(None);
        };
        serde_json::from_str(&json)
            .map(Some)
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })
    }

    /// All genres, ordered by name.
    pub fn list_genres(&self) -> Result<Vec<RefEntry>, rusqlite::Error> {
        self.list_reference("genres")
    }

    /// All platforms, ordered by name.
    pub fn list_platforms(&self) -> Result<Vec<RefEntry>, rusqlite::Error> {
        self.list_reference("platforms")
    }

    /// All companies, ordered by name.
    pub fn list_companies(&self) -> Result<Vec<RefEntry>, rusqlite::Error> {
        self.list_reference("companies")
    }

    fn list_reference(&self, table: &str) -> Result<Vec<RefEntry>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare(&format!("SELECT id, name FROM {table} ORDER BY name, id"))?;
        let rows = stmt.query_map([], |row| {
            Ok(RefEntry {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?;
        rows.collect()
    }

    // ── Notes ──

    /// Every note, tombstones included: the reconciliation input.
    pub fn all_notes(&self) -> Result<Vec<GameNote>, rusqlite::Error> {
        self.notes_where("")
    }

    /// Only live notes, for the dashboard listing.
    pub fn live_notes(&self) -> Result<Vec<GameNote>, rusqlite::Error> {
        self.notes_where("WHERE deleted_at IS NULL")
    }

    fn notes_where(&self, filter: &str) -> Result<Vec<GameNote>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, title, content, image_path, game_id, session_id,
                    created_at, last_updated_at, deleted_at
             FROM game_notes {filter} ORDER BY id"
        ))?;
        let rows = stmt.query_map([], row_to_note)?;
        rows.collect()
    }

    /// Replace the entire note set with the merged result, atomically.
    /// Tombstones are kept; reconciliation never hard-deletes.
    pub fn replace_notes(&self, notes: &[GameNote]) -> Result<(), rusqlite::Error> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM game_notes", [])?;
        for note in notes {
            tx.execute(
                "INSERT INTO game_notes
                     (id, title, content, image_path, game_id, session_id,
                      created_at, last_updated_at, deleted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    note.id,
                    note.title,
                    note.content,
                    note.image_path,
                    note.game_id,
                    note.session_id,
                    note.created_at,
                    note.last_updated_at,
                    note.deleted_at
                ],
            )?;
        }

        tx.commit()
    }

    // ── Dashboard sessions ──

    pub fn insert_dashboard_session(&self, token: &str, now_ms: i64) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO dashboard_sessions (token, created_at) VALUES (?1, ?2)",
            params![token, now_ms],
        )?;
        Ok(())
    }

    pub fn dashboard_session_exists(&self, token: &str) -> Result<bool, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM dashboard_sessions WHERE token = ?1",
            params![token],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn delete_dashboard_session(&self, token: &str) -> Result<bool, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "DELETE FROM dashboard_sessions WHERE token = ?1",
            params![token],
        )?;
        Ok(rows > 0)
    }

    // ── Server state key-value ──

    pub fn get_state(&self, key: &str) -> Result<Option<String>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT value FROM server_state WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
    }

    pub fn set_state(&self, key: &str, value: &str) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO server_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

fn row_to_registration(row: &rusqlite::Row<'_>) -> Result<ExtensionRegistration, rusqlite::Error> {
    let status_str: String = row.get(6)?;
    Ok(ExtensionRegistration {
        id: row.get(0)?,
        extension_id: row.get(1)?,
        public_key: row.get(2)?,
        hostname: row.get(3)?,
        os: row.get(4)?,
        extension_version: row.get(5)?,
        // Fail closed: an unknown status never authorizes anything.
        status: RegistrationStatus::parse(&status_str).unwrap_or(RegistrationStatus::Rejected),
        created_at: row.get(7)?,
        last_updated_at: row.get(8)?,
    })
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<GameSession, rusqlite::Error> {
    let status_str: String = row.get(6)?;
    Ok(GameSession {
        session_id: row.get(0)?,
        game_id: row.get(1)?,
        game_name: row.get(2)?,
        start_time: row.get(3)?,
        end_time: row.get(4)?,
        duration_secs: row.get(5)?,
        // Fail closed: an unknown status is treated as terminal.
        status: SessionStatus::parse(&status_str).unwrap_or(SessionStatus::Stale),
    })
}

fn row_to_note(row: &rusqlite::Row<'_>) -> Result<GameNote, rusqlite::Error> {
    Ok(GameNote {
        id: row.get(0)?,
        title: row.get(1)?,
        content: row.get(2)?,
        image_path: row.get(3)?,
        game_id: row.get(4)?,
        session_id: row.get(5)?,
        created_at: row.get(6)?,
        last_updated_at: row.get(7)?,
        deleted_at: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::RegisterCommand;

    fn storage() -> (Storage, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Storage::open(&dir.path().join("test.db")).unwrap();
        (db, dir)
    }

    fn register_cmd(extension_id: &str) -> RegisterCommand {
        RegisterCommand {
            extension_id: extension_id.into(),
            public_key: "ab".repeat(32),
            hostname: Some("desk".into()),
            os: None,
            extension_version: None,
        }
    }

    #[test]
    fn register_then_reset_then_trusted_conflict() {
        let (db, _dir) = storage();

        let RegisterOutcome::Created(reg) = db.register_extension(&register_cmd("e1"), 100).unwrap()
        else {
            panic!("expected Created")
        };
        assert_eq!(reg.status, RegistrationStatus::Pending);

        // Still pending: re-register resets in place, same row id.
        let RegisterOutcome::Reset(reset) = db.register_extension(&register_cmd("e1"), 200).unwrap()
        else {
            panic!("expected Reset")
        };
        assert_eq!(reset.id, reg.id);
        assert_eq!(reset.last_updated_at, 200);

        // Trusted: re-register is refused.
        let Transition::Done(_) = db
            .transition_registration(
                reg.id,
                RegistrationStatus::Pending,
                RegistrationStatus::Trusted,
                300,
            )
            .unwrap()
        else {
            panic!("expected Done")
        };
        assert!(matches!(
            db.register_extension(&register_cmd("e1"), 400).unwrap(),
            RegisterOutcome::TrustedExists
        ));
    }

    #[test]
    fn approve_succeeds_once_then_reports_ineligible() {
        let (db, _dir) = storage();
        let RegisterOutcome::Created(reg) = db.register_extension(&register_cmd("e1"), 1).unwrap()
        else {
            panic!("expected Created")
        };

        let first = db
            .transition_registration(
                reg.id,
                RegistrationStatus::Pending,
                RegistrationStatus::Trusted,
                2,
            )
            .unwrap();
        assert!(matches!(first, Transition::Done(_)));

        let second = db
            .transition_registration(
                reg.id,
                RegistrationStatus::Pending,
                RegistrationStatus::Trusted,
                3,
            )
            .unwrap();
        assert!(matches!(
            second,
            Transition::Ineligible(RegistrationStatus::Trusted)
        ));
    }

    #[test]
    fn transition_unknown_id_reports_not_found() {
        let (db, _dir) = storage();
        let result = db
            .transition_registration(
                999,
                RegistrationStatus::Pending,
                RegistrationStatus::Trusted,
                1,
            )
            .unwrap();
        assert!(matches!(result, Transition::NotFound));
    }

    #[test]
    fn remove_is_unconditional() {
        let (db, _dir) = storage();
        let RegisterOutcome::Created(reg) = db.register_extension(&register_cmd("e1"), 1).unwrap()
        else {
            panic!("expected Created")
        };

        assert!(db.remove_registration(reg.id).unwrap());
        assert!(!db.remove_registration(reg.id).unwrap());
        assert!(db.get_registration_by_extension_id("e1").unwrap().is_none());
    }

    #[test]
    fn duplicate_open_is_refused() {
        let (db, _dir) = storage();
        let cmd = OpenCommand {
            session_id: "s1".into(),
            game_id: "g1".into(),
            game_name: "Hades".into(),
            client_utc_now: 1_000,
        };

        assert!(db.open_session(&cmd).unwrap().is_some());
        assert!(db.open_session(&cmd).unwrap().is_none());
    }

    #[test]
    fn close_computes_duration_and_is_single_shot() {
        let (db, _dir) = storage();
        let start = 1_700_000_000_000;
        db.open_session(&OpenCommand {
            session_id: "s1".into(),
            game_id: "g1".into(),
            game_name: "Hades".into(),
            client_utc_now: start,
        })
        .unwrap();

        let closed = db
            .close_session("s1", start + 3_600_000)
            .unwrap()
            .expect("session should close");
        assert_eq!(closed.status, SessionStatus::Closed);
        assert_eq!(closed.duration_secs, Some(3_600));
        assert_eq!(closed.end_time, Some(start + 3_600_000));

        // Already closed and unknown ids both report failure, no mutation.
        assert!(db.close_session("s1", start + 7_200_000).unwrap().is_none());
        assert!(db.close_session("nope", start).unwrap().is_none());

        let rows = db.recent_sessions(10).unwrap();
        assert_eq!(rows[0].duration_secs, Some(3_600));
    }

    #[test]
    fn sweep_marks_only_overage_in_progress_rows() {
        let (db, _dir) = storage();
        for (id, start) in [("old", 1_000), ("fresh", 900_000)] {
            db.open_session(&OpenCommand {
                session_id: id.into(),
                game_id: "g".into(),
                game_name: "G".into(),
                client_utc_now: start,
            })
            .unwrap();
        }
        db.close_session("fresh", 950_000).unwrap();

        // Cutoff catches "old" but not the closed row.
        let swept = db.sweep_stale_sessions(500_000).unwrap();
        assert_eq!(swept, 1);

        let rows = db.recent_sessions(10).unwrap();
        let old = rows.iter().find(|s| s.session_id == "old").unwrap();
        assert_eq!(old.status, SessionStatus::Stale);

        // Sweeping again finds nothing.
        assert_eq!(db.sweep_stale_sessions(500_000).unwrap(), 0);
    }

    #[test]
    fn recent_sessions_order_most_recent_first() {
        let (db, _dir) = storage();
        for (id, start) in [("a", 100), ("c", 300), ("b", 200)] {
            db.open_session(&OpenCommand {
                session_id: id.into(),
                game_id: "g".into(),
                game_name: "G".into(),
                client_utc_now: start,
            })
            .unwrap();
        }

        let ids: Vec<String> = db
            .recent_sessions(10)
            .unwrap()
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[test]
    fn notes_replace_keeps_tombstones() {
        let (db, _dir) = storage();
        let notes = vec![
            GameNote {
                id: "n1".into(),
                title: "alive".into(),
                content: "x".into(),
                image_path: None,
                game_id: None,
                session_id: None,
                created_at: 1,
                last_updated_at: 2,
                deleted_at: None,
            },
            GameNote {
                id: "n2".into(),
                title: "gone".into(),
                content: "y".into(),
                image_path: None,
                game_id: Some("g1".into()),
                session_id: None,
                created_at: 1,
                last_updated_at: 3,
                deleted_at: Some(3),
            },
        ];

        db.replace_notes(&notes).unwrap();
        assert_eq!(db.all_notes().unwrap().len(), 2);

        let live = db.live_notes().unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, "n1");
    }

    #[test]
    fn server_state_round_trip() {
        let (db, _dir) = storage();
        assert_eq!(db.get_state("k").unwrap(), None);
        db.set_state("k", "v1").unwrap();
        db.set_state("k", "v2").unwrap();
        assert_eq!(db.get_state("k").unwrap(), Some("v2".into()));
    }

    #[test]
    fn dashboard_session_lifecycle() {
        let (db, _dir) = storage();
        db.insert_dashboard_session("tok", 1).unwrap();
        assert!(db.dashboard_session_exists("tok").unwrap());
        assert!(db.delete_dashboard_session("tok").unwrap());
        assert!(!db.dashboard_session_exists("tok").unwrap());
        assert!(!db.delete_dashboard_session("tok").unwrap());
    }
}
