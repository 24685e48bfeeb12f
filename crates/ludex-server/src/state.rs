//! Shared server state.
//!
//! Everything a handler needs is constructed in `main` and injected here;
//! there are no process-wide singletons and no lazy first-use init.

use crate::broadcast::Broadcaster;
use crate::config::Config;
use crate::storage::Storage;

/// Shared application state, wrapped in an `Arc` by the router.
pub struct AppState {
    pub config: Config,
    pub db: Storage,
    pub broadcaster: Broadcaster,
}

impl AppState {
    pub fn new(config: Config, db: Storage) -> Self {
        Self {
            config,
            db,
            broadcaster: Broadcaster::new(),
        }
    }
}

/// Current wall-clock time as UNIX milliseconds.
pub fn unix_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
