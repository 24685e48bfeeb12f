//! Server configuration.
//!
//! Built once in `main` from the environment and injected into the shared
//! state. Nothing reads the environment after startup.

use std::path::PathBuf;

/// Runtime configuration for the companion server.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address, e.g. `0.0.0.0:3210`.
    pub addr: String,
    /// SQLite database path.
    pub db_path: PathBuf,
    /// Root directory for stored screenshots and other served files.
    pub data_dir: PathBuf,
    /// Signed-request timestamp freshness window, seconds.
    pub freshness_window_secs: i64,
    /// Age past which an in-progress play session is swept to stale, seconds.
    pub session_stale_secs: i64,
    /// Broadcast heartbeat cadence, seconds.
    pub heartbeat_secs: u64,
}

impl Config {
    /// Read configuration from `LUDEX_*` environment variables,
    /// falling back to defaults suitable for a single-box install.
    pub fn from_env() -> Self {
        Self {
            addr: std::env::var("LUDEX_ADDR").unwrap_or_else(|_| "0.0.0.0:3210".to_string()),
            db_path: std::env::var("LUDEX_DB")
                .unwrap_or_else(|_| "ludex.db".to_string())
                .into(),
            data_dir: std::env::var("LUDEX_DATA_DIR")
                .unwrap_or_else(|_| "data".to_string())
                .into(),
            freshness_window_secs: env_i64("LUDEX_FRESHNESS_SECS", 300),
            session_stale_secs: env_i64("LUDEX_SESSION_STALE_SECS", 21_600),
            heartbeat_secs: env_i64("LUDEX_HEARTBEAT_SECS", 30).max(1) as u64,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:0".to_string(),
            db_path: "ludex.db".into(),
            data_dir: "data".into(),
            freshness_window_secs: 300,
            session_stale_secs: 21_600,
            heartbeat_secs: 30,
        }
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.freshness_window_secs, 300);
        assert_eq!(cfg.session_stale_secs, 21_600);
        assert!(cfg.heartbeat_secs > 0);
    }
}
