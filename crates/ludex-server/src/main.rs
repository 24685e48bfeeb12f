//! Ludex companion server.
//!
//! A self-hosted service the desktop game-library extension pushes catalog,
//! session, note, and screenshot data to, and the browser dashboard reads
//! from. Extensions authenticate with Ed25519-signed requests after explicit
//! approval; the dashboard authenticates with a password-backed session.

mod api;
mod auth;
mod broadcast;
mod catalog;
mod config;
mod dashboard;
mod error;
mod notes;
mod sessions;
mod state;
mod storage;
mod trust;

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use config::Config;
use state::AppState;
use storage::Storage;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();

    let db = match Storage::open(&config.db_path) {
        Ok(db) => db,
        Err(e) => {
            tracing::error!("failed to open database {}: {e}", config.db_path.display());
            std::process::exit(1);
        }
    };

    if let Err(e) = std::fs::create_dir_all(config.data_dir.join("screenshots")) {
        tracing::warn!("cannot create data dir {}: {e}", config.data_dir.display());
    }

    let addr = config.addr.clone();
    let heartbeat_secs = config.heartbeat_secs;
    let state = Arc::new(AppState::new(config, db));

    // Heartbeat: keeps idle streams alive and flushes out dead peers, whose
    // guards then drop out of the registry.
    let heartbeat_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(heartbeat_secs));
        loop {
            interval.tick().await;
            let (total, authorized) = heartbeat_state.broadcaster.stream_counts();
            tracing::debug!(total, authorized, "heartbeat");
            let event = heartbeat_state.broadcaster.next_heartbeat();
            heartbeat_state.broadcaster.broadcast(event);
        }
    });

    let app = api::router(state);

    tracing::info!("ludex server listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
