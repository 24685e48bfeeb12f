//! Event fan-out to dashboard streams.
//!
//! Every state change publishes a tagged event onto a single broadcast
//! channel; each open SSE connection holds a receiver. The registry tracks
//! connections with the authorization flag decided once at connect time;
//! unauthorized streams only ever see the restricted subset. A stream
//! leaves the registry when its guard drops, which happens exactly when the
//! client disconnects; that is the only normal termination.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::sessions::GameSession;
use crate::trust::ExtensionRegistration;

/// Broadcast channel capacity. A dashboard that lags this far behind
/// misses events and should reload.
const BROADCAST_CAPACITY: usize = 256;

/// Events pushed to dashboard streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Free-form server notice.
    Message { text: String },

    /// The extension stored a new screenshot.
    ScreenshotTaken { file: String, url: String },

    /// A catalog sync changed the library.
    GameLibraryUpdated {
        added: usize,
        changed: usize,
        removed: usize,
    },

    SessionOpened { session: GameSession },

    SessionClosed { session: GameSession },

    /// The stale sweep reclassified sessions.
    RecentGameSessionsUpdated { stale: usize },

    /// Periodic keep-alive; also what flushes out dead peers.
    Heartbeat { seq: u64 },

    /// A new extension registration awaits dashboard approval.
    CreatedExtensionRegistration { registration: ExtensionRegistration },

    /// Sent to streams that connected without a valid dashboard session.
    AuthError { message: String },
}

impl ServerEvent {
    /// Whether this event may only go to authorized streams.
    /// `heartbeat` and `authError` are the restricted subset everyone gets.
    pub fn is_privileged(&self) -> bool {
        !matches!(self, Self::Heartbeat { .. } | Self::AuthError { .. })
    }
}

/// Registry entry for one open stream.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub authorized: bool,
}

/// Fan-out hub. One per server process.
pub struct Broadcaster {
    tx: broadcast::Sender<ServerEvent>,
    streams: Arc<Mutex<HashMap<u64, StreamInfo>>>,
    next_stream_id: AtomicU64,
    heartbeat_seq: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            tx,
            streams: Arc::new(Mutex::new(HashMap::new())),
            next_stream_id: AtomicU64::new(1),
            heartbeat_seq: AtomicU64::new(0),
        }
    }

    /// Push an event to every currently-open stream.
    pub fn broadcast(&self, event: ServerEvent) {
        // No receivers is normal (no dashboard connected); not an error.
        let delivered = self.tx.send(event).unwrap_or(0);
        tracing::debug!(delivered, "event broadcast");
    }

    /// Register a new stream and get its receiver. The returned guard must
    /// live as long as the connection; dropping it removes the stream from
    /// the registry.
    pub fn subscribe(&self, authorized: bool) -> (StreamGuard, broadcast::Receiver<ServerEvent>) {
        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        self.streams
            .lock()
            .unwrap()
            .insert(id, StreamInfo { authorized });
        tracing::info!(stream = id, authorized, "stream connected");

        let guard = StreamGuard {
            id,
            streams: Arc::clone(&self.streams),
        };
        (guard, self.tx.subscribe())
    }

    /// (total, authorized) counts of currently-open streams.
    pub fn stream_counts(&self) -> (usize, usize) {
        let streams = self.streams.lock().unwrap();
        let authorized = streams.values().filter(|s| s.authorized).count();
        (streams.len(), authorized)
    }

    /// Produce the next heartbeat event.
    pub fn next_heartbeat(&self) -> ServerEvent {
        ServerEvent::Heartbeat {
            seq: self.heartbeat_seq.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes its stream from the registry on drop.
pub struct StreamGuard {
    id: u64,
    streams: Arc<Mutex<HashMap<u64, StreamInfo>>>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.streams.lock().unwrap().remove(&self.id);
        tracing::info!(stream = self.id, "stream disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restricted_subset_classification() {
        assert!(!ServerEvent::Heartbeat { seq: 0 }.is_privileged());
        assert!(
            !ServerEvent::AuthError {
                message: "no session".into()
            }
            .is_privileged()
        );
        assert!(
            ServerEvent::GameLibraryUpdated {
                added: 1,
                changed: 0,
                removed: 0
            }
            .is_privileged()
        );
        assert!(
            ServerEvent::Message {
                text: "hi".into()
            }
            .is_privileged()
        );
    }

    #[test]
    fn events_tag_with_camel_case_type() {
        let json = serde_json::to_string(&ServerEvent::RecentGameSessionsUpdated { stale: 2 }).unwrap();
        assert!(json.contains("\"type\":\"recentGameSessionsUpdated\""), "{json}");
    }

    #[test]
    fn broadcast_reaches_open_streams_only() {
        let hub = Broadcaster::new();
        let (guard_a, mut rx_a) = hub.subscribe(true);
        let (guard_b, mut rx_b) = hub.subscribe(false);
        assert_eq!(hub.stream_counts(), (2, 1));

        hub.broadcast(ServerEvent::Heartbeat { seq: 7 });
        assert!(matches!(rx_a.try_recv(), Ok(ServerEvent::Heartbeat { seq: 7 })));
        assert!(matches!(rx_b.try_recv(), Ok(ServerEvent::Heartbeat { seq: 7 })));

        // Disconnect removes the stream from the registry deterministically.
        drop(guard_b);
        drop(rx_b);
        assert_eq!(hub.stream_counts(), (1, 1));

        hub.broadcast(ServerEvent::Heartbeat { seq: 8 });
        assert!(matches!(rx_a.try_recv(), Ok(ServerEvent::Heartbeat { seq: 8 })));

        drop(guard_a);
        assert_eq!(hub.stream_counts(), (0, 0));
    }

    #[test]
    fn heartbeat_sequence_increments() {
        let hub = Broadcaster::new();
        let ServerEvent::Heartbeat { seq: first } = hub.next_heartbeat() else {
            panic!("expected heartbeat")
        };
        let ServerEvent::Heartbeat { seq: second } = hub.next_heartbeat() else {
            panic!("expected heartbeat")
        };
        assert_eq!(second, first + 1);
    }
}
