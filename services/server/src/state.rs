//! Shared server state: subscriber session registry and counters.

use dt_protocol::{ServerFrame, SubscriberSettings};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::db::Db;

/// The subscriber's filter inputs, snapshotted at auth and refreshed
/// atomically after every mutating command.  A token in flight filters
/// against whichever snapshot was current when its evaluation started.
#[derive(Debug, Clone, Default)]
pub struct FilterSnapshot {
    pub settings: SubscriberSettings,
    pub whitelist: HashSet<String>,
    pub blacklist: HashSet<String>,
}

/// A registered subscriber session as the dispatcher sees it.
#[derive(Clone)]
pub struct SessionHandle {
    pub user_id: i64,
    pub username: String,
    pub snapshot: Arc<RwLock<FilterSnapshot>>,
    /// Outbound frames; drained by the session task in order.
    pub outbound: mpsc::Sender<ServerFrame>,
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Monotonic dispatch counters plus the live connection gauge.
#[derive(Debug, Default)]
pub struct Counters {
    pub tokens_received: AtomicU64,
    pub tokens_sent: AtomicU64,
    pub tokens_filtered: AtomicU64,
    pub active_connections: AtomicU64,
}

/// A point-in-time view of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub tokens_received: u64,
    pub tokens_sent: u64,
    pub tokens_filtered: u64,
    pub active_connections: u64,
}

impl Counters {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tokens_received: self.tokens_received.load(Ordering::Relaxed),
            tokens_sent: self.tokens_sent.load(Ordering::Relaxed),
            tokens_filtered: self.tokens_filtered.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub sessions: Arc<RwLock<HashMap<Uuid, SessionHandle>>>,
    pub stats: Arc<Counters>,
}

impl AppState {
    pub fn new(db: Db) -> Self {
        AppState {
            db,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(Counters::default()),
        }
    }

    pub async fn register_session(&self, session_id: Uuid, handle: SessionHandle) {
        self.sessions.write().await.insert(session_id, handle);
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn unregister_session(&self, session_id: &Uuid) {
        if self.sessions.write().await.remove(session_id).is_some() {
            self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Snapshot the current subscriber set for one dispatch round.
    pub async fn session_handles(&self) -> Vec<SessionHandle> {
        self.sessions.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(user_id: i64, username: &str) -> (SessionHandle, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(8);
        (
            SessionHandle {
                user_id,
                username: username.to_owned(),
                snapshot: Arc::new(RwLock::new(FilterSnapshot::default())),
                outbound: tx,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn session_registry_tracks_register_and_unregister() {
        let state = AppState::new(Db::open_in_memory().expect("db"));
        let id = Uuid::new_v4();
        let (h, _rx) = handle(1, "trader-1");

        state.register_session(id, h).await;
        assert_eq!(state.session_handles().await.len(), 1);
        assert_eq!(state.stats.snapshot().active_connections, 1);

        state.unregister_session(&id).await;
        assert!(state.session_handles().await.is_empty());
        assert_eq!(state.stats.snapshot().active_connections, 0);
    }

    #[tokio::test]
    async fn unregistering_an_unknown_session_leaves_the_gauge_alone() {
        let state = AppState::new(Db::open_in_memory().expect("db"));
        state.unregister_session(&Uuid::new_v4()).await;
        assert_eq!(state.stats.snapshot().active_connections, 0);
    }

    #[tokio::test]
    async fn snapshot_refresh_is_visible_to_existing_handles() {
        let state = AppState::new(Db::open_in_memory().expect("db"));
        let id = Uuid::new_v4();
        let (h, _rx) = handle(1, "trader-1");
        let snapshot = Arc::clone(&h.snapshot);
        state.register_session(id, h).await;

        {
            let mut guard = snapshot.write().await;
            guard.blacklist.insert("0xDEAD".to_owned());
        }
        let handles = state.session_handles().await;
        assert!(handles[0].snapshot.read().await.blacklist.contains("0xDEAD"));
    }
}
