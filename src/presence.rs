//! Presence state: who is currently looking at a board.
//!
//! DESIGN
//! ======
//! While running, the store upserts this user's (user, board) record on a
//! fixed heartbeat and re-reads every record of the board seen within the
//! freshness window. A change-feed listener on `user_presence` triggers an
//! extra refresh whenever anyone else's heartbeat lands.
//!
//! The active set only holds users whose profile resolved; records for
//! deleted accounts are dropped.
//!
//! ERROR HANDLING
//! ==============
//! Everything here is background work: failures are logged and the active
//! set stays as it was. `stop` never fails.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{Backend, DataBackend, Realtime, Relation, RowFilter};
use crate::clock::Clock;
use crate::config::{DEFAULT_PRESENCE_HEARTBEAT_SECS, DEFAULT_PRESENCE_WINDOW_SECS};
use crate::model::Profile;

/// Presence timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceSettings {
    /// How often the running store re-announces itself and refreshes.
    pub heartbeat_interval: Duration,
    /// Records older than this are not active. The boundary is exclusive.
    pub freshness_window: Duration,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(DEFAULT_PRESENCE_HEARTBEAT_SECS),
            freshness_window: Duration::from_secs(DEFAULT_PRESENCE_WINDOW_SECS),
        }
    }
}

struct Running {
    board_id: Uuid,
    user_id: Uuid,
    ticker: JoinHandle<()>,
    listener: Option<JoinHandle<()>>,
}

impl Running {
    fn abort(&self) {
        self.ticker.abort();
        if let Some(listener) = &self.listener {
            listener.abort();
        }
    }
}

struct PresenceInner {
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
    settings: PresenceSettings,
    active: RwLock<Vec<Profile>>,
    /// Start/stop are serialized on this lock.
    run: Mutex<Option<Running>>,
    running: AtomicBool,
    /// Bumped by `stop` so a refresh already in flight cannot repopulate the set.
    generation: AtomicU64,
}

impl Drop for PresenceInner {
    fn drop(&mut self) {
        if let Some(running) = self.run.get_mut().take() {
            running.abort();
        }
    }
}

/// Presence state for one board at a time. Cheap to clone.
#[derive(Clone)]
pub struct PresenceStore {
    inner: Arc<PresenceInner>,
}

impl PresenceStore {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, clock: Arc<dyn Clock>, settings: PresenceSettings) -> Self {
        Self {
            inner: Arc::new(PresenceInner {
                backend,
                clock,
                settings,
                active: RwLock::new(Vec::new()),
                run: Mutex::new(None),
                running: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Write "`user_id` is on `board_id` now".
    pub async fn heartbeat(&self, user_id: Uuid, board_id: Uuid) {
        let now = self.inner.clock.now();
        if let Err(e) = self.inner.backend.upsert_presence(user_id, board_id, now).await {
            error!(error = %e, code = e.error_code(), %user_id, %board_id, "presence heartbeat failed");
        }
    }

    /// Replace the active set with every user on the board seen inside the
    /// freshness window.
    pub async fn refresh_active_users(&self, board_id: Uuid) {
        let generation = self.inner.generation.load(Ordering::SeqCst);
        self.refresh(board_id, generation).await;
    }

    async fn refresh(&self, board_id: Uuid, generation: u64) {
        let since = self.inner.clock.now() - self.inner.settings.freshness_window;
        let entries = match self.inner.backend.list_presence_since(board_id, since).await {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, code = e.error_code(), %board_id, "presence refresh failed");
                return;
            }
        };
        let profiles: Vec<Profile> = entries.into_iter().filter_map(|entry| entry.profile).collect();

        let mut active = self.inner.active.write().await;
        if self.inner.generation.load(Ordering::SeqCst) != generation {
            debug!(%board_id, "discarding presence refresh from a stopped session");
            return;
        }
        *active = profiles;
    }

    /// Announce presence immediately, then keep announcing and refreshing
    /// until [`stop`](Self::stop). A second call while running is ignored.
    pub async fn start(&self, board_id: Uuid, user_id: Uuid) {
        let mut run = self.inner.run.lock().await;
        if let Some(current) = run.as_ref() {
            if current.board_id == board_id && current.user_id == user_id {
                debug!(%board_id, "presence already running");
            } else {
                warn!(
                    running_board = %current.board_id,
                    requested_board = %board_id,
                    "presence already running for another board; stop it first"
                );
            }
            return;
        }

        let generation = self.inner.generation.load(Ordering::SeqCst);
        self.heartbeat(user_id, board_id).await;
        self.refresh(board_id, generation).await;

        let ticker = self.spawn_ticker(board_id, user_id, generation);
        let listener = self.spawn_listener(board_id, generation).await;

        *run = Some(Running { board_id, user_id, ticker, listener });
        self.inner.running.store(true, Ordering::SeqCst);
        info!(%board_id, %user_id, "presence started");
    }

    fn spawn_ticker(&self, board_id: Uuid, user_id: Uuid, generation: u64) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.settings.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let store = PresenceStore { inner };
                store.heartbeat(user_id, board_id).await;
                store.refresh(board_id, generation).await;
            }
        })
    }

    async fn spawn_listener(&self, board_id: Uuid, generation: u64) -> Option<JoinHandle<()>> {
        let mut feed = match self
            .inner
            .backend
            .subscribe(Relation::UserPresence, RowFilter::board(board_id))
            .await
        {
            Ok(feed) => feed,
            Err(e) => {
                warn!(error = %e, code = e.error_code(), %board_id, "presence change feed unavailable; relying on heartbeat");
                return None;
            }
        };

        let weak = Arc::downgrade(&self.inner);
        Some(tokio::spawn(async move {
            while feed.next().await.is_some() {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                PresenceStore { inner }.refresh(board_id, generation).await;
            }
        }))
    }

    /// Stop announcing, delete this user's record, and clear the active set.
    pub async fn stop(&self) {
        let running = self.inner.run.lock().await.take();
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.running.store(false, Ordering::SeqCst);

        if let Some(running) = running {
            running.abort();
            if let Err(e) = self.inner.backend.delete_presence(running.user_id, running.board_id).await {
                warn!(error = %e, code = e.error_code(), board_id = %running.board_id, "presence record delete failed");
            }
            info!(board_id = %running.board_id, "presence stopped");
        }

        self.inner.active.write().await.clear();
    }

    /// Profiles active on the board, most recently seen first.
    pub async fn active_users(&self) -> Vec<Profile> {
        self.inner.active.read().await.clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
