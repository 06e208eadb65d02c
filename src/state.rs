//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` bundles the four stores over one backend and performs the
//! board page's lifecycle: opening a board loads its tasks, follows task
//! changes, and starts presence; leaving undoes all three. Clone is cheap;
//! every store is Arc-backed.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::{Backend, BackendError};
use crate::boards::BoardStore;
use crate::clock::Clock;
use crate::presence::{PresenceSettings, PresenceStore};
use crate::session::SessionStore;
use crate::tasks::TaskStore;

#[derive(Clone)]
pub struct AppState {
    pub session: SessionStore,
    pub boards: BoardStore,
    pub tasks: TaskStore,
    pub presence: PresenceStore,
    /// Board currently open, if any.
    open_board: Arc<RwLock<Option<Uuid>>>,
}

impl AppState {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, clock: Arc<dyn Clock>, presence: PresenceSettings) -> Self {
        Self {
            session: SessionStore::new(backend.clone()),
            boards: BoardStore::new(backend.clone()),
            tasks: TaskStore::new(backend.clone()),
            presence: PresenceStore::new(backend, clock, presence),
            open_board: Arc::new(RwLock::new(None)),
        }
    }

    /// Load a board's tasks, follow its changes, and announce presence on it.
    /// A board already open is left first.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::NotAuthenticated`] without a signed-in user, or
    /// the task load error. A change feed that cannot be opened is logged
    /// and the board opens without live updates.
    pub async fn open_board(&self, board_id: Uuid) -> Result<(), BackendError> {
        let Some(identity) = self.session.identity().await else {
            return Err(BackendError::NotAuthenticated);
        };

        let previous = *self.open_board.read().await;
        if let Some(previous) = previous {
            if previous != board_id {
                self.leave_board().await;
            }
        }

        self.tasks.load(board_id).await?;
        if let Err(e) = self.tasks.subscribe_to_changes(board_id).await {
            warn!(error = %e, %board_id, "board opened without live task updates");
        }
        self.presence.start(board_id, identity.id).await;

        *self.open_board.write().await = Some(board_id);
        info!(%board_id, user_id = %identity.id, "board opened");
        Ok(())
    }

    /// Stop following the open board and drop its cached state.
    pub async fn leave_board(&self) {
        self.tasks.unsubscribe();
        self.tasks.clear().await;
        self.presence.stop().await;
        if let Some(board_id) = self.open_board.write().await.take() {
            info!(%board_id, "board left");
        }
    }

    pub async fn current_board(&self) -> Option<Uuid> {
        *self.open_board.read().await
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================

#[cfg(test)]
pub mod test_helpers {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::backend::{AuthBackend, DataBackend, Realtime, Relation, RowFilter, Subscription};
    use crate::clock::ManualClock;
    use crate::model::{AuthEvent, Board, Identity, NewBoard, NewTask, PresenceEntry, Task, TaskPatch};
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use time::OffsetDateTime;
    use time::macros::datetime;
    use tokio::sync::{broadcast, oneshot};

    /// `AppState` over a fresh in-memory backend with a frozen clock.
    #[must_use]
    pub fn test_app_state() -> (Arc<MemoryBackend>, AppState) {
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 09:00:00 UTC)));
        let backend = Arc::new(MemoryBackend::new(clock.clone()));
        let state = AppState::new(backend.clone(), clock, PresenceSettings::default());
        (backend, state)
    }

    /// Register and sign in a user, then sync the session store.
    pub async fn signed_in(backend: &MemoryBackend, state: &AppState, email: &str) -> Identity {
        backend.sign_up(email, "secret1", Some("Tester")).await.unwrap();
        backend.sign_in(email, "secret1").await.unwrap();
        state.session.fetch_current_identity().await.unwrap().unwrap()
    }

    /// Create a board owned by `owner` and return its ID.
    pub async fn seed_board(state: &AppState, owner: Uuid) -> Uuid {
        let board = NewBoard { name: "Sprint".into(), description: None, created_by: owner };
        state.boards.create(board).await.unwrap().id
    }

    /// Memory backend whose task and presence list reads can be held open.
    /// A held read has already fetched its rows and returns them once released.
    pub struct GatedBackend {
        pub inner: Arc<MemoryBackend>,
        holds: StdMutex<VecDeque<oneshot::Receiver<()>>>,
    }

    impl GatedBackend {
        #[must_use]
        pub fn new(inner: Arc<MemoryBackend>) -> Self {
            Self { inner, holds: StdMutex::new(VecDeque::new()) }
        }

        /// Hold the next list read until the returned sender fires or drops.
        #[must_use]
        pub fn hold_next_read(&self) -> oneshot::Sender<()> {
            let (tx, rx) = oneshot::channel();
            self.holds.lock().unwrap().push_back(rx);
            tx
        }

        async fn gate(&self) {
            let hold = self.holds.lock().unwrap().pop_front();
            if let Some(hold) = hold {
                let _ = hold.await;
            }
        }
    }

    #[async_trait::async_trait]
    impl AuthBackend for GatedBackend {
        async fn sign_up(&self, email: &str, password: &str, full_name: Option<&str>) -> Result<Identity, BackendError> {
            self.inner.sign_up(email, password, full_name).await
        }

        async fn sign_in(&self, email: &str, password: &str) -> Result<Identity, BackendError> {
            self.inner.sign_in(email, password).await
        }

        async fn sign_out(&self) -> Result<(), BackendError> {
            self.inner.sign_out().await
        }

        async fn current_identity(&self) -> Result<Option<Identity>, BackendError> {
            self.inner.current_identity().await
        }

        fn auth_events(&self) -> broadcast::Receiver<AuthEvent> {
            self.inner.auth_events()
        }
    }

    #[async_trait::async_trait]
    impl DataBackend for GatedBackend {
        async fn list_boards(&self) -> Result<Vec<Board>, BackendError> {
            self.inner.list_boards().await
        }

        async fn insert_board(&self, board: &NewBoard) -> Result<Board, BackendError> {
            self.inner.insert_board(board).await
        }

        async fn delete_board(&self, board_id: Uuid) -> Result<(), BackendError> {
            self.inner.delete_board(board_id).await
        }

        async fn list_tasks(&self, board_id: Uuid) -> Result<Vec<Task>, BackendError> {
            let rows = self.inner.list_tasks(board_id).await;
            self.gate().await;
            rows
        }

        async fn insert_task(&self, task: &NewTask) -> Result<Task, BackendError> {
            self.inner.insert_task(task).await
        }

        async fn update_task(&self, task_id: Uuid, patch: &TaskPatch) -> Result<Task, BackendError> {
            self.inner.update_task(task_id, patch).await
        }

        async fn delete_task(&self, task_id: Uuid) -> Result<(), BackendError> {
            self.inner.delete_task(task_id).await
        }

        async fn upsert_presence(
            &self,
            user_id: Uuid,
            board_id: Uuid,
            last_seen: OffsetDateTime,
        ) -> Result<(), BackendError> {
            self.inner.upsert_presence(user_id, board_id, last_seen).await
        }

        async fn list_presence_since(
            &self,
            board_id: Uuid,
            since: OffsetDateTime,
        ) -> Result<Vec<PresenceEntry>, BackendError> {
            let rows = self.inner.list_presence_since(board_id, since).await;
            self.gate().await;
            rows
        }

        async fn delete_presence(&self, user_id: Uuid, board_id: Uuid) -> Result<(), BackendError> {
            self.inner.delete_presence(user_id, board_id).await
        }
    }

    #[async_trait::async_trait]
    impl Realtime for GatedBackend {
        async fn subscribe(&self, relation: Relation, filter: RowFilter) -> Result<Subscription, BackendError> {
            self.inner.subscribe(relation, filter).await
        }
    }
}

#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
