//! In-process backend that keeps rows and sessions in memory.
//!
//! DESIGN
//! ======
//! Behaves like the hosted service from a store's point of view: rows come
//! back ordered the way the row API orders them, writes publish change
//! events to matching subscribers, and sign-in/out publish auth events.
//! `set_offline` makes every call fail with a transport error so the
//! stores' failure paths can be exercised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use super::{
    AuthBackend, BackendError, ChangeEvent, ChangeKind, DataBackend, Realtime, Relation, RowFilter, Subscription,
};
use crate::clock::{Clock, SystemClock};
use crate::model::{
    AssigneeSummary, AuthEvent, Board, Identity, NewBoard, NewTask, PresenceEntry, PresenceRecord, Profile, Task,
    TaskPatch,
};

const MIN_PASSWORD_LEN: usize = 6;
const SUBSCRIBER_BUFFER: usize = 64;
const AUTH_EVENT_BUFFER: usize = 16;

struct Account {
    password: String,
    identity: Identity,
}

struct Subscriber {
    relation: Relation,
    filter: RowFilter,
    tx: mpsc::Sender<ChangeEvent>,
}

#[derive(Default)]
struct Store {
    accounts: HashMap<String, Account>,
    session: Option<Identity>,
    profiles: HashMap<Uuid, Profile>,
    boards: Vec<Board>,
    tasks: Vec<Task>,
    presence: HashMap<(Uuid, Uuid), PresenceRecord>,
    subscribers: Vec<Subscriber>,
}

impl Store {
    /// Publish a change to every live subscriber whose filter matches one of
    /// the row's columns. Closed subscribers are pruned.
    fn notify(&mut self, relation: Relation, kind: ChangeKind, columns: &[(&str, String)]) {
        let event = ChangeEvent { relation, kind };
        self.subscribers.retain(|sub| !sub.tx.is_closed());
        for sub in &self.subscribers {
            if sub.relation != relation {
                continue;
            }
            if columns.iter().any(|(column, value)| sub.filter.matches(column, value)) {
                let _ = sub.tx.try_send(event);
            }
        }
    }

    fn assignee_of(&self, task: &Task) -> Option<AssigneeSummary> {
        let profile = self.profiles.get(&task.assigned_to?)?;
        Some(AssigneeSummary { full_name: profile.full_name.clone(), email: profile.email.clone() })
    }
}

/// In-memory implementation of all backend traits.
pub struct MemoryBackend {
    store: Mutex<Store>,
    clock: Arc<dyn Clock>,
    auth_tx: broadcast::Sender<AuthEvent>,
    offline: AtomicBool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryBackend {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (auth_tx, _) = broadcast::channel(AUTH_EVENT_BUFFER);
        Self { store: Mutex::new(Store::default()), clock, auth_tx, offline: AtomicBool::new(false) }
    }

    /// Make every subsequent call fail (or succeed again) with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn insert_profile(&self, profile: Profile) {
        self.lock().profiles.insert(profile.id, profile);
    }

    pub fn remove_profile(&self, user_id: Uuid) {
        self.lock().profiles.remove(&user_id);
    }

    /// Snapshot of all presence rows.
    #[must_use]
    pub fn presence_records(&self) -> Vec<PresenceRecord> {
        self.lock().presence.values().cloned().collect()
    }

    /// Number of live change subscribers on a relation.
    #[must_use]
    pub fn subscriber_count(&self, relation: Relation) -> usize {
        self.lock()
            .subscribers
            .iter()
            .filter(|sub| sub.relation == relation && !sub.tx.is_closed())
            .count()
    }

    /// Number of live auth-event receivers.
    #[must_use]
    pub fn auth_subscriber_count(&self) -> usize {
        self.auth_tx.receiver_count()
    }

    /// Publish a session transition the way the hosted auth service would
    /// (e.g. a background token refresh).
    pub fn emit_auth_event(&self, event: AuthEvent) {
        self.publish(event);
    }

    /// Publish a change as if another client had written a row.
    pub fn notify_external(&self, relation: Relation, kind: ChangeKind, board_id: Uuid) {
        self.lock().notify(relation, kind, &[("board_id", board_id.to_string())]);
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_online(&self) -> Result<(), BackendError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BackendError::Request("backend offline".into()));
        }
        Ok(())
    }

    fn publish(&self, event: AuthEvent) {
        // No receivers is fine.
        let _ = self.auth_tx.send(event);
    }
}

#[async_trait::async_trait]
impl AuthBackend for MemoryBackend {
    async fn sign_up(&self, email: &str, password: &str, full_name: Option<&str>) -> Result<Identity, BackendError> {
        self.ensure_online()?;
        if password.len() < MIN_PASSWORD_LEN {
            return Err(BackendError::Auth(format!(
                "password should be at least {MIN_PASSWORD_LEN} characters"
            )));
        }
        let mut store = self.lock();
        if store.accounts.contains_key(email) {
            return Err(BackendError::Auth("user already registered".into()));
        }
        let identity = Identity {
            id: Uuid::new_v4(),
            email: Some(email.to_string()),
            full_name: full_name.map(str::to_string),
        };
        store.profiles.insert(
            identity.id,
            Profile {
                id: identity.id,
                email: email.to_string(),
                full_name: identity.full_name.clone(),
                avatar_url: None,
                created_at: Some(self.clock.now()),
            },
        );
        store
            .accounts
            .insert(email.to_string(), Account { password: password.to_string(), identity: identity.clone() });
        Ok(identity)
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Identity, BackendError> {
        self.ensure_online()?;
        let identity = {
            let mut store = self.lock();
            let identity = match store.accounts.get(email) {
                Some(account) if account.password == password => account.identity.clone(),
                _ => return Err(BackendError::Auth("invalid login credentials".into())),
            };
            store.session = Some(identity.clone());
            identity
        };
        self.publish(AuthEvent::SignedIn(identity.clone()));
        Ok(identity)
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        self.ensure_online()?;
        self.lock().session = None;
        self.publish(AuthEvent::SignedOut);
        Ok(())
    }

    async fn current_identity(&self) -> Result<Option<Identity>, BackendError> {
        self.ensure_online()?;
        Ok(self.lock().session.clone())
    }

    fn auth_events(&self) -> broadcast::Receiver<AuthEvent> {
        self.auth_tx.subscribe()
    }
}

#[async_trait::async_trait]
impl DataBackend for MemoryBackend {
    async fn list_boards(&self) -> Result<Vec<Board>, BackendError> {
        self.ensure_online()?;
        let mut boards = self.lock().boards.clone();
        boards.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(boards)
    }

    async fn insert_board(&self, board: &NewBoard) -> Result<Board, BackendError> {
        self.ensure_online()?;
        let now = self.clock.now();
        let row = Board {
            id: Uuid::new_v4(),
            name: board.name.clone(),
            description: board.description.clone(),
            created_by: board.created_by,
            created_at: Some(now),
            updated_at: Some(now),
        };
        let mut store = self.lock();
        store.boards.push(row.clone());
        store.notify(Relation::Boards, ChangeKind::Insert, &[("id", row.id.to_string())]);
        Ok(row)
    }

    async fn delete_board(&self, board_id: Uuid) -> Result<(), BackendError> {
        self.ensure_online()?;
        let mut store = self.lock();
        let before = store.boards.len();
        store.boards.retain(|b| b.id != board_id);
        if store.boards.len() != before {
            store.tasks.retain(|t| t.board_id != board_id);
            store.presence.retain(|(_, board), _| *board != board_id);
            store.notify(Relation::Boards, ChangeKind::Delete, &[("id", board_id.to_string())]);
        }
        Ok(())
    }

    async fn list_tasks(&self, board_id: Uuid) -> Result<Vec<Task>, BackendError> {
        self.ensure_online()?;
        let store = self.lock();
        let mut tasks: Vec<Task> = store
            .tasks
            .iter()
            .filter(|t| t.board_id == board_id)
            .map(|t| Task { assignee: store.assignee_of(t), ..t.clone() })
            .collect();
        tasks.sort_by_key(|t| t.position);
        Ok(tasks)
    }

    async fn insert_task(&self, task: &NewTask) -> Result<Task, BackendError> {
        self.ensure_online()?;
        let now = self.clock.now();
        let row = Task {
            id: Uuid::new_v4(),
            title: task.title.clone(),
            description: task.description.clone(),
            status: task.status,
            board_id: task.board_id,
            created_by: task.created_by,
            assigned_to: None,
            position: task.position.unwrap_or(0),
            created_at: Some(now),
            updated_at: Some(now),
            assignee: None,
        };
        let mut store = self.lock();
        store.tasks.push(row.clone());
        store.notify(Relation::Tasks, ChangeKind::Insert, &[("board_id", row.board_id.to_string())]);
        Ok(row)
    }

    async fn update_task(&self, task_id: Uuid, patch: &TaskPatch) -> Result<Task, BackendError> {
        self.ensure_online()?;
        let now = self.clock.now();
        let mut store = self.lock();
        let Some(row) = store.tasks.iter_mut().find(|t| t.id == task_id) else {
            return Err(BackendError::NotFound { relation: "tasks", id: task_id });
        };
        patch.apply_to(row);
        row.updated_at = Some(now);
        let updated = row.clone();
        store.notify(Relation::Tasks, ChangeKind::Update, &[("board_id", updated.board_id.to_string())]);
        Ok(updated)
    }

    async fn delete_task(&self, task_id: Uuid) -> Result<(), BackendError> {
        self.ensure_online()?;
        let mut store = self.lock();
        if let Some(index) = store.tasks.iter().position(|t| t.id == task_id) {
            let removed = store.tasks.remove(index);
            store.notify(Relation::Tasks, ChangeKind::Delete, &[("board_id", removed.board_id.to_string())]);
        }
        Ok(())
    }

    async fn upsert_presence(
        &self,
        user_id: Uuid,
        board_id: Uuid,
        last_seen: OffsetDateTime,
    ) -> Result<(), BackendError> {
        self.ensure_online()?;
        let mut store = self.lock();
        let kind = if store.presence.contains_key(&(user_id, board_id)) {
            ChangeKind::Update
        } else {
            ChangeKind::Insert
        };
        store.presence.insert((user_id, board_id), PresenceRecord { board_id, user_id, last_seen });
        store.notify(Relation::UserPresence, kind, &[("board_id", board_id.to_string())]);
        Ok(())
    }

    async fn list_presence_since(
        &self,
        board_id: Uuid,
        since: OffsetDateTime,
    ) -> Result<Vec<PresenceEntry>, BackendError> {
        self.ensure_online()?;
        let store = self.lock();
        let mut entries: Vec<PresenceEntry> = store
            .presence
            .values()
            .filter(|record| record.board_id == board_id && record.last_seen > since)
            .map(|record| PresenceEntry {
                user_id: record.user_id,
                last_seen: record.last_seen,
                profile: store.profiles.get(&record.user_id).cloned(),
            })
            .collect();
        entries.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then(a.user_id.cmp(&b.user_id)));
        Ok(entries)
    }

    async fn delete_presence(&self, user_id: Uuid, board_id: Uuid) -> Result<(), BackendError> {
        self.ensure_online()?;
        let mut store = self.lock();
        if store.presence.remove(&(user_id, board_id)).is_some() {
            store.notify(Relation::UserPresence, ChangeKind::Delete, &[("board_id", board_id.to_string())]);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Realtime for MemoryBackend {
    async fn subscribe(&self, relation: Relation, filter: RowFilter) -> Result<Subscription, BackendError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BackendError::Realtime("backend offline".into()));
        }
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.lock().subscribers.push(Subscriber { relation, filter, tx });
        Ok(Subscription::new(rx, None))
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
