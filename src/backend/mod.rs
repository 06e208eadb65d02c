//! Backend service traits and the change-feed types they share.
//!
//! ARCHITECTURE
//! ============
//! The stores never talk HTTP directly. They hold trait objects for the
//! three backend concerns so the same store code runs against the hosted
//! service (`rest` + `realtime`) or the in-process `memory` backend.
//!
//! Change events carry no row contents: subscribers treat any
//! event as "something in this relation changed" and re-fetch.

pub mod error;
pub mod memory;
pub mod realtime;
pub mod rest;

use std::fmt;

use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub use error::BackendError;

use crate::model::{AuthEvent, Board, Identity, NewBoard, NewTask, PresenceEntry, Task, TaskPatch};

// =============================================================================
// RELATIONS & FILTERS
// =============================================================================

/// Backend relations the client reads and watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relation {
    Boards,
    Profiles,
    Tasks,
    UserPresence,
}

impl Relation {
    #[must_use]
    pub fn table_name(self) -> &'static str {
        match self {
            Self::Boards => "boards",
            Self::Profiles => "profiles",
            Self::Tasks => "tasks",
            Self::UserPresence => "user_presence",
        }
    }

    #[must_use]
    pub fn from_table_name(name: &str) -> Option<Self> {
        match name {
            "boards" => Some(Self::Boards),
            "profiles" => Some(Self::Profiles),
            "tasks" => Some(Self::Tasks),
            "user_presence" => Some(Self::UserPresence),
            _ => None,
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

/// Equality predicate scoping a change subscription, e.g. `board_id=eq.<id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFilter {
    pub column: String,
    pub value: String,
}

impl RowFilter {
    #[must_use]
    pub fn eq(column: impl Into<String>, value: impl fmt::Display) -> Self {
        Self { column: column.into(), value: value.to_string() }
    }

    #[must_use]
    pub fn board(board_id: Uuid) -> Self {
        Self::eq("board_id", board_id)
    }

    #[must_use]
    pub fn matches(&self, column: &str, value: &str) -> bool {
        self.column == column && self.value == value
    }
}

impl fmt::Display for RowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=eq.{}", self.column, self.value)
    }
}

// =============================================================================
// CHANGE FEED
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    #[must_use]
    pub fn from_wire(raw: &str) -> Option<Self> {
        match raw {
            "INSERT" => Some(Self::Insert),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// "Some row in `relation` changed." Row contents are not carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeEvent {
    pub relation: Relation,
    pub kind: ChangeKind,
}

/// A live change subscription. Dropping it stops delivery and tears down
/// any worker that feeds it.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<ChangeEvent>,
    worker: Option<JoinHandle<()>>,
}

impl Subscription {
    #[must_use]
    pub fn new(rx: mpsc::Receiver<ChangeEvent>, worker: Option<JoinHandle<()>>) -> Self {
        Self { rx, worker }
    }

    /// Wait for the next change. `None` once the feed has ended.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    /// Take an already-queued change without waiting.
    pub fn try_next(&mut self) -> Option<ChangeEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

// =============================================================================
// SERVICE TRAITS
// =============================================================================

/// Authentication service.
#[async_trait::async_trait]
pub trait AuthBackend: Send + Sync {
    /// Create an account. Does not necessarily start a session.
    async fn sign_up(&self, email: &str, password: &str, full_name: Option<&str>) -> Result<Identity, BackendError>;

    async fn sign_in(&self, email: &str, password: &str) -> Result<Identity, BackendError>;

    async fn sign_out(&self) -> Result<(), BackendError>;

    /// One-shot read of the identity behind the current session, if any.
    async fn current_identity(&self) -> Result<Option<Identity>, BackendError>;

    /// Stream of session transitions. Each call returns a fresh receiver.
    fn auth_events(&self) -> broadcast::Receiver<AuthEvent>;
}

/// Row operations over boards, tasks, profiles, and presence.
#[async_trait::async_trait]
pub trait DataBackend: Send + Sync {
    /// Boards visible to the caller, newest first.
    async fn list_boards(&self) -> Result<Vec<Board>, BackendError>;

    async fn insert_board(&self, board: &NewBoard) -> Result<Board, BackendError>;

    async fn delete_board(&self, board_id: Uuid) -> Result<(), BackendError>;

    /// All tasks of a board, ordered by position ascending, with assignee
    /// display fields joined.
    async fn list_tasks(&self, board_id: Uuid) -> Result<Vec<Task>, BackendError>;

    async fn insert_task(&self, task: &NewTask) -> Result<Task, BackendError>;

    /// Apply a partial update and return the updated row.
    async fn update_task(&self, task_id: Uuid, patch: &TaskPatch) -> Result<Task, BackendError>;

    async fn delete_task(&self, task_id: Uuid) -> Result<(), BackendError>;

    /// Insert or overwrite the (user, board) presence row.
    async fn upsert_presence(&self, user_id: Uuid, board_id: Uuid, last_seen: OffsetDateTime)
    -> Result<(), BackendError>;

    /// Presence rows of a board with `last_seen` strictly after `since`.
    async fn list_presence_since(&self, board_id: Uuid, since: OffsetDateTime)
    -> Result<Vec<PresenceEntry>, BackendError>;

    async fn delete_presence(&self, user_id: Uuid, board_id: Uuid) -> Result<(), BackendError>;
}

/// Push notifications for row changes.
#[async_trait::async_trait]
pub trait Realtime: Send + Sync {
    async fn subscribe(&self, relation: Relation, filter: RowFilter) -> Result<Subscription, BackendError>;
}

/// Everything the application state needs from one backend.
pub trait Backend: AuthBackend + DataBackend + Realtime {}

impl<T: AuthBackend + DataBackend + Realtime> Backend for T {}
