//! Row types mirrored from the backend relations.
//!
//! DESIGN
//! ======
//! Field names follow the backend columns so rows deserialize straight from
//! the row API. Write payloads (`NewTask`, `TaskPatch`, `NewBoard`) are kept
//! separate from rows so absent fields are never sent.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// TASK
// =============================================================================

/// Column a task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Done,
}

impl TaskStatus {
    /// All statuses in board column order.
    pub const ALL: [TaskStatus; 3] = [Self::Todo, Self::InProgress, Self::Done];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(Self::Todo),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Assignee display fields joined onto a task by the list query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssigneeSummary {
    pub full_name: Option<String>,
    pub email: String,
}

/// A task row. Mirrors the `tasks` relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub status: TaskStatus,
    pub board_id: Uuid,
    pub created_by: Uuid,
    #[serde(default)]
    pub assigned_to: Option<Uuid>,
    /// Order within a (board, status) column. Not unique.
    pub position: i32,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
    /// Present only on rows from the joined list query.
    #[serde(default, rename = "profiles", skip_serializing_if = "Option::is_none")]
    pub assignee: Option<AssigneeSummary>,
}

/// Insert payload for a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: TaskStatus,
    pub board_id: Uuid,
    pub created_by: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<i32>,
}

impl NewTask {
    #[must_use]
    pub fn new(title: impl Into<String>, status: TaskStatus, board_id: Uuid, created_by: Uuid) -> Self {
        Self { title: title.into(), description: None, status, board_id, created_by, position: None }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_position(mut self, position: i32) -> Self {
        self.position = Some(position);
        self
    }
}

/// Partial update for a task. `None` fields are left out of the request.
///
/// `assigned_to` is doubly optional: `Some(None)` clears the assignee.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<Option<Uuid>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<i32>,
}

impl TaskPatch {
    /// Patch used for column moves: status always, position when given.
    #[must_use]
    pub fn moved(status: TaskStatus, position: Option<i32>) -> Self {
        Self { status: Some(status), position, ..Self::default() }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.status.is_none()
            && self.assigned_to.is_none()
            && self.position.is_none()
    }

    /// Apply the patch to a task in place.
    pub fn apply_to(&self, task: &mut Task) {
        if let Some(title) = &self.title {
            task.title.clone_from(title);
        }
        if let Some(description) = &self.description {
            task.description = Some(description.clone());
        }
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(assigned_to) = self.assigned_to {
            task.assigned_to = assigned_to;
        }
        if let Some(position) = self.position {
            task.position = position;
        }
    }
}

// =============================================================================
// BOARD
// =============================================================================

/// A board row. Mirrors the `boards` relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub created_by: Uuid,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

/// Insert payload for a board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBoard {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_by: Uuid,
}

// =============================================================================
// PROFILE / PRESENCE
// =============================================================================

/// A user profile. `id` is shared with the auth identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub email: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<OffsetDateTime>,
}

impl Profile {
    /// Name to show in presence lists: full name, else email.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.full_name.as_deref().unwrap_or(&self.email)
    }
}

/// One row of `user_presence`. Keyed by (user, board).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub board_id: Uuid,
    pub user_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

/// A presence row with its profile resolved. `profile` is `None` when the
/// profile could not be joined (e.g. deleted account).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub user_id: Uuid,
    pub last_seen: OffsetDateTime,
    pub profile: Option<Profile>,
}

// =============================================================================
// IDENTITY / AUTH EVENTS
// =============================================================================

/// The authenticated user as reported by the auth service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
}

/// Session transitions published by the auth service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    /// Emitted once a persisted session has been restored (or found absent).
    InitialSession(Option<Identity>),
    SignedIn(Identity),
    SignedOut,
    TokenRefreshed(Identity),
    UserUpdated(Identity),
}

impl AuthEvent {
    /// Identity the session holds after this event.
    #[must_use]
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            Self::InitialSession(identity) => identity.as_ref(),
            Self::SignedIn(identity) | Self::TokenRefreshed(identity) | Self::UserUpdated(identity) => Some(identity),
            Self::SignedOut => None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::InitialSession(_) => "initial_session",
            Self::SignedIn(_) => "signed_in",
            Self::SignedOut => "signed_out",
            Self::TokenRefreshed(_) => "token_refreshed",
            Self::UserUpdated(_) => "user_updated",
        }
    }
}

#[cfg(test)]
#[path = "model_test.rs"]
mod tests;
