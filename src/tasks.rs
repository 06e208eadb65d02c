//! Task collection state: the cached task list of the open board.
//!
//! DESIGN
//! ======
//! The cache is only mutated after the backend confirms a write, and is
//! patched from the row the backend returns. A change notification on the
//! board triggers a full reload, which is authoritative.
//!
//! The list is kept ordered by `position` ascending (stable among equal
//! positions), the same order the list query returns.
//!
//! CONCURRENCY
//! ===========
//! Writes are last-write-wins. Full reloads carry a sequence number; a
//! reload that finishes after a newer one was applied is discarded, and
//! `clear` discards every reload still in flight.
//!
//! ERROR HANDLING
//! ==============
//! Caller-initiated operations log and return the error. Reloads triggered
//! by the change feed log and carry on.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{Backend, BackendError, DataBackend, Realtime, Relation, RowFilter};
use crate::model::{NewTask, Task, TaskPatch, TaskStatus};

#[derive(Default)]
struct TaskList {
    tasks: Vec<Task>,
    /// Sequence number of the reload the list currently reflects.
    applied_seq: u64,
}

struct TaskInner {
    backend: Arc<dyn Backend>,
    list: RwLock<TaskList>,
    loads_in_flight: AtomicUsize,
    load_seq: AtomicU64,
    feed: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for TaskInner {
    fn drop(&mut self) {
        let feed = self.feed.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(feed) = feed {
            feed.abort();
        }
    }
}

/// Keeps `is_loading` true for as long as it lives.
struct LoadingGuard<'a>(&'a AtomicUsize);

impl<'a> LoadingGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Cached tasks of one board. Cheap to clone.
#[derive(Clone)]
pub struct TaskStore {
    inner: Arc<TaskInner>,
}

impl TaskStore {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                backend,
                list: RwLock::new(TaskList::default()),
                loads_in_flight: AtomicUsize::new(0),
                load_seq: AtomicU64::new(0),
                feed: Mutex::new(None),
            }),
        }
    }

    /// Replace the cache with every task of `board_id`.
    ///
    /// # Errors
    ///
    /// Returns the backend error; the cache is left as it was.
    pub async fn load(&self, board_id: Uuid) -> Result<(), BackendError> {
        let _loading = LoadingGuard::new(&self.inner.loads_in_flight);
        let seq = self.inner.load_seq.fetch_add(1, Ordering::SeqCst) + 1;

        let tasks = match self.inner.backend.list_tasks(board_id).await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, code = e.error_code(), %board_id, "task load failed");
                return Err(e);
            }
        };

        let mut list = self.inner.list.write().await;
        if seq <= list.applied_seq {
            debug!(%board_id, seq, applied = list.applied_seq, "discarding stale task load");
            return Ok(());
        }
        debug!(%board_id, count = tasks.len(), "tasks loaded");
        list.tasks = tasks;
        list.applied_seq = seq;
        Ok(())
    }

    /// Insert a task and add the returned row to the cache.
    ///
    /// # Errors
    ///
    /// Returns the backend error; the cache is left as it was.
    pub async fn create(&self, task: NewTask) -> Result<Task, BackendError> {
        let created = match self.inner.backend.insert_task(&task).await {
            Ok(created) => created,
            Err(e) => {
                error!(error = %e, code = e.error_code(), board_id = %task.board_id, "task create failed");
                return Err(e);
            }
        };

        let mut list = self.inner.list.write().await;
        // A reload triggered by this insert may already hold the row.
        if let Some(existing) = list.tasks.iter_mut().find(|t| t.id == created.id) {
            *existing = created.clone();
        } else {
            let slot = list.tasks.partition_point(|t| t.position <= created.position);
            list.tasks.insert(slot, created.clone());
        }
        info!(task_id = %created.id, board_id = %created.board_id, "task created");
        Ok(created)
    }

    /// Apply a partial update. If the task is not cached the cache is left
    /// unchanged.
    ///
    /// # Errors
    ///
    /// Returns the backend error; the cache is left as it was.
    pub async fn update(&self, task_id: Uuid, patch: TaskPatch) -> Result<Task, BackendError> {
        let mut updated = match self.inner.backend.update_task(task_id, &patch).await {
            Ok(updated) => updated,
            Err(e) => {
                error!(error = %e, code = e.error_code(), %task_id, "task update failed");
                return Err(e);
            }
        };

        let mut list = self.inner.list.write().await;
        let Some(existing) = list.tasks.iter_mut().find(|t| t.id == task_id) else {
            debug!(%task_id, "updated task not cached");
            return Ok(updated);
        };
        // Update responses carry no join; keep the cached assignee when it still applies.
        if updated.assignee.is_none() && updated.assigned_to == existing.assigned_to {
            updated.assignee = existing.assignee.take();
        }
        let moved = existing.position != updated.position;
        *existing = updated.clone();
        if moved {
            list.tasks.sort_by_key(|t| t.position);
        }
        Ok(updated)
    }

    /// # Errors
    ///
    /// Returns the backend error; the cache is left as it was.
    pub async fn remove(&self, task_id: Uuid) -> Result<(), BackendError> {
        if let Err(e) = self.inner.backend.delete_task(task_id).await {
            error!(error = %e, code = e.error_code(), %task_id, "task delete failed");
            return Err(e);
        }
        self.inner.list.write().await.tasks.retain(|t| t.id != task_id);
        info!(%task_id, "task removed");
        Ok(())
    }

    /// Move a task to another column, optionally to a given position.
    ///
    /// # Errors
    ///
    /// See [`update`](Self::update).
    pub async fn move_task(&self, task_id: Uuid, status: TaskStatus, position: Option<i32>) -> Result<Task, BackendError> {
        self.update(task_id, TaskPatch::moved(status, position)).await
    }

    /// Reload the board on every remote change. Replaces any earlier feed.
    ///
    /// # Errors
    ///
    /// Returns the error if the change feed cannot be opened.
    pub async fn subscribe_to_changes(&self, board_id: Uuid) -> Result<(), BackendError> {
        let mut feed = match self.inner.backend.subscribe(Relation::Tasks, RowFilter::board(board_id)).await {
            Ok(feed) => feed,
            Err(e) => {
                error!(error = %e, code = e.error_code(), %board_id, "task change feed failed");
                return Err(e);
            }
        };

        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            while let Some(event) = feed.next().await {
                // One reload covers a burst.
                let mut skipped = 0usize;
                while feed.try_next().is_some() {
                    skipped += 1;
                }
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                debug!(%board_id, kind = ?event.kind, skipped, "task change received");
                // Already logged by load.
                let _ = TaskStore { inner }.load(board_id).await;
            }
            warn!(%board_id, "task change feed ended");
        });

        if let Some(previous) = self.replace_feed(Some(handle)) {
            previous.abort();
        }
        Ok(())
    }

    /// Stop reacting to remote changes.
    pub fn unsubscribe(&self) {
        if let Some(previous) = self.replace_feed(None) {
            previous.abort();
        }
    }

    fn replace_feed(&self, handle: Option<JoinHandle<()>>) -> Option<JoinHandle<()>> {
        let mut feed = self.inner.feed.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *feed, handle)
    }

    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.inner
            .feed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Cached tasks in one column. No network access.
    pub async fn select_by_status(&self, status: TaskStatus) -> Vec<Task> {
        self.inner
            .list
            .read()
            .await
            .tasks
            .iter()
            .filter(|t| t.status == status)
            .cloned()
            .collect()
    }

    /// Empty the cache and drop any reload still in flight.
    pub async fn clear(&self) {
        let mut list = self.inner.list.write().await;
        list.tasks.clear();
        list.applied_seq = self.inner.load_seq.load(Ordering::SeqCst);
    }

    pub async fn tasks(&self) -> Vec<Task> {
        self.inner.list.read().await.tasks.clone()
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.inner.loads_in_flight.load(Ordering::SeqCst) > 0
    }
}

#[cfg(test)]
#[path = "tasks_test.rs"]
mod tests;
