//! Board list state: the boards visible to the signed-in user.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;
use tracing::{error, info};
use uuid::Uuid;

use crate::backend::{Backend, BackendError, DataBackend};
use crate::model::{Board, NewBoard};

/// Clears the loading flag when dropped.
struct LoadingGuard<'a>(&'a AtomicBool);

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Cached board list, newest first. Cheap to clone.
#[derive(Clone)]
pub struct BoardStore {
    backend: Arc<dyn Backend>,
    boards: Arc<RwLock<Vec<Board>>>,
    loading: Arc<AtomicBool>,
}

impl BoardStore {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend, boards: Arc::new(RwLock::new(Vec::new())), loading: Arc::new(AtomicBool::new(false)) }
    }

    /// # Errors
    ///
    /// Returns the backend error; the cache is left as it was.
    pub async fn load(&self) -> Result<(), BackendError> {
        self.loading.store(true, Ordering::SeqCst);
        let _loading = LoadingGuard(&self.loading);

        match self.backend.list_boards().await {
            Ok(boards) => {
                *self.boards.write().await = boards;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, code = e.error_code(), "board load failed");
                Err(e)
            }
        }
    }

    /// # Errors
    ///
    /// Returns the backend error; the cache is left as it was.
    pub async fn create(&self, board: NewBoard) -> Result<Board, BackendError> {
        let created = match self.backend.insert_board(&board).await {
            Ok(created) => created,
            Err(e) => {
                error!(error = %e, code = e.error_code(), name = %board.name, "board create failed");
                return Err(e);
            }
        };
        self.boards.write().await.insert(0, created.clone());
        info!(board_id = %created.id, name = %created.name, "board created");
        Ok(created)
    }

    /// # Errors
    ///
    /// Returns the backend error; the cache is left as it was.
    pub async fn remove(&self, board_id: Uuid) -> Result<(), BackendError> {
        if let Err(e) = self.backend.delete_board(board_id).await {
            error!(error = %e, code = e.error_code(), %board_id, "board delete failed");
            return Err(e);
        }
        self.boards.write().await.retain(|b| b.id != board_id);
        info!(%board_id, "board removed");
        Ok(())
    }

    pub async fn find(&self, board_id: Uuid) -> Option<Board> {
        self.boards.read().await.iter().find(|b| b.id == board_id).cloned()
    }

    pub async fn boards(&self) -> Vec<Board> {
        self.boards.read().await.clone()
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[path = "boards_test.rs"]
mod tests;
