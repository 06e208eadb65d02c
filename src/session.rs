//! Session state: the signed-in identity as this client last saw it.
//!
//! DESIGN
//! ======
//! `register` and `login` only talk to the auth service; the local identity
//! follows the service's event stream once `subscribe_to_auth_changes` is
//! armed. `logout` is the exception and clears the identity as soon as the
//! service confirms.
//!
//! `loading` starts true and drops on the first event or one-shot read.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::RwLock;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::{AuthBackend, Backend, BackendError};
use crate::model::{AuthEvent, Identity};

struct SessionInner {
    backend: Arc<dyn Backend>,
    identity: RwLock<Option<Identity>>,
    loading: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SessionInner {
    async fn apply(&self, event: &AuthEvent) {
        debug!(event = event.name(), "auth state changed");
        *self.identity.write().await = event.identity().cloned();
        self.loading.store(false, Ordering::SeqCst);
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let listener = self.listener.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(listener) = listener {
            listener.abort();
        }
    }
}

/// Client-side session state. Cheap to clone.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<SessionInner>,
}

impl SessionStore {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                backend,
                identity: RwLock::new(None),
                loading: AtomicBool::new(true),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Create an account. Local state is left to the event stream.
    ///
    /// # Errors
    ///
    /// Returns whatever the auth service rejected the request with.
    pub async fn register(
        &self,
        email: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> Result<Identity, BackendError> {
        match self.inner.backend.sign_up(email, password, display_name).await {
            Ok(identity) => {
                info!(user_id = %identity.id, "account registered");
                Ok(identity)
            }
            Err(e) => {
                error!(error = %e, code = e.error_code(), "registration failed");
                Err(e)
            }
        }
    }

    /// # Errors
    ///
    /// Returns [`BackendError::Auth`] on bad credentials, or the transport error.
    pub async fn login(&self, email: &str, password: &str) -> Result<Identity, BackendError> {
        match self.inner.backend.sign_in(email, password).await {
            Ok(identity) => {
                info!(user_id = %identity.id, "signed in");
                Ok(identity)
            }
            Err(e) => {
                error!(error = %e, code = e.error_code(), "sign-in failed");
                Err(e)
            }
        }
    }

    /// Sign out and forget the local identity.
    ///
    /// # Errors
    ///
    /// Returns the service error; the local identity is kept in that case.
    pub async fn logout(&self) -> Result<(), BackendError> {
        if let Err(e) = self.inner.backend.sign_out().await {
            error!(error = %e, code = e.error_code(), "sign-out failed");
            return Err(e);
        }
        *self.inner.identity.write().await = None;
        info!("signed out");
        Ok(())
    }

    /// Follow the auth service's session transitions. Calling again replaces
    /// the previous listener.
    pub fn subscribe_to_auth_changes(&self) {
        let mut events = self.inner.backend.auth_events();
        let weak = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            loop {
                let event = events.recv().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match event {
                    Ok(event) => inner.apply(&event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "auth events dropped; re-reading current identity");
                        SessionStore { inner }.resync().await;
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        });

        let previous = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            debug!("replacing auth listener");
            previous.abort();
        }
    }

    async fn resync(&self) {
        // Already logged.
        let _ = self.fetch_current_identity().await;
    }

    /// One-shot read of the identity the auth service holds right now.
    ///
    /// # Errors
    ///
    /// Returns the service error. `loading` is cleared either way.
    pub async fn fetch_current_identity(&self) -> Result<Option<Identity>, BackendError> {
        let result = self.inner.backend.current_identity().await;
        match &result {
            Ok(identity) => *self.inner.identity.write().await = identity.clone(),
            Err(e) => error!(error = %e, code = e.error_code(), "current identity read failed"),
        }
        self.inner.loading.store(false, Ordering::SeqCst);
        result
    }

    pub async fn identity(&self) -> Option<Identity> {
        self.inner.identity.read().await.clone()
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.inner.loading.load(Ordering::SeqCst)
    }

    pub async fn is_authenticated(&self) -> bool {
        self.inner.identity.read().await.is_some()
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
