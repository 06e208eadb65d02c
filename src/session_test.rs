use super::*;
use crate::backend::AuthBackend;
use crate::backend::memory::MemoryBackend;

fn store() -> (Arc<MemoryBackend>, SessionStore) {
    let backend = Arc::new(MemoryBackend::default());
    (backend.clone(), SessionStore::new(backend))
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

// =============================================================================
// register / login / logout
// =============================================================================

#[tokio::test]
async fn starts_loading_and_signed_out() {
    let (_, session) = store();
    assert!(session.is_loading());
    assert!(!session.is_authenticated().await);
}

#[tokio::test]
async fn register_returns_identity_without_touching_local_state() {
    let (_, session) = store();
    let identity = session.register("ada@example.com", "secret1", Some("Ada")).await.unwrap();
    assert_eq!(identity.full_name.as_deref(), Some("Ada"));
    assert!(session.identity().await.is_none());
    assert!(session.is_loading());
}

#[tokio::test]
async fn register_duplicate_email_fails() {
    let (_, session) = store();
    session.register("ada@example.com", "secret1", None).await.unwrap();
    let err = session.register("ada@example.com", "secret2", None).await.unwrap_err();
    assert!(matches!(err, BackendError::Auth(_)));
}

#[tokio::test]
async fn login_with_bad_password_fails() {
    let (_, session) = store();
    session.register("ada@example.com", "secret1", None).await.unwrap();
    assert!(matches!(session.login("ada@example.com", "nope").await, Err(BackendError::Auth(_))));
}

#[tokio::test]
async fn logout_clears_identity_immediately() {
    let (_, session) = store();
    session.register("ada@example.com", "secret1", None).await.unwrap();
    session.login("ada@example.com", "secret1").await.unwrap();
    session.fetch_current_identity().await.unwrap();
    assert!(session.is_authenticated().await);

    session.logout().await.unwrap();

    assert!(!session.is_authenticated().await);
}

#[tokio::test]
async fn failed_logout_keeps_identity() {
    let (backend, session) = store();
    session.register("ada@example.com", "secret1", None).await.unwrap();
    session.login("ada@example.com", "secret1").await.unwrap();
    session.fetch_current_identity().await.unwrap();

    backend.set_offline(true);
    assert!(session.logout().await.is_err());
    assert!(session.is_authenticated().await);
}

// =============================================================================
// subscribe_to_auth_changes
// =============================================================================

#[tokio::test]
async fn events_drive_identity_and_loading() {
    let (_, session) = store();
    session.subscribe_to_auth_changes();
    session.register("ada@example.com", "secret1", None).await.unwrap();

    let identity = session.login("ada@example.com", "secret1").await.unwrap();
    settle().await;
    assert_eq!(session.identity().await, Some(identity));
    assert!(!session.is_loading());

    session.logout().await.unwrap();
    settle().await;
    assert!(session.identity().await.is_none());
}

#[tokio::test]
async fn token_refresh_updates_identity() {
    let (backend, session) = store();
    session.subscribe_to_auth_changes();
    let mut identity = backend.sign_up("ada@example.com", "secret1", None).await.unwrap();
    identity.full_name = Some("Ada L.".into());

    backend.emit_auth_event(AuthEvent::TokenRefreshed(identity.clone()));
    settle().await;

    assert_eq!(session.identity().await, Some(identity));
}

#[tokio::test]
async fn resubscribing_replaces_previous_listener() {
    let (backend, session) = store();
    session.subscribe_to_auth_changes();
    session.subscribe_to_auth_changes();
    session.subscribe_to_auth_changes();
    settle().await;

    assert_eq!(backend.auth_subscriber_count(), 1);

    session.register("ada@example.com", "secret1", None).await.unwrap();
    session.login("ada@example.com", "secret1").await.unwrap();
    settle().await;
    assert!(session.is_authenticated().await);
}

#[tokio::test]
async fn dropping_store_ends_listener() {
    let (backend, session) = store();
    session.subscribe_to_auth_changes();
    drop(session);
    settle().await;
    assert_eq!(backend.auth_subscriber_count(), 0);
}

// =============================================================================
// fetch_current_identity
// =============================================================================

#[tokio::test]
async fn fetch_reads_existing_session() {
    let (backend, session) = store();
    backend.sign_up("ada@example.com", "secret1", None).await.unwrap();
    let identity = backend.sign_in("ada@example.com", "secret1").await.unwrap();

    assert_eq!(session.fetch_current_identity().await.unwrap(), Some(identity.clone()));
    assert_eq!(session.identity().await, Some(identity));
    assert!(!session.is_loading());
}

#[tokio::test]
async fn fetch_without_session_clears_loading() {
    let (_, session) = store();
    assert!(session.fetch_current_identity().await.unwrap().is_none());
    assert!(!session.is_loading());
}

#[tokio::test]
async fn fetch_failure_still_clears_loading() {
    let (backend, session) = store();
    backend.set_offline(true);
    assert!(session.fetch_current_identity().await.is_err());
    assert!(!session.is_loading());
}
