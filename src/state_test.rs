use super::test_helpers::{seed_board, signed_in, test_app_state};
use super::*;
use crate::backend::Relation;
use crate::model::{NewTask, TaskStatus};

#[tokio::test]
async fn open_board_requires_identity() {
    let (_, state) = test_app_state();
    let err = state.open_board(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, BackendError::NotAuthenticated));
    assert!(state.current_board().await.is_none());
}

#[tokio::test]
async fn open_board_loads_tasks_subscribes_and_starts_presence() {
    let (backend, state) = test_app_state();
    let me = signed_in(&backend, &state, "ada@example.com").await;
    let board_id = seed_board(&state, me.id).await;
    state
        .tasks
        .create(NewTask::new("first", TaskStatus::Todo, board_id, me.id))
        .await
        .unwrap();
    state.tasks.clear().await;

    state.open_board(board_id).await.unwrap();

    assert_eq!(state.current_board().await, Some(board_id));
    assert_eq!(state.tasks.tasks().await.len(), 1);
    assert!(state.tasks.is_subscribed());
    assert!(state.presence.is_running());
    assert_eq!(state.presence.active_users().await[0].id, me.id);
    assert_eq!(backend.subscriber_count(Relation::Tasks), 1);
    assert_eq!(backend.subscriber_count(Relation::UserPresence), 1);
}

#[tokio::test]
async fn leave_board_undoes_open() {
    let (backend, state) = test_app_state();
    let me = signed_in(&backend, &state, "ada@example.com").await;
    let board_id = seed_board(&state, me.id).await;
    state
        .tasks
        .create(NewTask::new("first", TaskStatus::Todo, board_id, me.id))
        .await
        .unwrap();
    state.open_board(board_id).await.unwrap();

    state.leave_board().await;

    assert!(state.current_board().await.is_none());
    assert!(state.tasks.tasks().await.is_empty());
    assert!(!state.tasks.is_subscribed());
    assert!(!state.presence.is_running());
    assert!(backend.presence_records().is_empty());
}

#[tokio::test]
async fn opening_another_board_leaves_the_first() {
    let (backend, state) = test_app_state();
    let me = signed_in(&backend, &state, "ada@example.com").await;
    let first = seed_board(&state, me.id).await;
    let second = seed_board(&state, me.id).await;

    state.open_board(first).await.unwrap();
    state.open_board(second).await.unwrap();

    assert_eq!(state.current_board().await, Some(second));
    let records = backend.presence_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].board_id, second);
}

#[tokio::test]
async fn open_board_with_failed_load_is_error() {
    let (backend, state) = test_app_state();
    let me = signed_in(&backend, &state, "ada@example.com").await;
    let board_id = seed_board(&state, me.id).await;
    backend.set_offline(true);

    assert!(state.open_board(board_id).await.is_err());
    assert!(state.current_board().await.is_none());
    assert!(!state.presence.is_running());
}

#[tokio::test]
async fn leave_without_open_is_safe() {
    let (_, state) = test_app_state();
    state.leave_board().await;
    assert!(state.current_board().await.is_none());
}
