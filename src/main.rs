use std::sync::Arc;
use std::time::Duration;

use taskboard::backend::BackendError;
use taskboard::backend::rest::RestBackend;
use taskboard::clock::SystemClock;
use taskboard::config::Config;
use taskboard::model::TaskStatus;
use taskboard::state::AppState;
use tracing::{error, info, warn};
use uuid::Uuid;

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    if let Err(e) = run().await {
        error!(error = %e, code = e.error_code(), "taskboard exited");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), BackendError> {
    let config = Config::from_env()?;
    let backend = Arc::new(RestBackend::new(&config)?);
    let state = AppState::new(backend.clone(), Arc::new(SystemClock), config.presence);
    state.session.subscribe_to_auth_changes();

    if let Err(e) = backend.restore_session().await {
        warn!(error = %e, "ignoring unreadable session file");
    }
    if state.session.fetch_current_identity().await?.is_none() {
        let email = runner_env("TASKBOARD_EMAIL")?;
        let password = runner_env("TASKBOARD_PASSWORD")?;
        state.session.login(&email, &password).await?;
        state.session.fetch_current_identity().await?;
    }

    state.boards.load().await?;
    let board_id = match std::env::var("TASKBOARD_BOARD_ID").ok() {
        Some(raw) => Uuid::parse_str(&raw).map_err(|e| BackendError::Config(format!("TASKBOARD_BOARD_ID: {e}")))?,
        None => state
            .boards
            .boards()
            .await
            .first()
            .map(|b| b.id)
            .ok_or_else(|| BackendError::Config("no boards visible; set TASKBOARD_BOARD_ID".into()))?,
    };

    state.open_board(board_id).await?;
    info!(%board_id, "following board; Ctrl-C to leave");

    let mut ticker = tokio::time::interval(STATUS_LOG_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => log_board(&state).await,
        }
    }

    state.leave_board().await;
    info!("left board");
    Ok(())
}

async fn log_board(state: &AppState) {
    for status in TaskStatus::ALL {
        let tasks = state.tasks.select_by_status(status).await;
        info!(%status, count = tasks.len(), "column");
    }
    let active: Vec<String> = state
        .presence
        .active_users()
        .await
        .iter()
        .map(|p| p.display_name().to_string())
        .collect();
    info!(active = ?active, "active users");
}

fn runner_env(key: &str) -> Result<String, BackendError> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| BackendError::Config(format!("{key} not set")))
}
