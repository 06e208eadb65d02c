//! Hosted backend over HTTP plus its realtime change feed.
//!
//! DESIGN
//! ======
//! Thin wrapper over the backend's REST surface. Row requests use the
//! row API's query grammar (`col=eq.v`, `order=col.asc`, `select=` with
//! foreign-key joins). Every request carries the anon key plus a bearer
//! token: the session's access token when signed in, else the anon key.
//!
//! The session lives in memory and, when configured, in a JSON file so a
//! later run can restore it. The file is readable by its owner only. A
//! worker refreshes the access token shortly before it expires and
//! publishes `TokenRefreshed`; open change feeds follow the new token
//! through a `watch` channel.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::io::AsyncWriteExt;
use tokio::sync::{RwLock, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::realtime::RealtimeClient;
use super::{AuthBackend, BackendError, DataBackend, Realtime, Relation, RowFilter, Subscription};
use crate::config::Config;
use crate::model::{AuthEvent, Board, Identity, NewBoard, NewTask, PresenceEntry, PresenceRecord, Profile, Task, TaskPatch};

const TASK_SELECT: &str = "*,profiles!tasks_assigned_to_fkey(full_name,email)";
const PRESENCE_SELECT: &str = "user_id,last_seen,profile:profiles!user_presence_user_id_fkey(id,email,full_name,avatar_url)";
const AUTH_EVENT_BUFFER: usize = 16;
/// Refresh this long before the access token expires.
const REFRESH_MARGIN: Duration = Duration::from_secs(60);
const MIN_REFRESH_DELAY: Duration = Duration::from_secs(5);
const REFRESH_RETRY_DELAY: Duration = Duration::from_secs(30);

// =============================================================================
// SESSION
// =============================================================================

/// Tokens plus the user they belong to. Also the on-disk format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StoredSession {
    pub(crate) access_token: String,
    pub(crate) refresh_token: String,
    /// Unix seconds.
    pub(crate) expires_at: i64,
    pub(crate) user: Identity,
}

impl StoredSession {
    fn expires_in(&self, now_unix: i64) -> Duration {
        Duration::from_secs(u64::try_from(self.expires_at - now_unix).unwrap_or(0))
    }
}

fn refresh_delay(expires_in: Duration) -> Duration {
    expires_in.saturating_sub(REFRESH_MARGIN).max(MIN_REFRESH_DELAY)
}

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(Debug, Deserialize)]
struct WireUser {
    id: Uuid,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    user_metadata: WireUserMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct WireUserMetadata {
    #[serde(default)]
    full_name: Option<String>,
}

impl From<WireUser> for Identity {
    fn from(user: WireUser) -> Self {
        Self { id: user.id, email: user.email, full_name: user.user_metadata.full_name }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: WireUser,
}

impl TokenResponse {
    fn into_session(self, now_unix: i64) -> StoredSession {
        let expires_at = self
            .expires_at
            .unwrap_or_else(|| now_unix + self.expires_in.unwrap_or(3600));
        StoredSession {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            user: self.user.into(),
        }
    }
}

/// Sign-up answers with a full session when accounts are auto-confirmed and
/// with the bare user otherwise.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SignUpResponse {
    Session(TokenResponse),
    User(WireUser),
}

#[derive(Debug, Deserialize)]
struct WirePresence {
    user_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    last_seen: OffsetDateTime,
    #[serde(default)]
    profile: Option<Profile>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    msg: Option<String>,
    message: Option<String>,
    error_description: Option<String>,
    error: Option<String>,
}

/// Pull the human-readable message out of an error body; falls back to the raw text.
pub(crate) fn error_message(body: &str) -> String {
    serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.msg.or(b.message).or(b.error_description).or(b.error))
        .unwrap_or_else(|| body.trim().to_string())
}

fn format_timestamp(at: OffsetDateTime) -> Result<String, BackendError> {
    at.format(&Rfc3339).map_err(|e| BackendError::Parse(e.to_string()))
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Write `body` to `path` with owner-only permissions, tightening an
/// existing file before anything is written to it.
async fn write_private(path: &Path, body: &[u8]) -> std::io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(path).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600)).await?;
    }
    file.write_all(body).await?;
    file.flush().await
}

// =============================================================================
// CLIENT
// =============================================================================

struct RestInner {
    http: reqwest::Client,
    base_url: String,
    anon_key: String,
    session: RwLock<Option<StoredSession>>,
    /// Token change feeds join with: the access token, else the anon key.
    feed_token: watch::Sender<String>,
    session_file: Option<PathBuf>,
    auth_tx: broadcast::Sender<AuthEvent>,
    refresh_worker: Mutex<Option<JoinHandle<()>>>,
    realtime: RealtimeClient,
}

/// HTTP implementation of all backend traits.
#[derive(Clone)]
pub struct RestBackend {
    inner: Arc<RestInner>,
}

impl RestBackend {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built or the base URL
    /// has no websocket counterpart.
    pub fn new(config: &Config) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeouts.request_secs))
            .connect_timeout(Duration::from_secs(config.timeouts.connect_secs))
            .build()
            .map_err(|e| BackendError::HttpClientBuild(e.to_string()))?;
        let realtime = RealtimeClient::new(&config.base_url, &config.anon_key)?;
        let (auth_tx, _) = broadcast::channel(AUTH_EVENT_BUFFER);
        let (feed_token, _) = watch::channel(config.anon_key.clone());

        Ok(Self {
            inner: Arc::new(RestInner {
                http,
                base_url: config.base_url.trim_end_matches('/').to_string(),
                anon_key: config.anon_key.clone(),
                session: RwLock::new(None),
                feed_token,
                session_file: config.session_file.clone(),
                auth_tx,
                refresh_worker: Mutex::new(None),
                realtime,
            }),
        })
    }

    /// Load a persisted session, refreshing it first if it already expired.
    /// Publishes `InitialSession` either way.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::SessionStorage`] if the file exists but cannot
    /// be read or parsed. A rejected refresh is not an error: the stale
    /// session is discarded and `None` is returned.
    pub async fn restore_session(&self) -> Result<Option<Identity>, BackendError> {
        let Some(path) = &self.inner.session_file else {
            self.publish(AuthEvent::InitialSession(None));
            return Ok(None);
        };

        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.publish(AuthEvent::InitialSession(None));
                return Ok(None);
            }
            Err(e) => return Err(BackendError::SessionStorage(e.to_string())),
        };
        let stored: StoredSession =
            serde_json::from_str(&raw).map_err(|e| BackendError::SessionStorage(e.to_string()))?;

        let expires_in = stored.expires_in(now_unix());
        let user = stored.user.clone();
        self.set_session(Some(stored)).await;

        let identity = if expires_in <= MIN_REFRESH_DELAY {
            match self.refresh_session().await {
                Ok(next) => {
                    self.spawn_refresh_worker(next);
                    self.current_user().await
                }
                Err(e) => {
                    warn!(error = %e, code = e.error_code(), "persisted session could not be refreshed");
                    self.clear_session().await;
                    None
                }
            }
        } else {
            self.spawn_refresh_worker(expires_in);
            Some(user)
        };

        info!(restored = identity.is_some(), "session restore finished");
        self.publish(AuthEvent::InitialSession(identity.clone()));
        Ok(identity)
    }

    async fn current_user(&self) -> Option<Identity> {
        self.inner.session.read().await.as_ref().map(|s| s.user.clone())
    }

    fn publish(&self, event: AuthEvent) {
        debug!(event = event.name(), "auth event");
        let _ = self.inner.auth_tx.send(event);
    }

    // -------------------------------------------------------------------------
    // request plumbing
    // -------------------------------------------------------------------------

    fn rest_url(&self, relation: Relation) -> String {
        format!("{}/rest/v1/{}", self.inner.base_url, relation.table_name())
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1/{path}", self.inner.base_url)
    }

    async fn bearer(&self) -> String {
        self.inner
            .session
            .read()
            .await
            .as_ref()
            .map_or_else(|| self.inner.anon_key.clone(), |s| s.access_token.clone())
    }

    async fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let token = self.bearer().await;
        self.inner
            .http
            .request(method, url)
            .header("apikey", &self.inner.anon_key)
            .bearer_auth(token)
    }

    async fn check(response: Response) -> Result<Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(BackendError::Response { status: status.as_u16(), message: error_message(&body) })
    }

    async fn send_json<T: DeserializeOwned>(builder: RequestBuilder) -> Result<T, BackendError> {
        let response = Self::check(builder.send().await?).await?;
        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn send_empty(builder: RequestBuilder) -> Result<(), BackendError> {
        Self::check(builder.send().await?).await?;
        Ok(())
    }

    /// Auth endpoints report rejected credentials as 4xx; surface those as
    /// [`BackendError::Auth`].
    async fn send_auth<T: DeserializeOwned>(builder: RequestBuilder) -> Result<T, BackendError> {
        match Self::send_json(builder).await {
            Err(BackendError::Response { status: 400..=499, message }) => Err(BackendError::Auth(message)),
            other => other,
        }
    }

    // -------------------------------------------------------------------------
    // session lifecycle
    // -------------------------------------------------------------------------

    async fn install_session(&self, session: StoredSession) -> (Identity, Duration) {
        let identity = session.user.clone();
        let expires_in = session.expires_in(now_unix());
        self.persist_session(Some(&session)).await;
        self.set_session(Some(session)).await;
        (identity, expires_in)
    }

    async fn clear_session(&self) {
        self.set_session(None).await;
        self.persist_session(None).await;
    }

    async fn set_session(&self, session: Option<StoredSession>) {
        let token = session
            .as_ref()
            .map_or_else(|| self.inner.anon_key.clone(), |s| s.access_token.clone());
        *self.inner.session.write().await = session;
        self.inner.feed_token.send_replace(token);
    }

    /// Session persistence is auxiliary; failures are logged, never returned.
    async fn persist_session(&self, session: Option<&StoredSession>) {
        let Some(path) = &self.inner.session_file else {
            return;
        };
        let result = match session {
            Some(session) => match serde_json::to_string_pretty(session) {
                Ok(body) => write_private(path, body.as_bytes()).await,
                Err(e) => {
                    warn!(error = %e, "session serialize failed");
                    return;
                }
            },
            None => match tokio::fs::remove_file(path).await {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            },
        };
        if let Err(e) = result {
            warn!(error = %e, path = %path.display(), "session file update failed");
        }
    }

    /// Exchange the refresh token for a new session. Returns the new lifetime.
    async fn refresh_session(&self) -> Result<Duration, BackendError> {
        let refresh_token = self
            .inner
            .session
            .read()
            .await
            .as_ref()
            .map(|s| s.refresh_token.clone())
            .ok_or(BackendError::NotAuthenticated)?;

        let url = self.auth_url("token?grant_type=refresh_token");
        let builder = self
            .inner
            .http
            .post(url)
            .header("apikey", &self.inner.anon_key)
            .json(&json!({ "refresh_token": refresh_token }));
        let token: TokenResponse = Self::send_auth(builder).await?;
        let (identity, expires_in) = self.install_session(token.into_session(now_unix())).await;
        self.publish(AuthEvent::TokenRefreshed(identity));
        Ok(expires_in)
    }

    fn spawn_refresh_worker(&self, expires_in: Duration) {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut delay = refresh_delay(expires_in);
            loop {
                tokio::time::sleep(delay).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let backend = RestBackend { inner };
                match backend.refresh_session().await {
                    Ok(next) => {
                        debug!(expires_in_secs = next.as_secs(), "access token refreshed");
                        delay = refresh_delay(next);
                    }
                    Err(e) if e.retryable() => {
                        warn!(error = %e, code = e.error_code(), "token refresh failed; retrying");
                        delay = REFRESH_RETRY_DELAY;
                    }
                    Err(e) => {
                        warn!(error = %e, code = e.error_code(), "token refresh rejected; signing out");
                        backend.clear_session().await;
                        backend.publish(AuthEvent::SignedOut);
                        return;
                    }
                }
            }
        });

        let previous = self
            .inner
            .refresh_worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn stop_refresh_worker(&self) {
        let handle = self
            .inner
            .refresh_worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

// =============================================================================
// AUTH
// =============================================================================

#[async_trait::async_trait]
impl AuthBackend for RestBackend {
    async fn sign_up(&self, email: &str, password: &str, full_name: Option<&str>) -> Result<Identity, BackendError> {
        let body = json!({
            "email": email,
            "password": password,
            "data": { "full_name": full_name },
        });
        let builder = self.request(Method::POST, &self.auth_url("signup")).await.json(&body);
        match Self::send_auth::<SignUpResponse>(builder).await? {
            SignUpResponse::Session(token) => {
                let (identity, expires_in) = self.install_session(token.into_session(now_unix())).await;
                self.spawn_refresh_worker(expires_in);
                self.publish(AuthEvent::SignedIn(identity.clone()));
                Ok(identity)
            }
            SignUpResponse::User(user) => Ok(user.into()),
        }
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Identity, BackendError> {
        let builder = self
            .request(Method::POST, &self.auth_url("token?grant_type=password"))
            .await
            .json(&json!({ "email": email, "password": password }));
        let token: TokenResponse = Self::send_auth(builder).await?;
        let (identity, expires_in) = self.install_session(token.into_session(now_unix())).await;
        self.spawn_refresh_worker(expires_in);
        self.publish(AuthEvent::SignedIn(identity.clone()));
        Ok(identity)
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        if self.inner.session.read().await.is_some() {
            let builder = self.request(Method::POST, &self.auth_url("logout")).await;
            match Self::send_empty(builder).await {
                // An already-invalid token still means "signed out".
                Ok(()) | Err(BackendError::Response { status: 401 | 403 | 404, .. }) => {}
                Err(e) => return Err(e),
            }
        }
        self.stop_refresh_worker();
        self.clear_session().await;
        self.publish(AuthEvent::SignedOut);
        Ok(())
    }

    async fn current_identity(&self) -> Result<Option<Identity>, BackendError> {
        if self.inner.session.read().await.is_none() {
            return Ok(None);
        }
        let builder = self.request(Method::GET, &self.auth_url("user")).await;
        match Self::send_json::<WireUser>(builder).await {
            Ok(user) => {
                let identity: Identity = user.into();
                let changed = {
                    let mut session = self.inner.session.write().await;
                    match session.as_mut() {
                        Some(s) if s.user != identity => {
                            s.user = identity.clone();
                            true
                        }
                        _ => false,
                    }
                };
                if changed {
                    self.publish(AuthEvent::UserUpdated(identity.clone()));
                }
                Ok(Some(identity))
            }
            Err(BackendError::Response { status: 401 | 403, .. }) => {
                self.stop_refresh_worker();
                self.clear_session().await;
                self.publish(AuthEvent::SignedOut);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn auth_events(&self) -> broadcast::Receiver<AuthEvent> {
        self.inner.auth_tx.subscribe()
    }
}

// =============================================================================
// ROWS
// =============================================================================

#[async_trait::async_trait]
impl DataBackend for RestBackend {
    async fn list_boards(&self) -> Result<Vec<Board>, BackendError> {
        let builder = self
            .request(Method::GET, &self.rest_url(Relation::Boards))
            .await
            .query(&[("select", "*"), ("order", "created_at.desc")]);
        Self::send_json(builder).await
    }

    async fn insert_board(&self, board: &NewBoard) -> Result<Board, BackendError> {
        let builder = self
            .request(Method::POST, &self.rest_url(Relation::Boards))
            .await
            .header("Prefer", "return=representation")
            .json(board);
        let rows: Vec<Board> = Self::send_json(builder).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| BackendError::Parse("board insert returned no rows".into()))
    }

    async fn delete_board(&self, board_id: Uuid) -> Result<(), BackendError> {
        let builder = self
            .request(Method::DELETE, &self.rest_url(Relation::Boards))
            .await
            .query(&[("id", format!("eq.{board_id}"))]);
        Self::send_empty(builder).await
    }

    async fn list_tasks(&self, board_id: Uuid) -> Result<Vec<Task>, BackendError> {
        let builder = self
            .request(Method::GET, &self.rest_url(Relation::Tasks))
            .await
            .query(&[
                ("select", TASK_SELECT.to_string()),
                ("board_id", format!("eq.{board_id}")),
                ("order", "position.asc".to_string()),
            ]);
        Self::send_json(builder).await
    }

    async fn insert_task(&self, task: &NewTask) -> Result<Task, BackendError> {
        let builder = self
            .request(Method::POST, &self.rest_url(Relation::Tasks))
            .await
            .header("Prefer", "return=representation")
            .json(task);
        let rows: Vec<Task> = Self::send_json(builder).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| BackendError::Parse("task insert returned no rows".into()))
    }

    async fn update_task(&self, task_id: Uuid, patch: &TaskPatch) -> Result<Task, BackendError> {
        let builder = self
            .request(Method::PATCH, &self.rest_url(Relation::Tasks))
            .await
            .query(&[("id", format!("eq.{task_id}"))])
            .header("Prefer", "return=representation")
            .json(patch);
        let rows: Vec<Task> = Self::send_json(builder).await?;
        rows.into_iter()
            .next()
            .ok_or(BackendError::NotFound { relation: "tasks", id: task_id })
    }

    async fn delete_task(&self, task_id: Uuid) -> Result<(), BackendError> {
        let builder = self
            .request(Method::DELETE, &self.rest_url(Relation::Tasks))
            .await
            .query(&[("id", format!("eq.{task_id}"))]);
        Self::send_empty(builder).await
    }

    async fn upsert_presence(
        &self,
        user_id: Uuid,
        board_id: Uuid,
        last_seen: OffsetDateTime,
    ) -> Result<(), BackendError> {
        let record = PresenceRecord { board_id, user_id, last_seen };
        let builder = self
            .request(Method::POST, &self.rest_url(Relation::UserPresence))
            .await
            .query(&[("on_conflict", "user_id,board_id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&record);
        Self::send_empty(builder).await
    }

    async fn list_presence_since(
        &self,
        board_id: Uuid,
        since: OffsetDateTime,
    ) -> Result<Vec<PresenceEntry>, BackendError> {
        let builder = self
            .request(Method::GET, &self.rest_url(Relation::UserPresence))
            .await
            .query(&[
                ("select", PRESENCE_SELECT.to_string()),
                ("board_id", format!("eq.{board_id}")),
                ("last_seen", format!("gt.{}", format_timestamp(since)?)),
                ("order", "last_seen.desc".to_string()),
            ]);
        let rows: Vec<WirePresence> = Self::send_json(builder).await?;
        Ok(rows
            .into_iter()
            .map(|row| PresenceEntry { user_id: row.user_id, last_seen: row.last_seen, profile: row.profile })
            .collect())
    }

    async fn delete_presence(&self, user_id: Uuid, board_id: Uuid) -> Result<(), BackendError> {
        let builder = self
            .request(Method::DELETE, &self.rest_url(Relation::UserPresence))
            .await
            .query(&[("user_id", format!("eq.{user_id}")), ("board_id", format!("eq.{board_id}"))]);
        Self::send_empty(builder).await
    }
}

#[async_trait::async_trait]
impl Realtime for RestBackend {
    async fn subscribe(&self, relation: Relation, filter: RowFilter) -> Result<Subscription, BackendError> {
        self.inner
            .realtime
            .subscribe(relation, filter, self.inner.feed_token.subscribe())
            .await
    }
}

#[cfg(test)]
#[path = "rest_test.rs"]
mod tests;
