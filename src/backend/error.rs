//! Errors produced by backend calls.

use uuid::Uuid;

/// Errors produced by backend operations. Transient and permanent failures
/// share one type; callers see them identically.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// A configuration value was missing or could not be parsed.
    #[error("config error: {0}")]
    Config(String),

    /// The underlying HTTP client could not be constructed.
    #[error("HTTP client build failed: {0}")]
    HttpClientBuild(String),

    /// The request never produced a response.
    #[error("request failed: {0}")]
    Request(String),

    /// The backend answered with a non-success status.
    #[error("backend error: status {status}: {message}")]
    Response { status: u16, message: String },

    /// The response body could not be deserialized.
    #[error("response parse failed: {0}")]
    Parse(String),

    /// A single-row operation matched no row.
    #[error("{relation} row not found: {id}")]
    NotFound { relation: &'static str, id: Uuid },

    /// The operation needs a signed-in user.
    #[error("not authenticated")]
    NotAuthenticated,

    /// The auth service rejected the request (bad credentials, duplicate email, weak password).
    #[error("auth rejected: {0}")]
    Auth(String),

    /// The realtime change feed failed.
    #[error("realtime error: {0}")]
    Realtime(String),

    /// The persisted session file could not be read or written.
    #[error("session storage failed: {0}")]
    SessionStorage(String),
}

impl BackendError {
    /// Stable code used as a structured log field.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "E_CONFIG",
            Self::HttpClientBuild(_) => "E_HTTP_CLIENT_BUILD",
            Self::Request(_) => "E_REQUEST",
            Self::Response { .. } => "E_RESPONSE",
            Self::Parse(_) => "E_PARSE",
            Self::NotFound { .. } => "E_NOT_FOUND",
            Self::NotAuthenticated => "E_NOT_AUTHENTICATED",
            Self::Auth(_) => "E_AUTH",
            Self::Realtime(_) => "E_REALTIME",
            Self::SessionStorage(_) => "E_SESSION_STORAGE",
        }
    }

    /// Whether repeating the same call could succeed.
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::Request(_) | Self::Realtime(_) | Self::Response { status: 429 | 500..=599, .. }
        )
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() { Self::Parse(e.to_string()) } else { Self::Request(e.to_string()) }
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e.to_string())
    }
}
