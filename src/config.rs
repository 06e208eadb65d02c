//! Client configuration parsed from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::backend::BackendError;
use crate::presence::PresenceSettings;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_PRESENCE_HEARTBEAT_SECS: u64 = 30;
pub const DEFAULT_PRESENCE_WINDOW_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    pub request_secs: u64,
    pub connect_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Project base URL, without trailing slash.
    pub base_url: String,
    /// Public (anon) API key sent with every request.
    pub anon_key: String,
    pub timeouts: HttpTimeouts,
    /// Where to persist the auth session between runs, if anywhere.
    pub session_file: Option<PathBuf>,
    pub presence: PresenceSettings,
}

impl Config {
    /// Build typed config from environment variables.
    ///
    /// Required:
    /// - `TASKBOARD_URL`
    /// - `TASKBOARD_ANON_KEY`
    ///
    /// Optional:
    /// - `TASKBOARD_REQUEST_TIMEOUT_SECS`: default 30
    /// - `TASKBOARD_CONNECT_TIMEOUT_SECS`: default 10
    /// - `TASKBOARD_SESSION_FILE`: no persistence when absent
    /// - `TASKBOARD_PRESENCE_HEARTBEAT_SECS`: default 30
    /// - `TASKBOARD_PRESENCE_WINDOW_SECS`: default 60
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Config`] if a required variable is missing or
    /// the URL is not http(s).
    pub fn from_env() -> Result<Self, BackendError> {
        let base_url = required("TASKBOARD_URL")?.trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(BackendError::Config(format!("TASKBOARD_URL must be http(s): {base_url}")));
        }
        let anon_key = required("TASKBOARD_ANON_KEY")?;

        let timeouts = HttpTimeouts {
            request_secs: env_parse("TASKBOARD_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS),
            connect_secs: env_parse("TASKBOARD_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS),
        };
        let session_file = std::env::var("TASKBOARD_SESSION_FILE")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        let presence = PresenceSettings {
            heartbeat_interval: Duration::from_secs(env_parse(
                "TASKBOARD_PRESENCE_HEARTBEAT_SECS",
                DEFAULT_PRESENCE_HEARTBEAT_SECS,
            )),
            freshness_window: Duration::from_secs(env_parse(
                "TASKBOARD_PRESENCE_WINDOW_SECS",
                DEFAULT_PRESENCE_WINDOW_SECS,
            )),
        };

        Ok(Self { base_url, anon_key, timeouts, session_file, presence })
    }
}

fn required(key: &str) -> Result<String, BackendError> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| BackendError::Config(format!("{key} not set")))
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
