//! Sync engine configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config:
//!
//! ```
//! use calibsync_core::SyncConfig;
//!
//! let config = SyncConfig::from_json_str("{}").unwrap();
//! assert_eq!(config.page_size, 200);
//!
//! let tuned = SyncConfig::from_json_str(
//!     r#"{ "page_size": 50, "status_conflict": "remote_wins", "retry": { "max_attempts": 2 } }"#,
//! )
//! .unwrap();
//! assert_eq!(tuned.retry.max_attempts, 2);
//! ```

use crate::diff::StatusConflictPolicy;
use crate::source::{HttpAuth, HttpOptions};
use crate::sync::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_PAGE_SIZE: u32 = 200;
const DEFAULT_PAGE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_SUMMARY_ERRORS: usize = 5;
const DEFAULT_LOCK_STALE_AFTER_MS: u64 = 600_000;

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse(serde_json::Error),
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "cannot read config `{}`: {source}", path.display())
            }
            Self::Parse(err) => write!(f, "invalid config json: {err}"),
            Self::Invalid(message) => write!(f, "invalid config: {message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(err) => Some(err),
            Self::Invalid(_) => None,
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value)
    }
}

/// Tunables for the sync orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Records requested per remote page.
    pub page_size: u32,
    /// Upper bound for one page fetch; overruns count as retryable failures.
    pub page_timeout_ms: u64,
    /// Backoff for retryable source failures.
    pub retry: RetryPolicy,
    /// Tie-break between a manual local status and a remote status.
    pub status_conflict: StatusConflictPolicy,
    /// Pass the last successful session start as `since` and defer deletions.
    pub incremental: bool,
    /// Error messages included in session summaries.
    pub max_summary_errors: usize,
    /// Heartbeat age after which another process may take over the session
    /// lease.
    pub lock_stale_after_ms: u64,
    /// Remote list service for `HttpListSource`.
    pub http: HttpSourceConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            page_timeout_ms: DEFAULT_PAGE_TIMEOUT_MS,
            retry: RetryPolicy::default(),
            status_conflict: StatusConflictPolicy::default(),
            incremental: false,
            max_summary_errors: DEFAULT_MAX_SUMMARY_ERRORS,
            lock_stale_after_ms: DEFAULT_LOCK_STALE_AFTER_MS,
            http: HttpSourceConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Parses and validates a JSON config document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::Invalid("page_size must be > 0".to_string()));
        }
        if self.page_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "page_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.lock_stale_after_ms == 0 {
            return Err(ConfigError::Invalid(
                "lock_stale_after_ms must be > 0".to_string(),
            ));
        }
        self.http.validate()?;
        self.retry.validate().map_err(ConfigError::Invalid)
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_millis(self.page_timeout_ms)
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_millis(self.lock_stale_after_ms)
    }
}

/// Endpoint and credentials of the remote list service.
///
/// Secrets are never stored in the config file; they are read from the
/// named environment variables when the connector is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpSourceConfig {
    pub url: Option<String>,
    /// Basic-auth user.
    pub username: Option<String>,
    /// Environment variable holding the basic-auth password.
    pub password_env: Option<String>,
    /// Environment variable holding a bearer token.
    pub token_env: Option<String>,
    pub connect_timeout_ms: u64,
    pub use_system_proxy: bool,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        let options = HttpOptions::default();
        Self {
            url: None,
            username: None,
            password_env: None,
            token_env: None,
            connect_timeout_ms: u64::try_from(options.connect_timeout.as_millis())
                .unwrap_or(u64::MAX),
            use_system_proxy: options.use_system_proxy,
        }
    }
}

impl HttpSourceConfig {
    pub fn options(&self) -> HttpOptions {
        HttpOptions {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            use_system_proxy: self.use_system_proxy,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "http.connect_timeout_ms must be > 0".to_string(),
            ));
        }
        if let Some(url) = &self.url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid(format!(
                    "http.url must be an http(s) url, got `{url}`"
                )));
            }
        }
        if self.token_env.is_some() && self.username.is_some() {
            return Err(ConfigError::Invalid(
                "http.token_env and http.username are mutually exclusive".to_string(),
            ));
        }
        if self.password_env.is_some() && self.username.is_none() {
            return Err(ConfigError::Invalid(
                "http.password_env requires http.username".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolves credentials from the environment.
    pub fn auth(&self) -> Result<HttpAuth, ConfigError> {
        if let Some(var) = &self.token_env {
            return read_env(var).map(HttpAuth::Bearer);
        }
        match &self.username {
            Some(username) => Ok(HttpAuth::Basic {
                username: username.clone(),
                password: self.password_env.as_deref().map(read_env).transpose()?,
            }),
            None => Ok(HttpAuth::None),
        }
    }
}

fn read_env(var: &str) -> Result<String, ConfigError> {
    std::env::var(var)
        .map_err(|_| ConfigError::Invalid(format!("environment variable `{var}` is not set")))
}
