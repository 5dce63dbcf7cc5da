//! Synchronization configuration.
//!
//! Configuration is loaded once at startup from environment variables (a
//! `.env` file is honoured through `dotenvy`). Every value has a default
//! matching the behavior of the live dashboards, so an empty environment
//! yields a working configuration.
//!
//! # Environment Variables
//!
//! - `BOARDSYNC_BASE_URL`: API base URL (default: `http://localhost:5000/api`)
//! - `BOARDSYNC_EVENTS_PATH`: push stream path (default: `/events/stream`)
//! - `BOARDSYNC_POLL_INTERVAL_MS`: live widget poll interval (default: `30000`)
//! - `BOARDSYNC_REQUEST_TIMEOUT_MS`: command timeout (default: `10000`)
//! - `BOARDSYNC_RECONNECT_INITIAL_MS`: first reconnect delay (default: `2000`)
//! - `BOARDSYNC_RECONNECT_MAX_MS`: reconnect delay cap (default: `30000`)
//! - `BOARDSYNC_CREDENTIAL_FILE`: persisted credential (default: `.boardsync/credential.json`)

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::push::BackoffPolicy;

/// Default API base URL.
pub const DEFAULT_BASE_URL: &str = "http://localhost:5000/api";
/// Default push stream path.
pub const DEFAULT_EVENTS_PATH: &str = "/events/stream";
/// Default poll interval for live widgets.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
/// Default command timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Default credential file.
pub const DEFAULT_CREDENTIAL_FILE: &str = ".boardsync/credential.json";

// =============================================================================
// Configuration Errors
// =============================================================================

/// Configuration loading error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A variable is set but is not valid Unicode.
    #[error("{name} is not valid unicode")]
    NotUnicode {
        /// Variable name.
        name: String,
    },

    /// A numeric variable could not be parsed.
    #[error("invalid value for {name}: {message} (got '{value}')")]
    InvalidNumber {
        /// Variable name.
        name: String,
        /// Parser message.
        message: String,
        /// Raw value.
        value: String,
    },

    /// A duration must be strictly positive.
    #[error("{name} must be greater than 0")]
    ZeroDuration {
        /// Variable name.
        name: &'static str,
    },

    /// The reconnect delay range is inverted.
    #[error("reconnect initial delay ({initial_ms}ms) exceeds the cap ({max_ms}ms)")]
    InvalidReconnectRange {
        /// Initial delay in milliseconds.
        initial_ms: u128,
        /// Cap in milliseconds.
        max_ms: u128,
    },

    /// The base URL is not an HTTP(S) URL.
    #[error("base URL must start with http:// or https:// (got '{0}')")]
    InvalidBaseUrl(String),
}

// =============================================================================
// Sync Config
// =============================================================================

/// Configuration shared by every synchronization component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// API base URL, without trailing slash.
    pub base_url: String,
    /// Path of the server-sent events stream.
    pub events_path: String,
    /// Default poll interval for live feeds.
    pub poll_interval: Duration,
    /// Fixed command timeout.
    pub request_timeout: Duration,
    /// Push reconnect backoff.
    pub reconnect: BackoffPolicy,
    /// Persisted credential location.
    pub credential_file: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            events_path: DEFAULT_EVENTS_PATH.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reconnect: BackoffPolicy::default(),
            credential_file: PathBuf::from(DEFAULT_CREDENTIAL_FILE),
        }
    }
}

impl SyncConfig {
    /// Loads the configuration from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error when a variable is set to an unparsable value or when
    /// the resulting configuration fails [`SyncConfig::validate`].
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let config = Self {
            base_url: env_string("BOARDSYNC_BASE_URL")?
                .map_or(defaults.base_url, |url| url.trim_end_matches('/').to_string()),
            events_path: env_string("BOARDSYNC_EVENTS_PATH")?.unwrap_or(defaults.events_path),
            poll_interval: env_millis("BOARDSYNC_POLL_INTERVAL_MS")?
                .unwrap_or(defaults.poll_interval),
            request_timeout: env_millis("BOARDSYNC_REQUEST_TIMEOUT_MS")?
                .unwrap_or(defaults.request_timeout),
            reconnect: BackoffPolicy {
                initial: env_millis("BOARDSYNC_RECONNECT_INITIAL_MS")?
                    .unwrap_or(defaults.reconnect.initial),
                max: env_millis("BOARDSYNC_RECONNECT_MAX_MS")?.unwrap_or(defaults.reconnect.max),
            },
            credential_file: env_string("BOARDSYNC_CREDENTIAL_FILE")?
                .map_or(defaults.credential_file, PathBuf::from),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - any interval, timeout or delay is zero
    /// - the reconnect initial delay exceeds its cap
    /// - the base URL is not `http://` or `https://`
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("BOARDSYNC_POLL_INTERVAL_MS", self.poll_interval),
            ("BOARDSYNC_REQUEST_TIMEOUT_MS", self.request_timeout),
            ("BOARDSYNC_RECONNECT_INITIAL_MS", self.reconnect.initial),
            ("BOARDSYNC_RECONNECT_MAX_MS", self.reconnect.max),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, value)| value.is_zero()) {
            return Err(ConfigError::ZeroDuration { name });
        }
        if self.reconnect.initial > self.reconnect.max {
            return Err(ConfigError::InvalidReconnectRange {
                initial_ms: self.reconnect.initial.as_millis(),
                max_ms: self.reconnect.max.as_millis(),
            });
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ConfigError::InvalidBaseUrl(self.base_url.clone()));
        }
        Ok(())
    }

    /// Full URL of the push stream.
    #[must_use]
    pub fn events_url(&self) -> String {
        format!("{}{}", self.base_url, self.events_path)
    }
}

// =============================================================================
// Environment Variable Parsing
// =============================================================================

/// Reads a variable; unset and blank values are `None`.
fn env_string(name: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(name) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value.trim().to_string())),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::NotUnicode {
            name: name.to_string(),
        }),
    }
}

/// Reads a millisecond duration.
fn env_millis(name: &str) -> Result<Option<Duration>, ConfigError> {
    env_string(name)?
        .map(|value| parse_millis(name, &value))
        .transpose()
}

fn parse_millis(name: &str, value: &str) -> Result<Duration, ConfigError> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|error| ConfigError::InvalidNumber {
            name: name.to_string(),
            message: error.to_string(),
            value: value.to_string(),
        })
}
