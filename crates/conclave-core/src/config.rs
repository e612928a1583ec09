use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConclaveError;
use crate::retry::{DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_BACKOFF, RetryPolicy};

/// Backoff settings as they appear in a config file.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    /// Tries including the first; absent means retry forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_initial_backoff_ms() -> u64 {
    DEFAULT_INITIAL_BACKOFF.as_millis() as u64
}

fn default_max_backoff_ms() -> u64 {
    DEFAULT_MAX_BACKOFF.as_millis() as u64
}

impl RetryConfig {
    /// Token refresh gives up after a few tries.
    pub fn refresh() -> Self {
        Self {
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }

    /// The event stream is resubscribed for as long as the session lives.
    pub fn reconnect() -> Self {
        Self {
            max_attempts: None,
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy::new(
            config.max_attempts,
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ConferenceConfig {
    pub node_url: String,
    pub conference_alias: String,
    #[serde(default = "default_display_name")]
    pub display_name: String,
    #[serde(default = "default_true")]
    pub presentation_in_main: bool,
    #[serde(default = "RetryConfig::refresh")]
    pub refresh_retry: RetryConfig,
    #[serde(default = "RetryConfig::reconnect")]
    pub reconnect: RetryConfig,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

fn default_display_name() -> String {
    "Guest".to_string()
}

fn default_true() -> bool {
    true
}

fn default_http_timeout_secs() -> u64 {
    10
}

impl ConferenceConfig {
    pub fn new(
        node_url: impl Into<String>,
        conference_alias: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            node_url: node_url.into(),
            conference_alias: conference_alias.into(),
            display_name: display_name.into(),
            presentation_in_main: true,
            refresh_retry: RetryConfig::refresh(),
            reconnect: RetryConfig::reconnect(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }

    /// Load and validate a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConclaveError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ConclaveError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, ConclaveError> {
        let config: Self = serde_json::from_str(contents)
            .map_err(|e| ConclaveError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConclaveError> {
        if self.node_url.trim().is_empty() {
            return Err(ConclaveError::Config("node_url is empty".into()));
        }
        if self.conference_alias.trim().is_empty() {
            return Err(ConclaveError::Config("conference_alias is empty".into()));
        }
        if self.http_timeout_secs == 0 {
            return Err(ConclaveError::Config("http_timeout_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn refresh_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.refresh_retry)
    }

    pub fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.reconnect)
    }
}
