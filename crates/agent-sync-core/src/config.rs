//! Client configuration.

use std::{collections::HashMap, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Settings for the control connection, request correlation, replay and
/// polling fallback.
///
/// Every field has a default, so a TOML file only needs the keys it changes:
///
/// ```toml
/// ws_url = "wss://agents.example.com/ws"
/// api_base_url = "https://agents.example.com/api/"
/// poll_interval_ms = 10000
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Control-plane WebSocket endpoint.
    pub ws_url: String,
    /// Base URL of the fallback REST surface.
    pub api_base_url: String,
    /// Keepalive ping interval.
    pub heartbeat_interval_ms: u64,
    /// First reconnect delay; doubled per failed attempt.
    pub reconnect_base_ms: u64,
    /// Upper bound on the reconnect delay.
    pub reconnect_cap_ms: u64,
    /// Deadline for a correlated request.
    pub request_timeout_ms: u64,
    /// Fallback poll interval while disconnected.
    pub poll_interval_ms: u64,
    /// How long a terminal action stays visible before it is purged.
    pub display_grace_ms: u64,
    /// How many removed action ids are remembered to reject late re-sightings.
    pub tombstone_capacity: usize,
    /// Arbitrary metadata for app-specific needs.
    pub metadata: HashMap<String, Value>,
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:3000/ws".to_owned(),
            api_base_url: "http://127.0.0.1:3000/api/".to_owned(),
            heartbeat_interval_ms: 25_000,
            reconnect_base_ms: 1_000,
            reconnect_cap_ms: 30_000,
            request_timeout_ms: 30_000,
            poll_interval_ms: 5_000,
            display_grace_ms: 1_000,
            tombstone_capacity: 1024,
            metadata: HashMap::new(),
        }
    }
}

impl SyncConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    /// Returns error if the document is malformed or fails validation.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read, parsed or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        tracing::debug!(path = %path.as_ref().display(), "Loaded sync config");
        Self::from_toml_str(&raw)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    /// Returns error naming the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid("heartbeat_interval_ms must be > 0".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be > 0".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("request_timeout_ms must be > 0".into()));
        }
        if self.reconnect_base_ms == 0 {
            return Err(ConfigError::Invalid("reconnect_base_ms must be > 0".into()));
        }
        if self.reconnect_base_ms > self.reconnect_cap_ms {
            return Err(ConfigError::Invalid(format!(
                "reconnect_base_ms ({}) exceeds reconnect_cap_ms ({})",
                self.reconnect_base_ms, self.reconnect_cap_ms
            )));
        }
        Ok(())
    }

    /// Override the WebSocket endpoint.
    #[must_use]
    pub fn with_ws_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = url.into();
        self
    }

    /// Override the REST base URL.
    #[must_use]
    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into();
        self
    }

    /// Override the reconnect backoff bounds.
    #[must_use]
    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.reconnect_base_ms = millis(base);
        self.reconnect_cap_ms = millis(cap);
        self
    }

    /// Override the request deadline.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = millis(timeout);
        self
    }

    /// Override the fallback poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = millis(interval);
        self
    }

    /// Override the terminal display grace.
    #[must_use]
    pub fn with_display_grace(mut self, grace: Duration) -> Self {
        self.display_grace_ms = millis(grace);
        self
    }

    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[must_use]
    pub const fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    #[must_use]
    pub const fn reconnect_cap(&self) -> Duration {
        Duration::from_millis(self.reconnect_cap_ms)
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub const fn display_grace(&self) -> Duration {
        Duration::from_millis(self.display_grace_ms)
    }

    /// Get a metadata value by key.
    #[must_use]
    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Set a metadata value.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = SyncConfig::from_toml_str(
            r#"
            ws_url = "wss://example.test/ws"
            poll_interval_ms = 10000

            [metadata]
            tab = "left"
            "#,
        )
        .unwrap();

        assert_eq!(config.ws_url, "wss://example.test/ws");
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.reconnect_cap(), Duration::from_secs(30));
        assert_eq!(config.get_metadata("tab"), Some(&Value::from("left")));
    }

    #[test]
    fn test_rejects_inverted_backoff() {
        let err = SyncConfig::from_toml_str("reconnect_base_ms = 5000\nreconnect_cap_ms = 1000")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_zero_reconnect_base() {
        let err = SyncConfig::from_toml_str("reconnect_base_ms = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("reconnect_base_ms")));
    }

    #[test]
    fn test_oversized_durations_saturate() {
        let config = SyncConfig::default().with_poll_interval(Duration::MAX);
        assert_eq!(config.poll_interval_ms, u64::MAX);
    }

    #[test]
    fn test_builders() {
        let config = SyncConfig::default()
            .with_backoff(Duration::from_millis(200), Duration::from_secs(2))
            .with_request_timeout(Duration::from_secs(3));
        assert_eq!(config.reconnect_base_ms, 200);
        assert_eq!(config.reconnect_cap_ms, 2_000);
        assert_eq!(config.request_timeout(), Duration::from_secs(3));
        tokio_test::assert_ok!(config.validate());
    }
}
