//! Session configuration
//!
//! Loaded from a TOML file or environment by the embedding application.
//! All timing bounds are explicit so reconnect and autosave behavior is
//! documented configuration rather than buried constants.

use serde::Deserialize;
use std::time::Duration;

/// Configuration for a live transcription session
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// WebSocket URL of the transcription backend (ws:// or wss://)
    pub backend_url: String,
    /// Default language code used for the handshake until recording fixes one
    pub language: String,
    /// Optional bearer token forwarded on the upgrade request
    pub auth_token: Option<String>,
    /// Connection establishment timeout in seconds
    pub connect_timeout_secs: u64,
    /// Base delay for exponential reconnect backoff in seconds
    pub reconnect_base_delay_secs: u64,
    /// Cap for exponential reconnect backoff in seconds
    pub reconnect_max_delay_secs: u64,
    /// Maximum reconnect attempts before giving up
    pub max_reconnect_attempts: u32,
    /// WebSocket keepalive ping interval in seconds
    pub ping_interval_secs: u64,
    /// Autosave interval in seconds (active only while recording)
    pub autosave_interval_secs: u64,
    /// Timeout for a single autosave write in seconds
    pub autosave_timeout_secs: u64,
    /// Timeout for the finalize call in seconds
    pub finalize_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend_url: "wss://localhost:8765/stream".to_string(),
            language: "en".to_string(),
            auth_token: None,
            connect_timeout_secs: 30,
            reconnect_base_delay_secs: 1,
            reconnect_max_delay_secs: 30,
            max_reconnect_attempts: 10,
            ping_interval_secs: 30,
            autosave_interval_secs: 30,
            autosave_timeout_secs: 10,
            finalize_timeout_secs: 30,
        }
    }
}

impl SessionConfig {
    /// Parse a configuration from TOML text
    ///
    /// Missing keys fall back to defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub(crate) fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub(crate) fn autosave_interval(&self) -> Duration {
        Duration::from_secs(self.autosave_interval_secs)
    }

    pub(crate) fn autosave_timeout(&self) -> Duration {
        Duration::from_secs(self.autosave_timeout_secs)
    }

    pub(crate) fn finalize_timeout(&self) -> Duration {
        Duration::from_secs(self.finalize_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.language, "en");
        assert_eq!(config.reconnect_base_delay_secs, 1);
        assert_eq!(config.reconnect_max_delay_secs, 30);
        assert_eq!(config.max_reconnect_attempts, 10);
    }

    #[test]
    fn test_from_toml_partial() {
        let config = SessionConfig::from_toml_str(
            r#"
            backend_url = "wss://stt.example.com/stream"
            language = "no"
            autosave_interval_secs = 15
            "#,
        )
        .unwrap();
        assert_eq!(config.backend_url, "wss://stt.example.com/stream");
        assert_eq!(config.language, "no");
        assert_eq!(config.autosave_interval_secs, 15);
        // Unspecified keys keep defaults
        assert_eq!(config.connect_timeout_secs, 30);
    }

    #[test]
    fn test_from_toml_invalid() {
        assert!(SessionConfig::from_toml_str("autosave_interval_secs = \"soon\"").is_err());
    }
}
