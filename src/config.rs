//! Client configuration for the DTalks realtime layer
//!
//! Configuration is loaded from a TOML file. Every section except `[broker]`
//! and `[api]` is optional and falls back to the defaults the chat backend is
//! deployed with.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Main client configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub broker: BrokerSection,
    pub api: ApiSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub typing: TypingSection,
}

/// Broker (Centrifugo) connection section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// WebSocket endpoint, e.g. `ws://localhost:9001/connection/websocket`
    pub ws_url: String,
    /// Client name announced in the connect command
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// Timeout for the WebSocket handshake plus the connect reply
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// REST API section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiSection {
    /// Base URL of the chat backend
    pub base_url: String,
    /// Environment variable holding the user's access token
    #[serde(default = "default_access_token_env")]
    pub access_token_env: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Retry policies for the two recovery loops
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    #[serde(default = "RetryPolicyConfig::connection")]
    pub connection: RetryPolicyConfig,
    #[serde(default = "RetryPolicyConfig::subscription")]
    pub subscription: RetryPolicyConfig,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            connection: RetryPolicyConfig::connection(),
            subscription: RetryPolicyConfig::subscription(),
        }
    }
}

/// Exponential backoff parameters
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicyConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl RetryPolicyConfig {
    /// Connection-level defaults: 1s, 2s, 4s, 8s, 16s (cap 30s), 5 attempts
    pub fn connection() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_attempts: 5,
        }
    }

    /// Subscription-level defaults: 1s, 2s, 4s (cap 10s), 3 attempts
    pub fn subscription() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            max_attempts: 3,
        }
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidConfig(format!(
                "retry.{name}.max_attempts must be greater than 0"
            )));
        }
        if self.base_delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(format!(
                "retry.{name}.base_delay_ms must be greater than 0"
            )));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::InvalidConfig(format!(
                "retry.{name}.max_delay_ms ({}) must not be below base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            )));
        }
        Ok(())
    }
}

/// Typing indicator timing
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TypingSection {
    /// How long an inbound "is typing" entry lives without a refresh
    #[serde(default = "default_typing_ttl_ms")]
    pub ttl_ms: u64,
    /// Idle time after the last keystroke before "stopped typing" is sent
    #[serde(default = "default_typing_idle_ms")]
    pub idle_ms: u64,
}

impl Default for TypingSection {
    fn default() -> Self {
        Self {
            ttl_ms: default_typing_ttl_ms(),
            idle_ms: default_typing_idle_ms(),
        }
    }
}

impl TypingSection {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }
}

fn default_client_name() -> String {
    "dtalks-rs".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_access_token_env() -> String {
    "DTALKS_ACCESS_TOKEN".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_typing_ttl_ms() -> u64 {
    3000
}

fn default_typing_idle_ms() -> u64 {
    1000
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_url(&self.broker.ws_url, &["ws", "wss"], "broker.ws_url")?;
        validate_url(&self.api.base_url, &["http", "https"], "api.base_url")?;

        self.retry.connection.validate("connection")?;
        self.retry.subscription.validate("subscription")?;

        if self.typing.ttl_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "typing.ttl_ms must be greater than 0".to_string(),
            ));
        }
        if self.broker.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker.connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Resolve the user's access token from the configured environment variable
    pub fn access_token(&self) -> Result<String, ConfigError> {
        std::env::var(&self.api.access_token_env)
            .map_err(|_| ConfigError::EnvVarNotFound(self.api.access_token_env.clone()))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.broker.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.api.request_timeout_ms)
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[broker]
ws_url = "ws://localhost:9001/connection/websocket"

[api]
base_url = "http://localhost:8000"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

fn validate_url(raw: &str, schemes: &[&str], field: &str) -> Result<(), ConfigError> {
    let url = Url::parse(raw)
        .map_err(|e| ConfigError::InvalidConfig(format!("{field} '{raw}' is not a URL: {e}")))?;

    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::InvalidConfig(format!(
            "{field} must use one of {schemes:?}, got '{}'",
            url.scheme()
        )));
    }

    Ok(())
}
