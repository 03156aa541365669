pub mod validation;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::routing::TierOverrides;

use self::validation::validate_config;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Streaming conversion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Characters of argument text that make up a content fingerprint.
    #[serde(default = "default_fingerprint_prefix_chars")]
    pub fingerprint_prefix_chars: usize,
    /// Give up on the backend after this long without an event.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Frames buffered towards a slow client before backpressure applies.
    #[serde(default = "default_client_buffer_frames")]
    pub client_buffer_frames: usize,
    /// Forward tool arguments as they arrive (tier-1 rewrite). When off,
    /// each call's arguments are sent once, fully normalized, at the end.
    #[serde(default = "default_true")]
    pub stream_tool_arguments: bool,
}

fn default_fingerprint_prefix_chars() -> usize {
    50
}
fn default_idle_timeout_secs() -> u64 {
    180
}
fn default_client_buffer_frames() -> usize {
    64
}
fn default_true() -> bool {
    true
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            fingerprint_prefix_chars: default_fingerprint_prefix_chars(),
            idle_timeout_secs: default_idle_timeout_secs(),
            client_buffer_frames: default_client_buffer_frames(),
            stream_tool_arguments: true,
        }
    }
}

/// Feature flags and settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub model_tiers: TierOverrides,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
}

impl AppConfig {
    /// Parse and validate configuration from YAML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] when parsing fails, or
    /// [`ConfigError::Validation`] when semantic validation fails.
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(contents)?;
        validate_config(&config)?;
        Ok(config)
    }

    /// Overlay plain key-value settings (environment style). Unknown keys and
    /// unparsable values are ignored; the existing value is kept.
    pub fn merge_key_values<'a>(&mut self, pairs: impl IntoIterator<Item = (&'a str, &'a str)>) {
        for (key, value) in pairs {
            let key = key.trim().to_ascii_lowercase();
            let applied = match key.as_str() {
                "small_model" | "middle_model" | "big_model" => self.model_tiers.set(&key, value),
                "log_level" => {
                    self.features.log_level = value.trim().to_uppercase();
                    true
                }
                "log_format" => match value.trim().to_ascii_lowercase().as_str() {
                    "text" => {
                        self.features.log_format = LogFormat::Text;
                        true
                    }
                    "json" => {
                        self.features.log_format = LogFormat::Json;
                        true
                    }
                    _ => false,
                },
                "stream_tool_arguments" => parse_flag(value)
                    .map(|flag| self.stream.stream_tool_arguments = flag)
                    .is_some(),
                "fingerprint_prefix_chars" => value
                    .trim()
                    .parse::<usize>()
                    .ok()
                    .filter(|n| validation::FINGERPRINT_PREFIX_RANGE.contains(n))
                    .map(|n| self.stream.fingerprint_prefix_chars = n)
                    .is_some(),
                "idle_timeout_secs" => value
                    .trim()
                    .parse::<u64>()
                    .ok()
                    .filter(|n| *n > 0)
                    .map(|n| self.stream.idle_timeout_secs = n)
                    .is_some(),
                _ => false,
            };
            if !applied {
                tracing::debug!("ignoring config override {}={}", key, value);
            }
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Load configuration from a YAML file and validate it.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading the file fails, [`ConfigError::Yaml`]
/// when parsing fails, or [`ConfigError::Validation`] when semantic validation fails.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    AppConfig::from_yaml_str(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_example_config() {
        // The example config should load and validate successfully
        let config = load_config("config.example.yaml");
        assert!(
            config.is_ok(),
            "Failed to load example config: {:?}",
            config.err()
        );
        let config = config.unwrap();
        assert_eq!(config.stream.fingerprint_prefix_chars, 50);
        assert!(config.stream.stream_tool_arguments);
        assert_eq!(config.model_tiers.big.as_deref(), Some("claude-opus-4.5"));
        assert_eq!(config.features.log_format, LogFormat::Text);
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = AppConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config.stream.idle_timeout_secs, 180);
        assert_eq!(config.stream.client_buffer_frames, 64);
        assert_eq!(config.features.log_level, "INFO");
        assert_eq!(config.model_tiers, TierOverrides::default());
    }

    #[test]
    fn test_log_format_serde() {
        let json = serde_json::to_string(&LogFormat::Json).unwrap();
        assert_eq!(json, "\"json\"");
        let format: LogFormat = serde_json::from_str("\"text\"").unwrap();
        assert_eq!(format, LogFormat::Text);
    }

    #[test]
    fn test_key_values_fall_back_on_bad_input() {
        let mut config = AppConfig::default();
        config.merge_key_values([
            ("SMALL_MODEL", "claude-haiku-4.5"),
            ("stream_tool_arguments", "maybe"),
            ("fingerprint_prefix_chars", "0"),
            ("idle_timeout_secs", "30"),
            ("log_format", "json"),
            ("unknown", "x"),
        ]);
        assert_eq!(config.model_tiers.small.as_deref(), Some("claude-haiku-4.5"));
        assert!(config.stream.stream_tool_arguments);
        assert_eq!(config.stream.fingerprint_prefix_chars, 50);
        assert_eq!(config.stream.idle_timeout_secs, 30);
        assert_eq!(config.features.log_format, LogFormat::Json);
    }
}
