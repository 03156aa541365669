use std::ops::RangeInclusive;

use super::{AppConfig, ConfigError};

pub(crate) const FINGERPRINT_PREFIX_RANGE: RangeInclusive<usize> = 8..=1024;

const VALID_LOG_LEVELS: &[&str] = &[
    "TRACE", "DEBUG", "INFO", "WARN", "WARNING", "ERROR", "CRITICAL", "DISABLED",
];

/// Validate the full application config, returning an error if any rule is violated.
///
/// Model tier overrides are not validated here: malformed overrides fall back
/// to the tier default at resolution time.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_stream_config(config)?;
    validate_log_level(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_stream_config(config: &AppConfig) -> Result<(), ConfigError> {
    let stream = &config.stream;
    if !FINGERPRINT_PREFIX_RANGE.contains(&stream.fingerprint_prefix_chars) {
        return Err(validation_err(format!(
            "stream.fingerprint_prefix_chars must be between {} and {}",
            FINGERPRINT_PREFIX_RANGE.start(),
            FINGERPRINT_PREFIX_RANGE.end()
        )));
    }
    if stream.idle_timeout_secs == 0 {
        return Err(validation_err(
            "stream.idle_timeout_secs must be greater than 0",
        ));
    }
    if stream.client_buffer_frames == 0 {
        return Err(validation_err(
            "stream.client_buffer_frames must be greater than 0",
        ));
    }
    Ok(())
}

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let level = config.features.log_level.to_uppercase();
    if !VALID_LOG_LEVELS.contains(&level.as_str()) {
        return Err(validation_err(format!(
            "features.log_level '{}' is not one of: {}",
            config.features.log_level,
            VALID_LOG_LEVELS.join(", ")
        )));
    }
    Ok(())
}
