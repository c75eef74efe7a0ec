//! Post-merge configuration validation.

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

/// Upper bound for `wire.request_timeout_ms` (one hour).
const MAX_REQUEST_TIMEOUT_MS: u64 = 3_600_000;

/// Bounds for `wire.max_line_bytes` (1 KiB to 1 GiB).
const MIN_LINE_BYTES: usize = 1024;
const MAX_LINE_BYTES: usize = 1_073_741_824;

/// Validate a fully-merged and deserialized configuration.
///
/// # Errors
///
/// Returns the first validation error found.
pub fn validate(config: &Config) -> ConfigResult<()> {
    validate_wire(config)?;
    validate_logging(config)?;
    Ok(())
}

fn validate_wire(config: &Config) -> ConfigResult<()> {
    let wire = &config.wire;

    if wire.request_timeout_ms == 0 || wire.request_timeout_ms > MAX_REQUEST_TIMEOUT_MS {
        return Err(ConfigError::ValidationError {
            field: "wire.request_timeout_ms".to_owned(),
            message: format!("request_timeout_ms must be between 1 and {MAX_REQUEST_TIMEOUT_MS}"),
        });
    }

    if !(MIN_LINE_BYTES..=MAX_LINE_BYTES).contains(&wire.max_line_bytes) {
        return Err(ConfigError::ValidationError {
            field: "wire.max_line_bytes".to_owned(),
            message: format!(
                "max_line_bytes must be between {MIN_LINE_BYTES} and {MAX_LINE_BYTES}"
            ),
        });
    }

    Ok(())
}

fn validate_logging(config: &Config) -> ConfigResult<()> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::ValidationError {
            field: "logging.level".to_owned(),
            message: format!(
                "unsupported log level '{}'; expected one of: {}",
                config.logging.level,
                valid_levels.join(", ")
            ),
        });
    }

    let valid_formats = ["pretty", "compact", "json", "full"];
    if !valid_formats.contains(&config.logging.format.as_str()) {
        return Err(ConfigError::ValidationError {
            field: "logging.format".to_owned(),
            message: format!(
                "unsupported log format '{}'; expected one of: {}",
                config.logging.format,
                valid_formats.join(", ")
            ),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = Config::default();
        config.wire.request_timeout_ms = 0;
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("wire.request_timeout_ms"));
    }

    #[test]
    fn test_tiny_line_limit_rejected() {
        let mut config = Config::default();
        config.wire.max_line_bytes = 16;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_unknown_log_format_rejected() {
        let mut config = Config::default();
        config.logging.format = "xml".into();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("logging.format"));
    }
}
