//! Configuration validation utilities.

use super::error::{ConfigError, ConfigResult};
use super::schema::{HandlerConfig, LogOutput, WyrmConfig};
use wyrm_core::Direction;

/// Validates the entire configuration.
pub fn validate_config(config: &WyrmConfig) -> ConfigResult<()> {
    validate_logging(config)?;

    if config.host.stop_timeout_ms == 0 {
        return Err(ConfigError::validation(
            "host.stop_timeout_ms must be greater than 0",
        ));
    }

    if config.broker.consumer_concurrency == 0 {
        return Err(ConfigError::validation(
            "broker.consumer_concurrency must be at least 1",
        ));
    }

    for (key, handler) in &config.handlers {
        validate_handler(key, handler)?;
    }

    Ok(())
}

fn validate_logging(config: &WyrmConfig) -> ConfigResult<()> {
    let logging = &config.logging;

    if logging.output == LogOutput::File && logging.file_path.is_none() {
        return Err(ConfigError::validation(
            "logging.output = \"file\" requires logging.file_path",
        ));
    }

    if logging.filters.keys().any(|target| target.trim().is_empty()) {
        return Err(ConfigError::validation(
            "logging.filters contains an empty target",
        ));
    }

    Ok(())
}

/// Checks a handler entry on its own. Whether the bindings resolve for the
/// handler's shape is decided at registration.
fn validate_handler(key: &str, handler: &HandlerConfig) -> ConfigResult<()> {
    if key.trim().is_empty() {
        return Err(ConfigError::validation("handler keys must not be empty"));
    }

    if handler.instances == Some(0) {
        return Err(ConfigError::invalid_handler(
            key,
            "instances must be at least 1",
        ));
    }

    if handler
        .bindings
        .iter()
        .any(|b| b.event_name.trim().is_empty())
    {
        return Err(ConfigError::invalid_handler(
            key,
            "binding event names must not be empty",
        ));
    }

    if !handler.bindings.is_empty()
        && !handler.bindings.iter().any(|b| b.direction == Direction::In)
    {
        return Err(ConfigError::invalid_handler(
            key,
            "bindings must contain an inbound entry",
        ));
    }

    Ok(())
}
