//! Configuration schema definitions.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use wyrm_core::EventBinding;
use wyrm_transport::InMemoryConfig;

/// Root configuration structure.
///
/// ```toml
/// [logging]
/// level = "debug"
///
/// [host]
/// stop_timeout_ms = 2000
///
/// [handlers.uppercase]
/// instances = 4
/// bindings = [
///     { event_name = "text.requests" },
///     { event_name = "text.results", direction = "out", allow_multiple_consumers = true },
/// ]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WyrmConfig {
    pub logging: LoggingConfig,

    pub host: HostConfig,

    /// Settings of the default in-memory broker.
    pub broker: InMemoryConfig,

    /// Per-handler overrides, keyed by handler key.
    pub handlers: HashMap<String, HandlerConfig>,
}

impl WyrmConfig {
    pub fn handler(&self, key: &str) -> Option<&HandlerConfig> {
        self.handlers.get(key)
    }
}

// =============================================================================
// Host and handler settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Upper bound for draining in-flight messages on stop.
    pub stop_timeout_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: 5000,
        }
    }
}

impl HostConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Overrides for one handler key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    /// Number of worker instances. Overrides the value given in code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instances: Option<usize>,

    /// Bindings of the handler. When non-empty they replace the bindings
    /// given in code.
    pub bindings: Vec<EventBinding>,
}

// =============================================================================
// Logging settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base level. `RUST_LOG` takes precedence when set.
    pub level: LogLevel,

    pub format: LogFormat,

    pub output: LogOutput,

    pub span_events: SpanEventConfig,

    pub thread_ids: bool,

    /// Include file names and line numbers.
    pub file_location: bool,

    /// Log file for [`LogOutput::File`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,

    pub rotation: LogRotation,

    /// Number of rotated files to keep.
    pub max_files: usize,

    /// Per-target levels, e.g. `wyrm_transport = "trace"`.
    pub filters: HashMap<String, LogLevel>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Compact,
            output: LogOutput::Stdout,
            span_events: SpanEventConfig::default(),
            thread_ids: false,
            file_location: false,
            file_path: None,
            rotation: LogRotation::Never,
            max_files: 5,
            filters: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
    Pretty,
    /// Requires the `json-log` feature, falls back to `Full` otherwise.
    Json,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Never,
    Minutely,
    Hourly,
    Daily,
}

/// Which span lifecycle events are logged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpanEventConfig {
    pub new: bool,
    pub enter: bool,
    pub exit: bool,
    pub close: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wyrm_core::Direction;

    #[test]
    fn defaults() {
        let config = WyrmConfig::default();
        assert_eq!(config.logging.level, LogLevel::Info);
        assert_eq!(config.logging.format, LogFormat::Compact);
        assert_eq!(config.host.stop_timeout(), Duration::from_secs(5));
        assert_eq!(config.broker.consumer_concurrency, 1);
        assert!(config.handlers.is_empty());
    }

    #[test]
    fn deserializes_handler_overrides() {
        let config: WyrmConfig = serde_json::from_value(serde_json::json!({
            "logging": { "level": "debug", "filters": { "wyrm_transport": "trace" } },
            "handlers": {
                "uppercase": {
                    "instances": 3,
                    "bindings": [
                        { "event_name": "text.requests" },
                        { "event_name": "text.results", "direction": "out" }
                    ]
                }
            }
        }))
        .unwrap();

        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.logging.filters["wyrm_transport"], LogLevel::Trace);
        assert_eq!(config.host.stop_timeout_ms, 5000);

        let handler = config.handler("uppercase").unwrap();
        assert_eq!(handler.instances, Some(3));
        assert_eq!(handler.bindings.len(), 2);
        assert_eq!(handler.bindings[0].direction, Direction::In);
        assert!(!handler.bindings[0].allow_multiple_consumers);
        assert_eq!(handler.bindings[1].direction, Direction::Out);
    }
}
