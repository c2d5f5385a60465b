//! Configuration of the Wyrm runtime.
//!
//! Loads logging settings, host timeouts, broker settings and per-handler
//! overrides from files, environment variables and code.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, Profile, load_config, load_config_from_file};
pub use schema::{
    HandlerConfig, HostConfig, LogFormat, LogLevel, LogOutput, LogRotation, LoggingConfig,
    SpanEventConfig, WyrmConfig,
};
pub use validation::validate_config;
