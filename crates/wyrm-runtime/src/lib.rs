//! Wyrm Runtime - hosted workers and orchestration for Wyrm.
//!
//! This crate provides:
//! - [`Worker`]: one broker subscription running a handler's pipeline
//! - [`HostLifecycle`]: the worker pool of one handler type
//! - [`WyrmRuntime`]: registration, configuration overrides and process
//!   lifecycle of all handler types
//! - Configuration loading ([`config`]) and logging setup ([`logging`])
//!
//! ```ignore
//! use wyrm_runtime::{HandlerOptions, WyrmRuntime};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = WyrmRuntime::builder().build()?;
//!     runtime
//!         .register_request_handler("uppercase", Uppercase, bindings, HandlerOptions::new())
//!         .await?;
//!
//!     // Runs until Ctrl+C, SIGTERM or a host failure.
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod host;
pub mod logging;
pub mod runtime;
pub mod worker;

pub use config::{ConfigError, ConfigLoader, ConfigResult, HandlerConfig, HostConfig, WyrmConfig};
pub use error::{RuntimeError, RuntimeResult};
pub use host::{HostError, HostLifecycle, HostStatus};
pub use logging::{LoggingBuilder, SpanEvents};
pub use runtime::{HandlerOptions, RuntimeBuilder, WyrmRuntime};
pub use worker::{Worker, WorkerError, WorkerState};

pub use tracing;

/// Logging macros for handler and behavior code.
pub mod prelude {
    pub use tracing::{Level, debug, error, info, instrument, span, trace, warn};
}
