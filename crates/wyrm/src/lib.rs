//! # Wyrm
//!
//! Typed message handlers over queues and topics.
//!
//! An application declares handlers for asynchronous messages without
//! writing broker-specific code. Wyrm resolves which queue or topic feeds a
//! handler, decodes the payload into the handler's input type, runs a
//! composed pipeline of behaviors around the handler, and publishes the
//! handler's result to its outbound destination.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────┐     ┌──────────────────────────────────────────────┐
//! │ Broker │────▶│ Host "uppercase"  worker #0 ─┐               │
//! │        │────▶│                   worker #1 ─┼─▶ Pipeline ───┼──▶ publish
//! └────────┘     │                   worker #2 ─┘               │
//!                └──────────────────────────────────────────────┘
//! ```
//!
//! - **Runtime**: registers handler types and runs their hosts
//! - **Hosts**: one per handler type, running N workers
//! - **Workers**: one broker subscription each; queue bindings compete for
//!   messages, topic bindings get one anonymous queue per worker
//! - **Pipeline**: `before ++ [Invoke Handler, Publish Result?] ++ after`,
//!   built from tower layers
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use wyrm::prelude::*;
//!
//! #[derive(Serialize, Deserialize)]
//! struct TextMessage {
//!     text: String,
//! }
//!
//! struct Uppercase;
//!
//! #[async_trait]
//! impl RequestHandler for Uppercase {
//!     type Input = Json<TextMessage>;
//!     type Output = Json<TextMessage>;
//!
//!     async fn handle(
//!         &self,
//!         input: Option<Json<TextMessage>>,
//!         _ctx: &MessageContext,
//!     ) -> Result<Json<TextMessage>, BoxError> {
//!         let Json(message) = input.ok_or("empty message")?;
//!         Ok(Json(TextMessage { text: message.text.to_uppercase() }))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = WyrmRuntime::builder().build()?;
//!     runtime
//!         .register_request_handler(
//!             "uppercase",
//!             Uppercase,
//!             [
//!                 EventBinding::queue("text.requests"),
//!                 EventBinding::queue("text.results").outbound(),
//!             ],
//!             HandlerOptions::new().instances(2),
//!         )
//!         .await?;
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `toml-config` *(default)*: TOML configuration files
//! - `yaml-config`: YAML configuration files
//! - `json-log`: JSON log output

pub use wyrm_core as core;
pub use wyrm_framework as framework;
pub use wyrm_runtime as runtime;
pub use wyrm_transport as transport;

pub use wyrm_runtime::{HandlerOptions, RuntimeError, WyrmConfig, WyrmRuntime};

/// Prelude module for convenient imports.
pub mod prelude {
    // Runtime
    pub use wyrm_runtime::{HandlerOptions, HostStatus, RuntimeError, WyrmRuntime};

    // Handlers and payloads
    pub use wyrm_core::{BoxError, Headers, Json, MessageContext, PayloadStream};
    pub use wyrm_framework::{EventHandler, RequestHandler, async_trait};

    // Bindings
    pub use wyrm_core::{Binding, EventBinding, HandlerKey};

    // Behaviors
    pub use wyrm_framework::{Behavior, Next, call_next, from_fn};

    // Brokers
    pub use wyrm_core::Broker;
    pub use wyrm_transport::InMemoryBroker;
}
