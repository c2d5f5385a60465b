//! # Wyrm Core
//!
//! Foundation types of the Wyrm message dispatch framework.
//!
//! ## Architecture Layers
//!
//! ### Foundation Layer
//!
//! - **Messages**: [`Headers`], [`Delivery`], [`CallerIdentity`]
//! - **Context**: [`MessageContext`], created once per inbound delivery
//! - **Payloads**: [`InboundPayload`], [`OutboundPayload`], [`Json`], [`PayloadStream`]
//! - **Errors**: [`ConfigurationError`], [`DispatchError`], [`BrokerError`]
//!
//! ### Integration Layer
//!
//! - **Bindings**: [`EventBinding`] metadata and resolved [`HandlerDescriptor`]s
//! - **Broker**: the [`Broker`] trait implemented by transports
//!
//! ## Message Flow
//!
//! ```text
//! ┌────────┐  Delivery   ┌────────┐  MessageContext  ┌──────────┐
//! │ Broker │────────────▶│ Worker │─────────────────▶│ Pipeline │
//! └────────┘             └────────┘                  └──────────┘
//!      ▲                                                   │
//!      └──────────────────── publish(result) ──────────────┘
//! ```

pub mod foundation;
pub mod integration;

pub use foundation::{
    BoxError, BrokerError, BrokerResult, CallerIdentity, ConfigurationError, ConfigurationResult,
    Delivery, DispatchError, HeaderValue, Headers, InboundPayload, Json, KeyCase, MessageContext,
    MessageSource, OutboundPayload, Payload, PayloadError, PayloadKind, PayloadResult,
    PayloadStream, decode_structured, rewrite_keys,
};

pub use integration::{
    Binding, BoxedBroker, Broker, DeliveryHandler, DeliveryOutcome, Direction, EventBinding,
    HandlerDescriptor, HandlerKey, HandlerShape, HeaderMutator, Subscription, SubscriptionId,
    ensure_destination,
};

pub use futures::future::BoxFuture;

/// Prelude for common imports.
pub mod prelude {
    pub use super::foundation::*;
    pub use super::integration::{Binding, Broker, EventBinding, HandlerKey};
}
