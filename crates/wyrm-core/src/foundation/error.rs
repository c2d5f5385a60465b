//! Unified error types for the Wyrm core.
//!
//! The taxonomy follows the point at which an error can occur:
//!
//! - [`ConfigurationError`]: raised while a handler type is registered,
//!   before any worker starts.
//! - [`DispatchError`]: raised while a single message travels through the
//!   pipeline. The worker logs it and moves on to the next message.
//! - [`BrokerError`]: raised by a [`Broker`](crate::Broker) implementation.

use thiserror::Error;

/// A boxed, thread-safe error, the error type carried through pipelines.
///
/// Identical to `tower::BoxError`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

// =============================================================================
// Configuration Errors
// =============================================================================

/// Errors detected while registering a handler type.
///
/// These are fatal to the registration that raised them but never affect
/// other handler types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// No binding with direction `In` was declared.
    #[error("handler '{handler}': handlers need exactly one inbound binding, none was declared")]
    MissingInbound {
        /// The handler key.
        handler: String,
    },

    /// More than one binding with direction `In` was declared.
    #[error("handler '{handler}': only one inbound binding is supported, found {count}")]
    DuplicateInbound {
        /// The handler key.
        handler: String,
        /// Number of inbound bindings found.
        count: usize,
    },

    /// More than one binding with direction `Out` was declared.
    #[error("handler '{handler}': only one outbound binding is supported, found {count}")]
    DuplicateOutbound {
        /// The handler key.
        handler: String,
        /// Number of outbound bindings found.
        count: usize,
    },

    /// A binding was declared with an empty event name.
    #[error("handler '{handler}': binding event name cannot be empty")]
    EmptyEventName {
        /// The handler key.
        handler: String,
    },

    /// A handler that produces no output declared an outbound binding.
    #[error(
        "handler '{handler}' produces no output but declares outbound binding '{destination}'"
    )]
    OutboundWithoutOutput {
        /// The handler key.
        handler: String,
        /// The declared destination name.
        destination: String,
    },

    /// The configured instance count was zero.
    #[error("handler '{handler}': instance count must be at least 1")]
    InvalidInstanceCount {
        /// The handler key.
        handler: String,
    },

    /// A handler with the same key was already registered.
    #[error("handler '{0}' is already registered")]
    DuplicateHandler(String),

    /// A behavior was added to a pipeline after it was built.
    #[error("pipeline '{0}' is already built, behaviors can no longer be added")]
    PipelineSealed(String),

    /// The outbound destination of a handler could not be declared.
    #[error("handler '{handler}': failed to declare destination: {reason}")]
    Topology {
        /// The handler key.
        handler: String,
        /// The broker's failure message.
        reason: String,
    },
}

// =============================================================================
// Payload Errors
// =============================================================================

/// Errors raised while converting between wire bytes and handler values.
#[derive(Debug, Clone, Error)]
pub enum PayloadError {
    /// The body could not be decoded into the requested type.
    #[error("unable to decode payload as {target}: {reason}")]
    Decode {
        /// Name of the target type.
        target: &'static str,
        /// Underlying decoder message.
        reason: String,
    },

    /// A handler output could not be encoded.
    #[error("unable to encode payload: {0}")]
    Encode(String),
}

impl PayloadError {
    /// Creates a decode error for `target`.
    pub fn decode(target: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::Decode {
            target,
            reason: reason.to_string(),
        }
    }
}

// =============================================================================
// Dispatch Errors
// =============================================================================

/// Errors raised while a single message is processed.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The inbound body did not match the handler's declared input type.
    #[error("handler '{handler}' could not deserialize message from '{source_name}': {cause}")]
    Deserialize {
        /// The handler key.
        handler: String,
        /// The queue or topic the message was addressed to.
        source_name: String,
        /// The payload error.
        cause: PayloadError,
    },

    /// The handler body returned an error.
    #[error("handler '{handler}' failed: {cause}")]
    Handler {
        /// The handler key.
        handler: String,
        /// The handler's error.
        cause: BoxError,
    },

    /// The handler output could not be encoded.
    #[error("handler '{handler}' produced an unencodable result: {cause}")]
    Encode {
        /// The handler key.
        handler: String,
        /// The payload error.
        cause: PayloadError,
    },

    /// Publishing the handler result failed.
    #[error("failed to publish result to '{destination}': {cause}")]
    Publish {
        /// The destination name.
        destination: String,
        /// The broker error.
        cause: BrokerError,
    },

    /// The result slot was written twice or after it was consumed.
    #[error("result slot misuse: {0}")]
    ResultSlot(&'static str),
}

// =============================================================================
// Broker Errors
// =============================================================================

/// Errors that can occur in broker operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// A queue or topic name was empty.
    #[error("invalid destination name: {0:?}")]
    InvalidName(String),

    /// The named queue has not been declared.
    #[error("queue '{0}' does not exist")]
    QueueNotFound(String),

    /// The named topic has not been declared.
    #[error("topic '{0}' does not exist")]
    TopicNotFound(String),

    /// The subscription could not be established.
    #[error("subscription to '{queue}' failed: {reason}")]
    SubscriptionFailed {
        /// The queue being subscribed to.
        queue: String,
        /// Reason for failure.
        reason: String,
    },

    /// A publish was rejected.
    #[error("publish failed: {0}")]
    PublishFailed(String),

    /// The connection to the broker was lost.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The broker was closed.
    #[error("broker is closed")]
    Closed,
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Result type for payload conversions.
pub type PayloadResult<T> = Result<T, PayloadError>;

/// Result type for handler registration.
pub type ConfigurationResult<T> = Result<T, ConfigurationError>;
