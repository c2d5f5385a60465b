//! Binding metadata and handler descriptors.
//!
//! Applications describe where a handler listens and where its result goes
//! with a list of [`EventBinding`] entries. The routing resolver turns that
//! list into a [`HandlerDescriptor`] once, at registration time.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::foundation::payload::PayloadKind;

/// Identifies a handler type.
///
/// Every per-handler state (pipeline, descriptor, worker pool) is keyed by
/// this value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerKey(Arc<str>);

impl HandlerKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HandlerKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for HandlerKey {
    fn from(key: String) -> Self {
        Self(Arc::from(key))
    }
}

/// Direction of a binding entry relative to the handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    In,
    Out,
}

/// One declarative binding entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBinding {
    /// Queue or topic name.
    pub event_name: String,
    /// Broadcast to every consumer instead of competing for messages.
    #[serde(default)]
    pub allow_multiple_consumers: bool,
    #[serde(default)]
    pub direction: Direction,
}

impl EventBinding {
    /// An inbound work queue.
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            event_name: name.into(),
            allow_multiple_consumers: false,
            direction: Direction::In,
        }
    }

    /// An inbound broadcast topic.
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            event_name: name.into(),
            allow_multiple_consumers: true,
            direction: Direction::In,
        }
    }

    /// Turns this entry into an outbound binding.
    pub fn outbound(mut self) -> Self {
        self.direction = Direction::Out;
        self
    }
}

/// A resolved broker destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Binding {
    /// Point-to-point queue with competing consumers.
    Queue(String),
    /// Broadcast topic, one anonymous queue per consumer.
    Topic(String),
}

impl Binding {
    pub fn name(&self) -> &str {
        match self {
            Binding::Queue(name) | Binding::Topic(name) => name,
        }
    }

    pub fn is_topic(&self) -> bool {
        matches!(self, Binding::Topic(_))
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Binding::Queue(name) => write!(f, "queue:{name}"),
            Binding::Topic(name) => write!(f, "topic:{name}"),
        }
    }
}

/// Input and output kinds of a handler type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerShape {
    pub input: PayloadKind,
    /// `None` for handlers that produce no result.
    pub output: Option<PayloadKind>,
    /// Type name of the input, used in error messages.
    pub input_type: &'static str,
    pub output_type: Option<&'static str>,
}

impl HandlerShape {
    pub fn has_output(&self) -> bool {
        self.output.is_some()
    }
}

/// Static description of a registered handler type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerDescriptor {
    pub key: HandlerKey,
    pub shape: HandlerShape,
    pub inbound: Binding,
    pub outbound: Option<Binding>,
}
