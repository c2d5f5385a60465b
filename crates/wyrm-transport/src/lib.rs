//! # Wyrm Transport
//!
//! Broker implementations for Wyrm.
//!
//! Currently ships the [`InMemoryBroker`], a process-local broker with queue
//! and topic semantics. It backs tests, demos and single-process
//! deployments; networked brokers implement the same
//! [`Broker`](wyrm_core::Broker) trait.

pub mod memory;

pub use memory::{InMemoryBroker, InMemoryConfig};
