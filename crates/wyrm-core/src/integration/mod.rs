//! Integration layer - binding metadata and the broker seam.

pub mod broker;
pub mod descriptor;

pub use broker::{
    BoxedBroker, Broker, DeliveryHandler, DeliveryOutcome, HeaderMutator, Subscription,
    SubscriptionId, ensure_destination,
};
pub use descriptor::{Binding, Direction, EventBinding, HandlerDescriptor, HandlerKey, HandlerShape};
