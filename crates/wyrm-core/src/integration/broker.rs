//! Broker abstraction.
//!
//! The [`Broker`] trait is the only seam between the dispatch pipeline and
//! a message transport. Implementations must make topology declarations
//! idempotent and must guarantee that once
//! [`stop_receiving`](Broker::stop_receiving) returns, no new callback
//! invocation starts for that subscription.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::foundation::error::BrokerResult;
use crate::foundation::headers::{Delivery, Headers};
use crate::integration::descriptor::Binding;

/// What the receive callback reports back to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The message was processed by the pipeline.
    Handled,
    /// Processing failed. The message is still considered consumed.
    Failed,
}

/// Callback invoked for every delivery on a subscription.
pub type DeliveryHandler = Arc<dyn Fn(Delivery) -> BoxFuture<'static, DeliveryOutcome> + Send + Sync>;

/// Adds or merges headers on an outgoing message before it is sent.
pub type HeaderMutator = Box<dyn FnOnce(&mut Headers) + Send>;

/// Identifies an active subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Handle returned by [`Broker::receive`].
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    /// The queue being consumed.
    pub queue: String,
    /// Resolves when delivery ends: `Ok` after a regular stop, `Err` when
    /// the broker failed underneath the subscription.
    pub closed: oneshot::Receiver<BrokerResult<()>>,
}

/// A message broker offering queues and topics.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Declares a queue. Declaring an existing queue is a no-op.
    async fn ensure_queue(&self, name: &str) -> BrokerResult<()>;

    /// Declares a topic. Declaring an existing topic is a no-op.
    async fn ensure_topic(&self, name: &str) -> BrokerResult<()>;

    /// Creates a new exclusive queue bound to `topic` and returns its name.
    async fn create_anonymous_bound_queue(&self, topic: &str) -> BrokerResult<String>;

    /// Starts delivering messages from `queue` to `on_message`.
    ///
    /// Delivery continues until [`stop_receiving`](Self::stop_receiving) is
    /// called with the returned id or `cancel` fires.
    async fn receive(
        &self,
        queue: &str,
        on_message: DeliveryHandler,
        cancel: CancellationToken,
    ) -> BrokerResult<Subscription>;

    /// Stops a subscription. Unknown or already stopped ids are ignored.
    async fn stop_receiving(&self, subscription: SubscriptionId) -> BrokerResult<()>;

    /// Deletes an anonymous queue that never got a consumer.
    ///
    /// Named queues and queues with an active consumer are left alone.
    /// Brokers that clean up anonymous queues server-side keep the default
    /// no-op.
    async fn release_anonymous_queue(&self, _queue: &str) -> BrokerResult<()> {
        Ok(())
    }

    /// Publishes `body` to `destination`.
    async fn publish(
        &self,
        destination: &Binding,
        body: Vec<u8>,
        headers: HeaderMutator,
    ) -> BrokerResult<()>;
}

/// A shared broker handle.
pub type BoxedBroker = Arc<dyn Broker>;

/// Declares the topology a binding needs as a publish destination.
pub async fn ensure_destination(broker: &dyn Broker, binding: &Binding) -> BrokerResult<()> {
    match binding {
        Binding::Queue(name) => broker.ensure_queue(name).await,
        Binding::Topic(name) => broker.ensure_topic(name).await,
    }
}
