//! In-process broker.
//!
//! [`InMemoryBroker`] implements the [`Broker`] trait on top of in-memory
//! queues. It offers the same topology model as an AMQP broker:
//!
//! - **Queues** are point-to-point. Every message is handed to exactly one of
//!   the queue's consumers.
//! - **Topics** fan out. Every message is copied to each queue bound to the
//!   topic. [`create_anonymous_bound_queue`](Broker::create_anonymous_bound_queue)
//!   creates such a queue, exclusive to one consumer and deleted when that
//!   consumer stops.
//!
//! Each subscription runs one consumer task that invokes the delivery
//! callback for up to `consumer_concurrency` messages at a time.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, Semaphore, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use wyrm_core::{
    Binding, Broker, BrokerError, BrokerResult, Delivery, DeliveryHandler, HeaderMutator, Headers,
    Subscription, SubscriptionId,
};

// =============================================================================
// Configuration
// =============================================================================

/// Settings of an [`InMemoryBroker`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InMemoryConfig {
    /// Maximum number of concurrent callback invocations per subscription.
    pub consumer_concurrency: usize,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            consumer_concurrency: 1,
        }
    }
}

// =============================================================================
// Queue state
// =============================================================================

struct QueueState {
    messages: Mutex<VecDeque<Delivery>>,
    available: Notify,
    /// Anonymous queues belong to the topic they are bound to.
    bound_topic: Option<String>,
}

impl QueueState {
    fn new(bound_topic: Option<String>) -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            bound_topic,
        }
    }

    fn push(&self, delivery: Delivery) {
        self.messages.lock().push_back(delivery);
        self.available.notify_one();
    }

    /// Puts back a message that was taken but never delivered.
    fn push_front(&self, delivery: Delivery) {
        self.messages.lock().push_front(delivery);
        self.available.notify_one();
    }

    async fn pop(&self) -> Delivery {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.messages.lock().pop_front() {
                return delivery;
            }
            notified.await;
        }
    }
}

struct SubscriptionEntry {
    queue: String,
    /// `true` once the subscription is stopped. Checked under the lock
    /// before every callback invocation.
    stopped: Arc<Mutex<bool>>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Topology {
    queues: HashMap<String, Arc<QueueState>>,
    /// Topic name to the names of its bound queues.
    topics: HashMap<String, Vec<String>>,
}

struct Inner {
    config: InMemoryConfig,
    topology: RwLock<Topology>,
    subscriptions: Mutex<HashMap<SubscriptionId, SubscriptionEntry>>,
    next_subscription: AtomicU64,
    next_anonymous: AtomicU64,
    /// Set once the broker was disconnected.
    failure: RwLock<Option<String>>,
}

impl Inner {
    fn check_open(&self) -> BrokerResult<()> {
        match &*self.failure.read() {
            Some(reason) => Err(BrokerError::ConnectionLost(reason.clone())),
            None => Ok(()),
        }
    }

    fn queue(&self, name: &str) -> BrokerResult<Arc<QueueState>> {
        self.topology
            .read()
            .queues
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))
    }

    fn delete_anonymous(&self, name: &str) {
        let mut topology = self.topology.write();
        let Some(state) = topology.queues.get(name) else {
            return;
        };
        let Some(topic) = state.bound_topic.clone() else {
            return;
        };
        topology.queues.remove(name);
        if let Some(bound) = topology.topics.get_mut(&topic) {
            bound.retain(|q| q != name);
        }
        debug!(queue = name, topic = %topic, "Deleted anonymous queue");
    }
}

fn validate_name(name: &str) -> BrokerResult<()> {
    if name.trim().is_empty() {
        return Err(BrokerError::InvalidName(name.to_string()));
    }
    Ok(())
}

// =============================================================================
// InMemoryBroker
// =============================================================================

/// A process-local [`Broker`].
///
/// Cloning is cheap; clones share the same queues and topics.
///
/// # Example
///
/// ```rust,ignore
/// let broker = InMemoryBroker::new();
/// broker.ensure_queue("orders").await?;
/// broker.send("orders", b"{}".to_vec(), Headers::new())?;
/// assert_eq!(broker.queue_len("orders"), Some(1));
/// ```
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_config(InMemoryConfig::default())
    }

    pub fn with_config(config: InMemoryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                topology: RwLock::new(Topology::default()),
                subscriptions: Mutex::new(HashMap::new()),
                next_subscription: AtomicU64::new(1),
                next_anonymous: AtomicU64::new(1),
                failure: RwLock::new(None),
            }),
        }
    }

    pub fn config(&self) -> &InMemoryConfig {
        &self.inner.config
    }

    /// Enqueues a message directly on a declared queue.
    pub fn send(&self, queue: &str, body: Vec<u8>, headers: Headers) -> BrokerResult<()> {
        self.deliver(queue, Delivery::new(body).with_headers(headers))
    }

    /// Enqueues a prepared delivery on a declared queue.
    pub fn deliver(&self, queue: &str, delivery: Delivery) -> BrokerResult<()> {
        self.inner.check_open()?;
        self.inner.queue(queue)?.push(delivery);
        Ok(())
    }

    /// Number of messages waiting on `queue`, or `None` if it does not exist.
    pub fn queue_len(&self, queue: &str) -> Option<usize> {
        self.inner
            .topology
            .read()
            .queues
            .get(queue)
            .map(|state| state.messages.lock().len())
    }

    /// Removes and returns every message waiting on `queue`.
    pub fn drain(&self, queue: &str) -> Vec<Delivery> {
        match self.inner.queue(queue) {
            Ok(state) => state.messages.lock().drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.topology.read().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.inner.topology.read().topics.contains_key(topic)
    }

    /// Queues currently bound to `topic`.
    pub fn bound_queues(&self, topic: &str) -> Vec<String> {
        self.inner
            .topology
            .read()
            .topics
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of active subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.lock().len()
    }

    /// Simulates a lost connection.
    ///
    /// Every active subscription ends with [`BrokerError::ConnectionLost`]
    /// and further operations fail.
    pub fn disconnect(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(reason = %reason, "In-memory broker disconnected");
        *self.inner.failure.write() = Some(reason);

        let entries: Vec<_> = self.inner.subscriptions.lock().drain().collect();
        for (_, entry) in entries {
            *entry.stopped.lock() = true;
            entry.cancel.cancel();
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn ensure_queue(&self, name: &str) -> BrokerResult<()> {
        validate_name(name)?;
        self.inner.check_open()?;
        let mut topology = self.inner.topology.write();
        if !topology.queues.contains_key(name) {
            topology
                .queues
                .insert(name.to_string(), Arc::new(QueueState::new(None)));
            debug!(queue = name, "Declared queue");
        }
        Ok(())
    }

    async fn ensure_topic(&self, name: &str) -> BrokerResult<()> {
        validate_name(name)?;
        self.inner.check_open()?;
        let mut topology = self.inner.topology.write();
        if !topology.topics.contains_key(name) {
            topology.topics.insert(name.to_string(), Vec::new());
            debug!(topic = name, "Declared topic");
        }
        Ok(())
    }

    async fn create_anonymous_bound_queue(&self, topic: &str) -> BrokerResult<String> {
        self.inner.check_open()?;
        let mut topology = self.inner.topology.write();
        if !topology.topics.contains_key(topic) {
            return Err(BrokerError::TopicNotFound(topic.to_string()));
        }

        let n = self.inner.next_anonymous.fetch_add(1, Ordering::Relaxed);
        let name = format!("{topic}.anon-{n}");
        topology.queues.insert(
            name.clone(),
            Arc::new(QueueState::new(Some(topic.to_string()))),
        );
        if let Some(bound) = topology.topics.get_mut(topic) {
            bound.push(name.clone());
        }

        debug!(topic, queue = %name, "Created anonymous bound queue");
        Ok(name)
    }

    async fn receive(
        &self,
        queue: &str,
        on_message: DeliveryHandler,
        cancel: CancellationToken,
    ) -> BrokerResult<Subscription> {
        self.inner.check_open()?;
        let state = self.inner.queue(queue)?;

        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        let stopped = Arc::new(Mutex::new(false));
        let cancel = cancel.child_token();
        let (closed_tx, closed_rx) = oneshot::channel();

        self.inner.subscriptions.lock().insert(
            id,
            SubscriptionEntry {
                queue: queue.to_string(),
                stopped: stopped.clone(),
                cancel: cancel.clone(),
            },
        );

        let consumer = Consumer {
            id,
            queue: queue.to_string(),
            state,
            on_message,
            stopped,
            cancel,
            permits: Arc::new(Semaphore::new(self.inner.config.consumer_concurrency.max(1))),
            inner: self.inner.clone(),
        };
        tokio::spawn(async move {
            let result = consumer.run().await;
            let _ = closed_tx.send(result);
        });

        debug!(queue, subscription = %id, "Subscription started");
        Ok(Subscription {
            id,
            queue: queue.to_string(),
            closed: closed_rx,
        })
    }

    async fn stop_receiving(&self, subscription: SubscriptionId) -> BrokerResult<()> {
        let Some(entry) = self.inner.subscriptions.lock().remove(&subscription) else {
            trace!(subscription = %subscription, "Stop for unknown subscription ignored");
            return Ok(());
        };

        *entry.stopped.lock() = true;
        entry.cancel.cancel();
        debug!(queue = %entry.queue, subscription = %subscription, "Subscription stopped");
        Ok(())
    }

    async fn release_anonymous_queue(&self, queue: &str) -> BrokerResult<()> {
        let consumed = self
            .inner
            .subscriptions
            .lock()
            .values()
            .any(|entry| entry.queue == queue);
        if !consumed {
            self.inner.delete_anonymous(queue);
        }
        Ok(())
    }

    async fn publish(
        &self,
        destination: &Binding,
        body: Vec<u8>,
        headers: HeaderMutator,
    ) -> BrokerResult<()> {
        self.inner.check_open()?;

        let mut outgoing = Headers::new();
        headers(&mut outgoing);
        let delivery = Delivery::new(body).with_headers(outgoing);

        match destination {
            Binding::Queue(name) => {
                self.inner.queue(name)?.push(delivery);
            }
            Binding::Topic(name) => {
                let targets: Vec<Arc<QueueState>> = {
                    let topology = self.inner.topology.read();
                    let bound = topology
                        .topics
                        .get(name)
                        .ok_or_else(|| BrokerError::TopicNotFound(name.clone()))?;
                    bound
                        .iter()
                        .filter_map(|q| topology.queues.get(q).cloned())
                        .collect()
                };
                trace!(topic = %name, targets = targets.len(), "Fanning out message");
                for target in targets {
                    target.push(delivery.clone());
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Consumer loop
// =============================================================================

struct Consumer {
    id: SubscriptionId,
    queue: String,
    state: Arc<QueueState>,
    on_message: DeliveryHandler,
    stopped: Arc<Mutex<bool>>,
    cancel: CancellationToken,
    permits: Arc<Semaphore>,
    inner: Arc<Inner>,
}

impl Consumer {
    async fn run(self) -> BrokerResult<()> {
        loop {
            let permit = tokio::select! {
                _ = self.cancel.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let delivery = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                delivery = self.state.pop() => delivery,
            };

            let invocation = {
                let stopped = self.stopped.lock();
                if *stopped || self.cancel.is_cancelled() {
                    self.state.push_front(delivery);
                    break;
                }
                (self.on_message)(delivery)
            };

            let queue = self.queue.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let outcome = invocation.await;
                trace!(queue = %queue, ?outcome, "Delivery processed");
            });
        }

        // Release the subscription slot when `cancel` fired without a stop.
        self.inner.subscriptions.lock().remove(&self.id);
        if self.state.bound_topic.is_some() {
            self.inner.delete_anonymous(&self.queue);
        }

        match &*self.inner.failure.read() {
            Some(reason) => Err(BrokerError::ConnectionLost(reason.clone())),
            None => Ok(()),
        }
    }
}
