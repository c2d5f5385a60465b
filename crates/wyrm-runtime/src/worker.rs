//! A single listener instance.
//!
//! A [`Worker`] owns one broker subscription for one handler type and moves
//! through a fixed life cycle:
//!
//! ```text
//! Idle ──bind──▶ Bound ──start──▶ Running ──stop──▶ Stopped
//! ```
//!
//! `Stopped` is terminal. Every delivery received while running is turned
//! into a [`MessageContext`] and run through the handler's [`Pipeline`].
//! Errors and panics escaping the pipeline are logged and never stop the
//! worker.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, debug_span, error, trace, warn};

use wyrm_core::{
    Binding, BoxedBroker, BrokerError, BrokerResult, Delivery, DeliveryHandler, DeliveryOutcome,
    HandlerKey, MessageContext, MessageSource, SubscriptionId,
};
use wyrm_framework::Pipeline;

/// Life-cycle state of a [`Worker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Bound,
    Running,
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Idle => "idle",
            WorkerState::Bound => "bound",
            WorkerState::Running => "running",
            WorkerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Errors raised by worker transitions.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The requested transition is not valid from the current state.
    #[error("worker '{worker}' cannot {operation} while {state}")]
    InvalidState {
        worker: String,
        operation: &'static str,
        state: WorkerState,
    },

    /// The broker rejected a topology or subscription request.
    #[error("worker '{worker}': {source}")]
    Broker {
        worker: String,
        #[source]
        source: BrokerError,
    },
}

/// One listener instance of a handler type.
pub struct Worker {
    name: String,
    key: HandlerKey,
    broker: BoxedBroker,
    state: WorkerState,
    binding: Option<Binding>,
    queue: Option<String>,
    subscription: Option<SubscriptionId>,
    completion: Option<oneshot::Receiver<BrokerResult<()>>>,
    in_flight: TaskTracker,
}

impl Worker {
    /// Creates instance `index` of handler type `key`.
    pub fn new(key: HandlerKey, index: usize, broker: BoxedBroker) -> Self {
        Self {
            name: format!("{key}#{index}"),
            key,
            broker,
            state: WorkerState::Idle,
            binding: None,
            queue: None,
            subscription: None,
            completion: None,
            in_flight: TaskTracker::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// The queue this worker consumes, once bound.
    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    /// Number of deliveries currently being processed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn invalid(&self, operation: &'static str) -> WorkerError {
        WorkerError::InvalidState {
            worker: self.name.clone(),
            operation,
            state: self.state,
        }
    }

    fn broker_error(&self, source: BrokerError) -> WorkerError {
        WorkerError::Broker {
            worker: self.name.clone(),
            source,
        }
    }

    /// Declares the topology of `binding` and remembers the queue to consume.
    ///
    /// A queue binding is consumed directly. A topic binding gets a fresh
    /// anonymous queue bound to the topic, exclusive to this worker.
    pub async fn bind(&mut self, binding: &Binding) -> Result<(), WorkerError> {
        if self.state != WorkerState::Idle {
            return Err(self.invalid("bind"));
        }

        let queue = match binding {
            Binding::Queue(name) => {
                self.broker
                    .ensure_queue(name)
                    .await
                    .map_err(|e| self.broker_error(e))?;
                name.clone()
            }
            Binding::Topic(topic) => {
                self.broker
                    .ensure_topic(topic)
                    .await
                    .map_err(|e| self.broker_error(e))?;
                self.broker
                    .create_anonymous_bound_queue(topic)
                    .await
                    .map_err(|e| self.broker_error(e))?
            }
        };

        debug!(worker = %self.name, binding = %binding, queue = %queue, "Worker bound");
        self.binding = Some(binding.clone());
        self.queue = Some(queue);
        self.state = WorkerState::Bound;
        Ok(())
    }

    /// Registers the receive callback and starts processing deliveries.
    ///
    /// Each message context gets a cancellation signal derived from
    /// `shutdown`.
    pub async fn start(
        &mut self,
        pipeline: Pipeline,
        shutdown: &CancellationToken,
    ) -> Result<(), WorkerError> {
        if self.state != WorkerState::Bound {
            return Err(self.invalid("start"));
        }
        let (Some(binding), Some(queue)) = (self.binding.clone(), self.queue.clone()) else {
            return Err(self.invalid("start"));
        };

        let on_message = message_callback(
            self.name.clone(),
            self.key.clone(),
            binding,
            queue.clone(),
            pipeline,
            shutdown.clone(),
            self.in_flight.clone(),
        );

        let subscription = self
            .broker
            .receive(&queue, on_message, shutdown.clone())
            .await
            .map_err(|e| self.broker_error(e))?;

        debug!(
            worker = %self.name,
            queue = %queue,
            subscription = %subscription.id,
            "Worker started"
        );
        self.subscription = Some(subscription.id);
        self.completion = Some(subscription.closed);
        self.state = WorkerState::Running;
        Ok(())
    }

    /// Takes the receiver that resolves when the subscription ends.
    ///
    /// Yields `Ok` after a regular stop and `Err` when the broker failed.
    pub fn take_completion(&mut self) -> Option<oneshot::Receiver<BrokerResult<()>>> {
        self.completion.take()
    }

    /// Stops receiving and waits, at most `timeout`, for in-flight messages.
    ///
    /// Returns whether every in-flight invocation finished in time. Idle
    /// and bound workers stop immediately.
    pub async fn stop(&mut self, timeout: Duration) -> Result<bool, WorkerError> {
        match self.state {
            WorkerState::Stopped => return Err(self.invalid("stop")),
            WorkerState::Idle | WorkerState::Bound => {
                self.release_unconsumed_queue().await;
                self.state = WorkerState::Stopped;
                return Ok(true);
            }
            WorkerState::Running => {}
        }

        if let Some(id) = self.subscription.take()
            && let Err(e) = self.broker.stop_receiving(id).await
        {
            warn!(worker = %self.name, error = %e, "Failed to stop subscription");
        }
        self.state = WorkerState::Stopped;

        self.in_flight.close();
        let drained = tokio::time::timeout(timeout, self.in_flight.wait())
            .await
            .is_ok();

        if drained {
            debug!(worker = %self.name, "Worker stopped");
        } else {
            warn!(
                worker = %self.name,
                in_flight = self.in_flight.len(),
                timeout_ms = timeout.as_millis() as u64,
                "Worker stopped before in-flight messages drained"
            );
        }
        Ok(drained)
    }

    /// Stops receiving without waiting for in-flight messages.
    ///
    /// Failures are logged and otherwise ignored.
    pub async fn teardown(&mut self) {
        self.release_unconsumed_queue().await;
        if let Some(id) = self.subscription.take()
            && let Err(e) = self.broker.stop_receiving(id).await
        {
            trace!(worker = %self.name, error = %e, "Teardown failed to stop subscription");
        }
        self.in_flight.close();
        self.state = WorkerState::Stopped;
    }

    /// Releases the anonymous queue of a worker that was bound but never
    /// started.
    async fn release_unconsumed_queue(&self) {
        let anonymous = self.binding.as_ref().is_some_and(Binding::is_topic);
        if self.state != WorkerState::Bound || !anonymous {
            return;
        }
        let Some(queue) = self.queue.as_deref() else {
            return;
        };
        if let Err(e) = self.broker.release_anonymous_queue(queue).await {
            trace!(worker = %self.name, queue, error = %e, "Failed to release anonymous queue");
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("queue", &self.queue)
            .finish()
    }
}

fn message_callback(
    worker: String,
    key: HandlerKey,
    binding: Binding,
    queue: String,
    pipeline: Pipeline,
    shutdown: CancellationToken,
    in_flight: TaskTracker,
) -> DeliveryHandler {
    Arc::new(move |delivery: Delivery| {
        let token = in_flight.token();
        let ctx = Arc::new(MessageContext::new(
            delivery,
            MessageSource::new(queue.clone(), key.clone()).with_binding(binding.clone()),
            shutdown.child_token(),
        ));
        let message_id = ctx.message_id();
        let span = debug_span!(
            "dispatch",
            handler = %key,
            binding = %binding,
            queue = %queue,
            message_id
        );
        let pipeline = pipeline.clone();
        let worker = worker.clone();

        async move {
            let _token = token;
            match AssertUnwindSafe(pipeline.invoke(ctx)).catch_unwind().await {
                Ok(Ok(())) => {
                    trace!(worker = %worker, "Message handled");
                    DeliveryOutcome::Handled
                }
                Ok(Err(e)) => {
                    warn!(worker = %worker, error = %e, "Message processing failed");
                    DeliveryOutcome::Failed
                }
                Err(panic) => {
                    error!(
                        worker = %worker,
                        panic = panic_message(panic.as_ref()),
                        "Pipeline panicked while processing message"
                    );
                    DeliveryOutcome::Failed
                }
            }
        }
        .instrument(span)
        .boxed()
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
