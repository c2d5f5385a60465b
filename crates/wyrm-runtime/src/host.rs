//! Host lifecycle of one handler type.
//!
//! A [`HostLifecycle`] owns the worker pool of a handler type. All workers
//! share the descriptor, the pipeline and one shutdown token; each holds its
//! own broker subscription. For a queue binding the workers compete for
//! messages, for a topic binding each worker gets its own anonymous queue.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::future::join_all;
use futures::stream::FuturesUnordered;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use wyrm_core::{BoxedBroker, HandlerDescriptor, HandlerKey};
use wyrm_framework::Pipeline;

use crate::worker::{Worker, WorkerError, WorkerState};

/// Aggregate status of a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostStatus {
    /// Not started yet.
    Idle,
    /// All workers are receiving.
    Running,
    /// Every worker subscription ended normally.
    Completed,
    /// A worker subscription failed.
    Failed { worker: String, reason: String },
}

impl HostStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, HostStatus::Completed | HostStatus::Failed { .. })
    }
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("handler '{key}' failed to start worker {index}: {source}")]
    Start {
        key: String,
        index: usize,
        #[source]
        source: WorkerError,
    },

    #[error("handler '{0}' was already started")]
    AlreadyStarted(String),
}

/// Worker pool of one handler type.
pub struct HostLifecycle {
    descriptor: Arc<HandlerDescriptor>,
    pipeline: Pipeline,
    broker: BoxedBroker,
    instances: usize,
    workers: Vec<Worker>,
    shutdown: CancellationToken,
    status: watch::Sender<HostStatus>,
    started: bool,
}

impl HostLifecycle {
    /// Creates a host running `instances` workers. Values below 1 are
    /// raised to 1.
    pub fn new(
        descriptor: HandlerDescriptor,
        pipeline: Pipeline,
        broker: BoxedBroker,
        instances: usize,
    ) -> Self {
        let (status, _) = watch::channel(HostStatus::Idle);
        Self {
            descriptor: Arc::new(descriptor),
            pipeline,
            broker,
            instances: instances.max(1),
            workers: Vec::with_capacity(instances.max(1)),
            shutdown: CancellationToken::new(),
            status,
            started: false,
        }
    }

    pub fn key(&self) -> &HandlerKey {
        &self.descriptor.key
    }

    pub fn descriptor(&self) -> &HandlerDescriptor {
        &self.descriptor
    }

    pub fn instances(&self) -> usize {
        self.instances
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn status(&self) -> HostStatus {
        self.status.borrow().clone()
    }

    /// Subscribes to status changes.
    pub fn subscribe(&self) -> watch::Receiver<HostStatus> {
        self.status.subscribe()
    }

    /// Binds and starts every worker, one after another.
    ///
    /// Returns once all workers are receiving. If a worker fails to bind or
    /// start, later workers are not created and the error is returned. The
    /// failing worker and the ones already started are torn down first.
    pub async fn start(&mut self) -> Result<(), HostError> {
        if self.started {
            return Err(HostError::AlreadyStarted(self.key().to_string()));
        }
        self.started = true;

        for index in 0..self.instances {
            let mut worker = Worker::new(self.key().clone(), index, self.broker.clone());
            let launched = match worker.bind(&self.descriptor.inbound).await {
                Ok(()) => worker.start(self.pipeline.clone(), &self.shutdown).await,
                Err(e) => Err(e),
            };

            if let Err(source) = launched {
                error!(
                    handler = %self.key(),
                    worker = %worker.name(),
                    error = %source,
                    "Worker failed to start"
                );
                self.shutdown.cancel();
                worker.teardown().await;
                for started in &mut self.workers {
                    started.teardown().await;
                }
                self.status.send_replace(HostStatus::Failed {
                    worker: worker.name().to_string(),
                    reason: source.to_string(),
                });
                self.workers.push(worker);
                return Err(HostError::Start {
                    key: self.key().to_string(),
                    index,
                    source,
                });
            }
            self.workers.push(worker);
        }

        self.spawn_monitor();
        self.status.send_replace(HostStatus::Running);
        info!(
            handler = %self.key(),
            inbound = %self.descriptor.inbound,
            workers = self.workers.len(),
            "Host started"
        );
        Ok(())
    }

    fn spawn_monitor(&mut self) {
        let mut completions: FuturesUnordered<_> = self
            .workers
            .iter_mut()
            .filter_map(|w| {
                let name = w.name().to_string();
                w.take_completion().map(|rx| async move { (name, rx.await) })
            })
            .collect();
        let status = self.status.clone();
        let key = self.key().clone();

        tokio::spawn(async move {
            while let Some((worker, result)) = completions.next().await {
                let reason = match result {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => e.to_string(),
                    Err(_) => "subscription ended without a result".to_string(),
                };
                error!(handler = %key, worker = %worker, reason = %reason, "Worker failed");
                status.send_replace(HostStatus::Failed { worker, reason });
                return;
            }
            status.send_if_modified(|s| {
                if *s == HostStatus::Running {
                    *s = HostStatus::Completed;
                    true
                } else {
                    false
                }
            });
            debug!(handler = %key, "All worker subscriptions ended");
        });
    }

    /// Cancels shutdown and stops every worker concurrently.
    ///
    /// Returns when all workers are stopped or `timeout` elapsed, and
    /// reports whether everything drained.
    pub async fn stop(&mut self, timeout: Duration) -> bool {
        self.shutdown.cancel();

        let key = self.key().clone();
        let stops = self
            .workers
            .iter_mut()
            .filter(|w| w.state() != WorkerState::Stopped)
            .map(|w| w.stop(timeout));

        let drained = match tokio::time::timeout(timeout, join_all(stops)).await {
            Ok(results) => results.into_iter().fold(true, |all, result| match result {
                Ok(drained) => all && drained,
                Err(e) => {
                    warn!(handler = %key, error = %e, "Worker stop failed");
                    false
                }
            }),
            Err(_) => false,
        };

        info!(handler = %key, drained, "Host stopped");
        drained
    }

    /// Cancels shutdown and tears down every worker without waiting.
    pub async fn dispose(&mut self) {
        self.shutdown.cancel();
        for worker in &mut self.workers {
            worker.teardown().await;
        }
    }

    /// Waits until the host reaches [`HostStatus::Completed`] or
    /// [`HostStatus::Failed`].
    pub async fn wait(&self) -> HostStatus {
        let mut rx = self.status.subscribe();
        match rx.wait_for(HostStatus::is_terminal).await {
            Ok(status) => status.clone(),
            Err(_) => self.status(),
        }
    }
}

impl Drop for HostLifecycle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use tokio_test::{assert_err, assert_ok};
    use wyrm_core::{
        Binding, Broker, BrokerError, BrokerResult, DeliveryHandler, EventBinding, HandlerShape,
        HeaderMutator, Headers, MessageContext, PayloadKind, Subscription, SubscriptionId,
    };
    use wyrm_framework::{PipelineBuilder, call_next, from_fn, resolve};
    use wyrm_transport::InMemoryBroker;

    type Seen = Arc<Mutex<Vec<(String, Vec<u8>)>>>;

    fn recording_pipeline(seen: Seen) -> Pipeline {
        let mut builder = PipelineBuilder::new("record");
        builder
            .add(from_fn(move |ctx: Arc<MessageContext>, next| {
                let seen = seen.clone();
                async move {
                    seen.lock().push((ctx.queue().to_string(), ctx.body().to_vec()));
                    call_next(next, ctx).await
                }
            }))
            .unwrap();
        builder.build()
    }

    fn descriptor(bindings: &[EventBinding]) -> HandlerDescriptor {
        let shape = HandlerShape {
            input: PayloadKind::Bytes,
            output: None,
            input_type: "Vec<u8>",
            output_type: None,
        };
        resolve(&HandlerKey::new("recorder"), shape, bindings).unwrap()
    }

    async fn wait_len(seen: &Seen, expected: usize) {
        for _ in 0..400 {
            if seen.lock().len() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {expected} deliveries, saw {}", seen.lock().len());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn queue_work_is_distributed_without_duplicates() {
        let broker = Arc::new(InMemoryBroker::new());
        let seen: Seen = Arc::default();
        let mut host = HostLifecycle::new(
            descriptor(&[EventBinding::queue("jobs")]),
            recording_pipeline(seen.clone()),
            broker.clone(),
            3,
        );
        assert_ok!(host.start().await);
        assert_eq!(host.status(), HostStatus::Running);
        assert_eq!(host.workers().len(), 3);
        assert!(host.workers().iter().all(|w| w.queue() == Some("jobs")));

        for i in 0..60u32 {
            broker
                .send("jobs", i.to_be_bytes().to_vec(), Headers::new())
                .unwrap();
        }
        wait_len(&seen, 60).await;

        let bodies: HashSet<_> = seen.lock().iter().map(|(_, b)| b.clone()).collect();
        assert_eq!(bodies.len(), 60);
        assert_eq!(seen.lock().len(), 60);

        assert!(host.stop(Duration::from_secs(1)).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn topic_message_reaches_every_instance() {
        let broker = Arc::new(InMemoryBroker::new());
        let seen: Seen = Arc::default();
        let mut host = HostLifecycle::new(
            descriptor(&[EventBinding::topic("announcements")]),
            recording_pipeline(seen.clone()),
            broker.clone(),
            3,
        );
        host.start().await.unwrap();

        let queues: HashSet<_> = host
            .workers()
            .iter()
            .filter_map(|w| w.queue().map(str::to_string))
            .collect();
        assert_eq!(queues.len(), 3);
        assert_eq!(broker.bound_queues("announcements").len(), 3);

        broker
            .publish(
                &Binding::Topic("announcements".into()),
                b"hello".to_vec(),
                Box::new(|_| {}),
            )
            .await
            .unwrap();
        wait_len(&seen, 3).await;

        let receivers: HashSet<_> = seen.lock().iter().map(|(q, _)| q.clone()).collect();
        assert_eq!(receivers, queues);

        assert!(host.stop(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn stop_returns_within_timeout_and_halts_delivery() {
        let broker = Arc::new(InMemoryBroker::new());
        let handled = Arc::new(AtomicUsize::new(0));
        let mut builder = PipelineBuilder::new("slow");
        builder
            .add(from_fn({
                let handled = handled.clone();
                move |ctx: Arc<MessageContext>, _next| {
                    let handled = handled.clone();
                    async move {
                        handled.fetch_add(1, Ordering::SeqCst);
                        if ctx.body() == b"slow" {
                            tokio::time::sleep(Duration::from_secs(30)).await;
                        }
                        Ok(())
                    }
                }
            }))
            .unwrap();

        let mut host = HostLifecycle::new(
            descriptor(&[EventBinding::queue("jobs")]),
            builder.build(),
            broker.clone(),
            1,
        );
        host.start().await.unwrap();
        broker.send("jobs", b"slow".to_vec(), Headers::new()).unwrap();
        for _ in 0..200 {
            if handled.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let started = std::time::Instant::now();
        let drained = host.stop(Duration::from_millis(100)).await;
        assert!(!drained);
        assert!(started.elapsed() < Duration::from_secs(5));

        broker.send("jobs", b"late".to_vec(), Headers::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handled.load(Ordering::SeqCst), 1);
        assert_eq!(broker.queue_len("jobs"), Some(1));
    }

    #[tokio::test]
    async fn completes_after_stop() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut host = HostLifecycle::new(
            descriptor(&[EventBinding::queue("jobs")]),
            recording_pipeline(Arc::default()),
            broker,
            2,
        );
        host.start().await.unwrap();
        assert!(host.stop(Duration::from_secs(1)).await);

        let status = tokio::time::timeout(Duration::from_secs(1), host.wait())
            .await
            .unwrap();
        assert_eq!(status, HostStatus::Completed);
    }

    #[tokio::test]
    async fn broker_failure_marks_host_failed() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut host = HostLifecycle::new(
            descriptor(&[EventBinding::queue("jobs")]),
            recording_pipeline(Arc::default()),
            broker.clone(),
            2,
        );
        host.start().await.unwrap();

        broker.disconnect("connection reset");
        let status = tokio::time::timeout(Duration::from_secs(1), host.wait())
            .await
            .unwrap();
        match status {
            HostStatus::Failed { reason, .. } => assert!(reason.contains("connection reset")),
            other => panic!("unexpected status: {other:?}"),
        }
    }

    /// Accepts a fixed number of subscriptions, then refuses.
    struct LimitedBroker {
        inner: InMemoryBroker,
        remaining: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Broker for LimitedBroker {
        async fn ensure_queue(&self, name: &str) -> BrokerResult<()> {
            self.inner.ensure_queue(name).await
        }

        async fn ensure_topic(&self, name: &str) -> BrokerResult<()> {
            self.inner.ensure_topic(name).await
        }

        async fn create_anonymous_bound_queue(&self, topic: &str) -> BrokerResult<String> {
            self.inner.create_anonymous_bound_queue(topic).await
        }

        async fn receive(
            &self,
            queue: &str,
            on_message: DeliveryHandler,
            cancel: CancellationToken,
        ) -> BrokerResult<Subscription> {
            let granted = self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if !granted {
                return Err(BrokerError::SubscriptionFailed {
                    queue: queue.to_string(),
                    reason: "limit reached".into(),
                });
            }
            self.inner.receive(queue, on_message, cancel).await
        }

        async fn stop_receiving(&self, subscription: SubscriptionId) -> BrokerResult<()> {
            self.inner.stop_receiving(subscription).await
        }

        async fn release_anonymous_queue(&self, queue: &str) -> BrokerResult<()> {
            self.inner.release_anonymous_queue(queue).await
        }

        async fn publish(
            &self,
            destination: &Binding,
            body: Vec<u8>,
            headers: HeaderMutator,
        ) -> BrokerResult<()> {
            self.inner.publish(destination, body, headers).await
        }
    }

    #[tokio::test]
    async fn start_failure_tears_down_started_workers() {
        let memory = InMemoryBroker::new();
        let broker = Arc::new(LimitedBroker {
            inner: memory.clone(),
            remaining: AtomicUsize::new(2),
        });

        let mut host = HostLifecycle::new(
            descriptor(&[EventBinding::topic("events")]),
            recording_pipeline(Arc::default()),
            broker,
            4,
        );

        let err = host.start().await.unwrap_err();
        assert!(matches!(err, HostError::Start { index: 2, .. }));
        assert!(matches!(host.status(), HostStatus::Failed { .. }));
        assert!(
            host.workers()
                .iter()
                .all(|w| w.state() == WorkerState::Stopped)
        );

        assert_eq!(host.workers().len(), 3);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(memory.subscription_count(), 0);
        assert!(memory.bound_queues("events").is_empty());

        memory
            .publish(&Binding::Topic("events".into()), b"late".to_vec(), Box::new(|_| {}))
            .await
            .unwrap();
        assert!(memory.queue_names().is_empty());
        assert_err!(host.start().await);
    }

    #[tokio::test]
    async fn instances_are_at_least_one() {
        let host = HostLifecycle::new(
            descriptor(&[EventBinding::queue("jobs")]),
            recording_pipeline(Arc::default()),
            Arc::new(InMemoryBroker::new()),
            0,
        );
        assert_eq!(host.instances(), 1);
        assert_eq!(host.status(), HostStatus::Idle);
    }
}
