//! Built-in dispatch behaviors.
//!
//! [`InvokeHandlerLayer`] decodes the inbound body, calls the handler and
//! stores its output in the context's result slot. [`PublishResultLayer`]
//! runs inside it and publishes that result to the handler's outbound
//! binding. Around them the application may place its own behaviors:
//!
//! ```text
//! before... ─▶ InvokeHandler ─▶ PublishResult ─▶ after... ─▶ terminal
//! ```

use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tower::{BoxError, Layer, Service, ServiceExt};
use tracing::{debug, error};

use wyrm_core::{Binding, BoxedBroker, DispatchError, HandlerDescriptor, Headers, MessageContext};

use crate::handler::BoxedHandler;
use crate::pipeline::{Behavior, Pipeline, PipelineBuilder};

// ============================================================================
// InvokeHandler
// ============================================================================

/// Calls the handler of a pipeline.
#[derive(Clone)]
pub struct InvokeHandlerLayer {
    handler: BoxedHandler,
}

impl InvokeHandlerLayer {
    pub fn new(handler: BoxedHandler) -> Self {
        Self { handler }
    }
}

impl<S> Layer<S> for InvokeHandlerLayer {
    type Service = InvokeHandlerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InvokeHandlerService {
            handler: self.handler.clone(),
            inner,
        }
    }
}

pub struct InvokeHandlerService<S> {
    handler: BoxedHandler,
    inner: S,
}

impl<S: Clone> Clone for InvokeHandlerService<S> {
    fn clone(&self) -> Self {
        InvokeHandlerService {
            handler: self.handler.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<S> Service<Arc<MessageContext>> for InvokeHandlerService<S>
where
    S: Service<Arc<MessageContext>, Response = (), Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = ();
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<(), BoxError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, ctx: Arc<MessageContext>) -> Self::Future {
        let handler = self.handler.clone();
        let inner = self.inner.clone();
        Box::pin(async move {
            match handler.invoke(ctx.clone()).await {
                Ok(Some(payload)) => ctx.set_result(payload)?,
                Ok(None) => {}
                Err(err) => {
                    error!(
                        handler = %ctx.handler_key(),
                        source = ctx.source_name(),
                        queue = ctx.queue(),
                        message_id = ctx.message_id(),
                        error = %err,
                        "Handler invocation failed"
                    );
                    return Err(err.into());
                }
            }
            inner.oneshot(ctx).await
        })
    }
}

// ============================================================================
// PublishResult
// ============================================================================

/// Publishes the handler result to a fixed destination.
#[derive(Clone)]
pub struct PublishResultLayer {
    broker: BoxedBroker,
    destination: Binding,
}

impl PublishResultLayer {
    pub fn new(broker: BoxedBroker, destination: Binding) -> Self {
        Self {
            broker,
            destination,
        }
    }

    pub fn destination(&self) -> &Binding {
        &self.destination
    }
}

impl<S> Layer<S> for PublishResultLayer {
    type Service = PublishResultService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        PublishResultService {
            broker: self.broker.clone(),
            destination: self.destination.clone(),
            inner,
        }
    }
}

pub struct PublishResultService<S> {
    broker: BoxedBroker,
    destination: Binding,
    inner: S,
}

impl<S: Clone> Clone for PublishResultService<S> {
    fn clone(&self) -> Self {
        PublishResultService {
            broker: self.broker.clone(),
            destination: self.destination.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<S> Service<Arc<MessageContext>> for PublishResultService<S>
where
    S: Service<Arc<MessageContext>, Response = (), Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = ();
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<(), BoxError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, ctx: Arc<MessageContext>) -> Self::Future {
        let broker = self.broker.clone();
        let destination = self.destination.clone();
        let inner = self.inner.clone();
        Box::pin(async move {
            if let Some(payload) = ctx.take_result() {
                let body = payload.encode().map_err(|cause| DispatchError::Encode {
                    handler: ctx.handler_key().to_string(),
                    cause,
                })?;
                let size = body.len();

                let inbound = ctx.headers().clone();
                let mutator = Box::new(move |headers: &mut Headers| {
                    headers.merge_missing(&inbound);
                });

                if let Err(cause) = broker.publish(&destination, body, mutator).await {
                    error!(
                        handler = %ctx.handler_key(),
                        destination = %destination,
                        message_id = ctx.message_id(),
                        error = %cause,
                        "Failed to publish handler result"
                    );
                    return Err(DispatchError::Publish {
                        destination: destination.to_string(),
                        cause,
                    }
                    .into());
                }

                debug!(
                    handler = %ctx.handler_key(),
                    destination = %destination,
                    message_id = ctx.message_id(),
                    size,
                    "Published handler result"
                );
            }
            inner.oneshot(ctx).await
        })
    }
}

// ============================================================================
// Handler pipelines
// ============================================================================

/// Builds the pipeline of a handler type:
/// `before ++ [InvokeHandler, PublishResult?] ++ after`.
///
/// Publish Result is only added when the descriptor has an outbound binding.
pub fn handler_pipeline(
    descriptor: &HandlerDescriptor,
    handler: BoxedHandler,
    broker: BoxedBroker,
    before: &[Arc<dyn Behavior>],
    after: &[Arc<dyn Behavior>],
) -> Result<Pipeline, wyrm_core::ConfigurationError> {
    let mut builder = PipelineBuilder::new(descriptor.key.as_str());
    builder.extend(before.iter().cloned())?;
    builder.add(InvokeHandlerLayer::new(handler))?;
    if let Some(destination) = &descriptor.outbound {
        builder.add(PublishResultLayer::new(broker, destination.clone()))?;
    }
    builder.extend(after.iter().cloned())?;
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use tokio_test::{assert_err, assert_ok};
    use tokio_util::sync::CancellationToken;
    use wyrm_core::{
        Broker, BrokerError, BrokerResult, Delivery, DeliveryHandler, EventBinding, HandlerKey,
        HeaderMutator, Json, MessageSource, Payload, Subscription, SubscriptionId,
    };

    use crate::handler::{EventHandler, RequestHandler, event_handler, request_handler};
    use crate::pipeline::{call_next, from_fn};
    use crate::routing::resolve;

    #[derive(Default)]
    struct RecordingBroker {
        published: Mutex<Vec<(Binding, Vec<u8>, Headers)>>,
        fail: bool,
    }

    #[async_trait]
    impl Broker for RecordingBroker {
        async fn ensure_queue(&self, _name: &str) -> BrokerResult<()> {
            Ok(())
        }

        async fn ensure_topic(&self, _name: &str) -> BrokerResult<()> {
            Ok(())
        }

        async fn create_anonymous_bound_queue(&self, topic: &str) -> BrokerResult<String> {
            Ok(format!("{topic}.anon"))
        }

        async fn receive(
            &self,
            queue: &str,
            _on_message: DeliveryHandler,
            _cancel: CancellationToken,
        ) -> BrokerResult<Subscription> {
            Err(BrokerError::QueueNotFound(queue.to_string()))
        }

        async fn stop_receiving(&self, _subscription: SubscriptionId) -> BrokerResult<()> {
            Ok(())
        }

        async fn publish(
            &self,
            destination: &Binding,
            body: Vec<u8>,
            headers: HeaderMutator,
        ) -> BrokerResult<()> {
            if self.fail {
                return Err(BrokerError::PublishFailed("broker down".into()));
            }
            let mut outgoing = Headers::new();
            headers(&mut outgoing);
            self.published
                .lock()
                .push((destination.clone(), body, outgoing));
            Ok(())
        }
    }

    #[derive(Deserialize)]
    struct Shout {
        text: String,
    }

    #[derive(Serialize)]
    struct Echo {
        text: String,
    }

    struct Upper;

    #[async_trait]
    impl RequestHandler for Upper {
        type Input = Json<Shout>;
        type Output = Json<Echo>;

        async fn handle(
            &self,
            input: Option<Json<Shout>>,
            _ctx: &MessageContext,
        ) -> Result<Json<Echo>, BoxError> {
            let Json(shout) = input.ok_or("missing input")?;
            Ok(Json(Echo {
                text: shout.text.to_uppercase(),
            }))
        }
    }

    struct Maybe;

    #[async_trait]
    impl RequestHandler for Maybe {
        type Input = String;
        type Output = Option<String>;

        async fn handle(
            &self,
            input: Option<String>,
            _ctx: &MessageContext,
        ) -> Result<Option<String>, BoxError> {
            Ok(input.filter(|s| s != "skip"))
        }
    }

    struct Failing;

    #[async_trait]
    impl EventHandler for Failing {
        type Input = String;

        async fn handle(&self, _input: Option<String>, _ctx: &MessageContext) -> Result<(), BoxError> {
            Err("boom".into())
        }
    }

    fn ctx(body: &[u8], headers: Headers) -> Arc<MessageContext> {
        Arc::new(MessageContext::new(
            Delivery::new(body.to_vec()).with_headers(headers),
            MessageSource::new("requests", HandlerKey::new("upper")),
            CancellationToken::new(),
        ))
    }

    fn pipeline_for(
        handler: BoxedHandler,
        broker: Arc<RecordingBroker>,
        bindings: &[EventBinding],
        after: &[Arc<dyn Behavior>],
    ) -> Pipeline {
        let descriptor = resolve(&HandlerKey::new("upper"), handler.shape(), bindings).unwrap();
        handler_pipeline(&descriptor, handler, broker, &[], after).unwrap()
    }

    #[tokio::test]
    async fn round_trip_publishes_result_with_headers() {
        let broker = Arc::new(RecordingBroker::default());
        let pipeline = pipeline_for(
            request_handler(Upper),
            broker.clone(),
            &[
                EventBinding::queue("requests"),
                EventBinding::queue("responses").outbound(),
            ],
            &[],
        );
        assert_eq!(pipeline.len(), 2);

        let inbound = Headers::new()
            .with("correlation-id", "c-42")
            .with("content-type", "text/plain");
        assert_ok!(
            pipeline
                .invoke(ctx(br#"{"text":"hello"}"#, inbound.clone()))
                .await
        );

        let published = broker.published.lock();
        assert_eq!(published.len(), 1);
        let (destination, body, headers) = &published[0];
        assert_eq!(*destination, Binding::Queue("responses".into()));
        assert_eq!(body.as_slice(), br#"{"text":"HELLO"}"#);
        assert_eq!(*headers, inbound);
    }

    #[tokio::test]
    async fn empty_result_publishes_nothing_but_continues() {
        let broker = Arc::new(RecordingBroker::default());
        let reached = Arc::new(Mutex::new(0usize));
        let after: Arc<dyn Behavior> = Arc::new(from_fn({
            let reached = reached.clone();
            move |ctx, next| {
                let reached = reached.clone();
                async move {
                    *reached.lock() += 1;
                    call_next(next, ctx).await
                }
            }
        }));
        let pipeline = pipeline_for(
            request_handler(Maybe),
            broker.clone(),
            &[
                EventBinding::queue("requests"),
                EventBinding::topic("responses").outbound(),
            ],
            &[after],
        );

        assert_ok!(pipeline.invoke(ctx(b"skip", Headers::new())).await);
        assert!(broker.published.lock().is_empty());

        assert_ok!(pipeline.invoke(ctx(b"", Headers::new())).await);
        assert!(broker.published.lock().is_empty());

        assert_ok!(pipeline.invoke(ctx(b"keep", Headers::new())).await);
        assert_eq!(broker.published.lock().len(), 1);
        assert_eq!(*reached.lock(), 3);
    }

    #[tokio::test]
    async fn handler_failure_is_reraised_without_publish() {
        let broker = Arc::new(RecordingBroker::default());
        let pipeline = pipeline_for(
            event_handler(Failing),
            broker.clone(),
            &[EventBinding::queue("requests")],
            &[],
        );

        let err = assert_err!(pipeline.invoke(ctx(b"x", Headers::new())).await);
        let dispatch = err.downcast_ref::<DispatchError>().unwrap();
        assert!(matches!(dispatch, DispatchError::Handler { .. }));
        assert!(broker.published.lock().is_empty());
    }

    #[tokio::test]
    async fn deserialize_failure_surfaces_as_dispatch_error() {
        let broker = Arc::new(RecordingBroker::default());
        let pipeline = pipeline_for(
            request_handler(Upper),
            broker.clone(),
            &[
                EventBinding::queue("requests"),
                EventBinding::queue("responses").outbound(),
            ],
            &[],
        );

        let err = assert_err!(pipeline.invoke(ctx(b"{oops", Headers::new())).await);
        assert!(matches!(
            err.downcast_ref::<DispatchError>(),
            Some(DispatchError::Deserialize { .. })
        ));
        assert!(broker.published.lock().is_empty());
    }

    #[tokio::test]
    async fn publish_failure_is_reraised() {
        let broker = Arc::new(RecordingBroker {
            fail: true,
            ..Default::default()
        });
        let pipeline = pipeline_for(
            request_handler(Upper),
            broker,
            &[
                EventBinding::queue("requests"),
                EventBinding::queue("responses").outbound(),
            ],
            &[],
        );

        let err = assert_err!(pipeline.invoke(ctx(br#"{"text":"a"}"#, Headers::new())).await);
        assert!(matches!(
            err.downcast_ref::<DispatchError>(),
            Some(DispatchError::Publish { .. })
        ));
    }

    #[tokio::test]
    async fn result_already_set_by_earlier_behavior_is_an_error() {
        let broker = Arc::new(RecordingBroker::default());
        let handler = request_handler(Upper);
        let descriptor = resolve(
            &HandlerKey::new("upper"),
            handler.shape(),
            &[EventBinding::queue("requests")],
        )
        .unwrap();
        let prefill: Arc<dyn Behavior> = Arc::new(from_fn(|ctx: Arc<MessageContext>, next| async move {
            ctx.set_result(Payload::Text("early".into()))?;
            call_next(next, ctx).await
        }));
        let pipeline = handler_pipeline(&descriptor, handler, broker, &[prefill], &[]).unwrap();

        let err = assert_err!(pipeline.invoke(ctx(br#"{"text":"a"}"#, Headers::new())).await);
        assert!(matches!(
            err.downcast_ref::<DispatchError>(),
            Some(DispatchError::ResultSlot(_))
        ));
    }
}
