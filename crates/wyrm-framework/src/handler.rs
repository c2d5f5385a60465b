//! Handler capability traits.
//!
//! A handler type implements exactly one of:
//!
//! - [`EventHandler`]: consumes an input and produces nothing.
//! - [`RequestHandler`]: consumes an input and produces an output that can be
//!   published to an outbound binding.
//!
//! Both are erased into a [`BoxedHandler`] at registration. The erased form
//! decodes the message body, calls the handler, and converts its output into
//! a [`Payload`].

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use wyrm_core::{
    BoxError, DispatchError, HandlerShape, InboundPayload, MessageContext, OutboundPayload,
    Payload,
};

/// A handler that consumes messages without producing a result.
///
/// # Example
///
/// ```rust,ignore
/// struct AuditLogger;
///
/// #[async_trait]
/// impl EventHandler for AuditLogger {
///     type Input = String;
///
///     async fn handle(&self, input: Option<String>, ctx: &MessageContext) -> Result<(), BoxError> {
///         tracing::info!(queue = ctx.queue(), entry = ?input, "audit");
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    type Input: InboundPayload;

    /// Handles one message. `input` is `None` when the body was empty.
    async fn handle(&self, input: Option<Self::Input>, ctx: &MessageContext)
    -> Result<(), BoxError>;
}

/// A handler that produces a result for every message.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    type Input: InboundPayload;
    type Output: OutboundPayload;

    /// Handles one message. `input` is `None` when the body was empty.
    async fn handle(
        &self,
        input: Option<Self::Input>,
        ctx: &MessageContext,
    ) -> Result<Self::Output, BoxError>;
}

// ============================================================================
// Erased form
// ============================================================================

/// Object-safe form of a registered handler.
pub trait ErasedHandler: Send + Sync + 'static {
    fn shape(&self) -> HandlerShape;

    /// Decodes the body of `ctx`, calls the handler, and returns its payload.
    fn invoke(
        &self,
        ctx: Arc<MessageContext>,
    ) -> BoxFuture<'static, Result<Option<Payload>, DispatchError>>;
}

/// A shared, type-erased handler.
pub type BoxedHandler = Arc<dyn ErasedHandler>;

/// Erases an [`EventHandler`].
pub fn event_handler<H: EventHandler>(handler: H) -> BoxedHandler {
    Arc::new(EventAdapter(Arc::new(handler)))
}

/// Erases a [`RequestHandler`].
pub fn request_handler<H: RequestHandler>(handler: H) -> BoxedHandler {
    Arc::new(RequestAdapter(Arc::new(handler)))
}

fn decode_input<I: InboundPayload>(ctx: &MessageContext) -> Result<Option<I>, DispatchError> {
    if ctx.body().is_empty() {
        return Ok(None);
    }
    I::decode(ctx.body())
        .map(Some)
        .map_err(|cause| DispatchError::Deserialize {
            handler: ctx.handler_key().to_string(),
            source_name: ctx.source_name().to_string(),
            cause,
        })
}

struct EventAdapter<H>(Arc<H>);

impl<H: EventHandler> ErasedHandler for EventAdapter<H> {
    fn shape(&self) -> HandlerShape {
        HandlerShape {
            input: H::Input::KIND,
            output: None,
            input_type: H::Input::type_name(),
            output_type: None,
        }
    }

    fn invoke(
        &self,
        ctx: Arc<MessageContext>,
    ) -> BoxFuture<'static, Result<Option<Payload>, DispatchError>> {
        let handler = self.0.clone();
        Box::pin(async move {
            let input = decode_input::<H::Input>(&ctx)?;
            handler
                .handle(input, &ctx)
                .await
                .map_err(|cause| DispatchError::Handler {
                    handler: ctx.handler_key().to_string(),
                    cause,
                })?;
            Ok(None)
        })
    }
}

struct RequestAdapter<H>(Arc<H>);

impl<H: RequestHandler> ErasedHandler for RequestAdapter<H> {
    fn shape(&self) -> HandlerShape {
        HandlerShape {
            input: H::Input::KIND,
            output: Some(H::Output::KIND),
            input_type: H::Input::type_name(),
            output_type: Some(std::any::type_name::<H::Output>()),
        }
    }

    fn invoke(
        &self,
        ctx: Arc<MessageContext>,
    ) -> BoxFuture<'static, Result<Option<Payload>, DispatchError>> {
        let handler = self.0.clone();
        Box::pin(async move {
            let input = decode_input::<H::Input>(&ctx)?;
            let output = handler
                .handle(input, &ctx)
                .await
                .map_err(|cause| DispatchError::Handler {
                    handler: ctx.handler_key().to_string(),
                    cause,
                })?;
            output
                .into_payload()
                .map_err(|cause| DispatchError::Encode {
                    handler: ctx.handler_key().to_string(),
                    cause,
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tokio_util::sync::CancellationToken;
    use wyrm_core::{Delivery, HandlerKey, Json, MessageSource, PayloadKind, PayloadStream};

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

    struct ByteCounter;

    #[async_trait]
    impl EventHandler for ByteCounter {
        type Input = PayloadStream;

        async fn handle(
            &self,
            input: Option<PayloadStream>,
            _ctx: &MessageContext,
        ) -> Result<(), BoxError> {
            match input {
                Some(stream) if !stream.remaining().is_empty() => Ok(()),
                _ => Err("empty stream".into()),
            }
        }
    }

    fn ctx(body: &[u8]) -> Arc<MessageContext> {
        Arc::new(MessageContext::new(
            Delivery::new(body.to_vec()),
            MessageSource::new("shouts", HandlerKey::new("upper")),
            CancellationToken::new(),
        ))
    }

    #[test]
    fn shapes_follow_associated_types() {
        let request = request_handler(Upper).shape();
        assert_eq!(request.input, PayloadKind::Structured);
        assert_eq!(request.output, Some(PayloadKind::Structured));

        let event = event_handler(ByteCounter).shape();
        assert_eq!(event.input, PayloadKind::Stream);
        assert!(!event.has_output());
    }

    #[tokio::test]
    async fn request_handler_produces_payload() {
        let handler = request_handler(Upper);
        let payload = handler.invoke(ctx(br#"{"text":"hello"}"#)).await.unwrap();
        assert_eq!(
            payload,
            Some(Payload::Structured(serde_json::json!({ "text": "HELLO" })))
        );
    }

    #[tokio::test]
    async fn deserialize_error_names_handler_and_source() {
        let err = request_handler(Upper)
            .invoke(ctx(b"not json"))
            .await
            .unwrap_err();
        match err {
            DispatchError::Deserialize {
                handler,
                source_name,
                ..
            } => {
                assert_eq!(handler, "upper");
                assert_eq!(source_name, "shouts");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_body_is_absent_input() {
        let err = event_handler(ByteCounter).invoke(ctx(b"")).await.unwrap_err();
        assert!(matches!(err, DispatchError::Handler { .. }));

        let ok = event_handler(ByteCounter).invoke(ctx(b"abc")).await.unwrap();
        assert_eq!(ok, None);
    }
}
