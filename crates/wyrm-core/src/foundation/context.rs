//! Per-message context.
//!
//! A [`MessageContext`] is created once for every inbound delivery and shared
//! by all behaviors of the pipeline invocation that processes it.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::foundation::error::DispatchError;
use crate::foundation::headers::{CallerIdentity, Delivery, Headers};
use crate::foundation::payload::Payload;
use crate::integration::descriptor::{Binding, HandlerKey};

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Where a message came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSource {
    /// The queue the delivery was received on.
    pub queue: String,
    /// The handler type processing it.
    pub handler: HandlerKey,
    /// The inbound binding that fed `queue`. For a topic, `queue` is the
    /// worker's anonymous queue.
    pub binding: Option<Binding>,
}

impl MessageSource {
    pub fn new(queue: impl Into<String>, handler: HandlerKey) -> Self {
        Self {
            queue: queue.into(),
            handler,
            binding: None,
        }
    }

    pub fn with_binding(mut self, binding: Binding) -> Self {
        self.binding = Some(binding);
        self
    }

    /// The topic name for topic bindings, the queue name otherwise.
    pub fn name(&self) -> &str {
        match &self.binding {
            Some(binding @ Binding::Topic(_)) => binding.name(),
            _ => &self.queue,
        }
    }
}

#[derive(Debug, Default)]
enum ResultSlot {
    #[default]
    Empty,
    Filled(Payload),
    Consumed,
}

/// The context object passed through the pipeline for one message.
///
/// # Result slot
///
/// The context carries a single result slot. It is written at most once,
/// normally by the Invoke Handler behavior, and consumed at most once,
/// normally by Publish Result. Writing twice, or writing after the value was
/// consumed, is an error.
///
/// # Cancellation
///
/// [`cancellation`](Self::cancellation) is a child of the worker's shutdown
/// token. It can be cancelled on its own, and it is cancelled whenever the
/// worker shuts down.
#[derive(Debug)]
pub struct MessageContext {
    message_id: u64,
    source: MessageSource,
    headers: Headers,
    body: Vec<u8>,
    redelivered: bool,
    identity: Option<CallerIdentity>,
    cancellation: CancellationToken,
    result: Mutex<ResultSlot>,
}

impl MessageContext {
    /// Creates a context for `delivery`.
    pub fn new(delivery: Delivery, source: MessageSource, cancellation: CancellationToken) -> Self {
        Self {
            message_id: NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed),
            source,
            headers: delivery.headers,
            body: delivery.body,
            redelivered: delivery.redelivered,
            identity: delivery.identity,
            cancellation,
            result: Mutex::new(ResultSlot::Empty),
        }
    }

    /// Process-unique sequence number of this message.
    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    pub fn source(&self) -> &MessageSource {
        &self.source
    }

    pub fn handler_key(&self) -> &HandlerKey {
        &self.source.handler
    }

    pub fn queue(&self) -> &str {
        &self.source.queue
    }

    /// Name of the queue or topic the message was addressed to.
    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The raw inbound body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn identity(&self) -> Option<&CallerIdentity> {
        self.identity.as_ref()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Stores the handler result.
    pub fn set_result(&self, payload: Payload) -> Result<(), DispatchError> {
        let mut slot = self.result.lock();
        match *slot {
            ResultSlot::Empty => {
                *slot = ResultSlot::Filled(payload);
                Ok(())
            }
            ResultSlot::Filled(_) => Err(DispatchError::ResultSlot("result already set")),
            ResultSlot::Consumed => Err(DispatchError::ResultSlot("result already consumed")),
        }
    }

    /// Takes the handler result, leaving the slot consumed.
    ///
    /// Returns `None` if no result was set or it was already taken.
    pub fn take_result(&self) -> Option<Payload> {
        let mut slot = self.result.lock();
        match std::mem::replace(&mut *slot, ResultSlot::Consumed) {
            ResultSlot::Filled(payload) => Some(payload),
            ResultSlot::Empty => {
                *slot = ResultSlot::Empty;
                None
            }
            ResultSlot::Consumed => None,
        }
    }

    /// Whether a result is waiting to be consumed.
    pub fn has_result(&self) -> bool {
        matches!(*self.result.lock(), ResultSlot::Filled(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> MessageContext {
        MessageContext::new(
            Delivery::new(b"body".to_vec()).with_headers(Headers::new().with("k", "v")),
            MessageSource::new("orders", HandlerKey::new("orders-handler")),
            CancellationToken::new(),
        )
    }

    #[test]
    fn carries_delivery_fields() {
        let ctx = context();
        assert_eq!(ctx.body(), b"body");
        assert_eq!(ctx.headers().get_str("k"), Some("v"));
        assert_eq!(ctx.queue(), "orders");
        assert_eq!(ctx.handler_key().as_str(), "orders-handler");
        assert!(ctx.identity().is_none());
    }

    #[test]
    fn source_name_prefers_the_topic() {
        let queued = MessageSource::new("orders", HandlerKey::new("h"))
            .with_binding(Binding::Queue("orders".into()));
        assert_eq!(queued.name(), "orders");

        let broadcast = MessageSource::new("events.anon-3", HandlerKey::new("h"))
            .with_binding(Binding::Topic("events".into()));
        assert_eq!(broadcast.name(), "events");
        assert_eq!(MessageSource::new("raw", HandlerKey::new("h")).name(), "raw");
    }

    #[test]
    fn message_ids_are_unique() {
        assert_ne!(context().message_id(), context().message_id());
    }

    #[test]
    fn result_slot_is_write_once_take_once() {
        let ctx = context();
        assert_eq!(ctx.take_result(), None);

        ctx.set_result(Payload::Text("a".into())).unwrap();
        assert!(ctx.has_result());
        assert!(matches!(
            ctx.set_result(Payload::Text("b".into())),
            Err(DispatchError::ResultSlot(_))
        ));

        assert_eq!(ctx.take_result(), Some(Payload::Text("a".into())));
        assert_eq!(ctx.take_result(), None);
        assert!(matches!(
            ctx.set_result(Payload::Text("c".into())),
            Err(DispatchError::ResultSlot(_))
        ));
    }

    #[test]
    fn empty_take_does_not_consume() {
        let ctx = context();
        assert_eq!(ctx.take_result(), None);
        assert!(ctx.set_result(Payload::Bytes(vec![1])).is_ok());
    }

    #[test]
    fn cancellation_follows_parent() {
        let shutdown = CancellationToken::new();
        let ctx = MessageContext::new(
            Delivery::default(),
            MessageSource::new("q", HandlerKey::new("h")),
            shutdown.child_token(),
        );
        assert!(!ctx.is_cancelled());
        shutdown.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn identity_comes_from_delivery() {
        let ctx = MessageContext::new(
            Delivery::new(b"x".to_vec()).with_identity(CallerIdentity::new("svc-billing")),
            MessageSource::new("q", HandlerKey::new("h")),
            CancellationToken::new(),
        );
        assert_eq!(ctx.identity().map(|i| i.subject.as_str()), Some("svc-billing"));
    }
}
