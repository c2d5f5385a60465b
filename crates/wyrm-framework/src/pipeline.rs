//! Middleware composition.
//!
//! A [`Behavior`] maps "the rest of the pipeline" to a new continuation. The
//! [`PipelineBuilder`] collects behaviors in order and folds them, right to
//! left, around a terminal continuation that completes immediately:
//!
//! ```text
//! build([b1, b2, b3]) = b1(b2(b3(terminal)))
//! ```
//!
//! `b1` therefore sees every message first on the way in and last on the way
//! out. Any tower [`Layer`] whose service is cloneable and thread-safe is a
//! behavior, so existing tower middleware can be added directly.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service, ServiceExt, service_fn};
use tower_layer::layer_fn;
use tracing::debug;

use wyrm_core::{BoxError, ConfigurationError, MessageContext};

/// The type-erased continuation a behavior wraps.
pub type Next = BoxCloneSyncService<Arc<MessageContext>, (), BoxError>;

/// A cross-cutting step of the pipeline.
pub trait Behavior: Send + Sync + 'static {
    /// Wraps the rest of the pipeline.
    fn wrap(&self, next: Next) -> Next;

    /// Name used in diagnostics.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

impl<L> Behavior for L
where
    L: Layer<Next> + Send + Sync + 'static,
    L::Service: Service<Arc<MessageContext>, Response = (), Error = BoxError>
        + Clone
        + Send
        + Sync
        + 'static,
    <L::Service as Service<Arc<MessageContext>>>::Future: Send + 'static,
{
    fn wrap(&self, next: Next) -> Next {
        BoxCloneSyncService::new(self.layer(next))
    }
}

/// Calls the continuation with `ctx`.
pub async fn call_next(next: Next, ctx: Arc<MessageContext>) -> Result<(), BoxError> {
    next.oneshot(ctx).await
}

// ============================================================================
// Closure behaviors
// ============================================================================

/// Builds a behavior from an async closure.
///
/// The closure receives the message context and the continuation, and
/// decides whether and when to call it.
///
/// ```rust,ignore
/// let timing = from_fn(|ctx, next| async move {
///     let started = Instant::now();
///     let result = call_next(next, ctx).await;
///     tracing::info!(elapsed = ?started.elapsed(), "message processed");
///     result
/// });
/// ```
pub fn from_fn<F, Fut>(f: F) -> impl Behavior
where
    F: Fn(Arc<MessageContext>, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    let f = Arc::new(f);
    layer_fn(move |next: Next| FnService {
        f: f.clone(),
        next,
    })
}

pub struct FnService<F> {
    f: Arc<F>,
    next: Next,
}

impl<F> Clone for FnService<F> {
    fn clone(&self) -> Self {
        FnService {
            f: self.f.clone(),
            next: self.next.clone(),
        }
    }
}

impl<F, Fut> Service<Arc<MessageContext>> for FnService<F>
where
    F: Fn(Arc<MessageContext>, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    type Response = ();
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<(), BoxError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, ctx: Arc<MessageContext>) -> Self::Future {
        Box::pin((self.f)(ctx, self.next.clone()))
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Collects behaviors for one handler type.
///
/// Once [`build`](Self::build) has been called, the builder is sealed and
/// further additions fail with [`ConfigurationError::PipelineSealed`].
pub struct PipelineBuilder {
    name: String,
    behaviors: Vec<Arc<dyn Behavior>>,
    sealed: bool,
}

impl PipelineBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            behaviors: Vec::new(),
            sealed: false,
        }
    }

    /// Appends a behavior. Behaviors run in the order they were added.
    pub fn add<B: Behavior>(&mut self, behavior: B) -> Result<&mut Self, ConfigurationError> {
        self.add_shared(Arc::new(behavior))
    }

    /// Appends a behavior that is shared with other pipelines.
    pub fn add_shared(
        &mut self,
        behavior: Arc<dyn Behavior>,
    ) -> Result<&mut Self, ConfigurationError> {
        if self.sealed {
            return Err(ConfigurationError::PipelineSealed(self.name.clone()));
        }
        self.behaviors.push(behavior);
        Ok(self)
    }

    /// Appends several shared behaviors in order.
    pub fn extend<I>(&mut self, behaviors: I) -> Result<&mut Self, ConfigurationError>
    where
        I: IntoIterator<Item = Arc<dyn Behavior>>,
    {
        for behavior in behaviors {
            self.add_shared(behavior)?;
        }
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.behaviors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.behaviors.is_empty()
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Composes the behaviors into a [`Pipeline`] and seals the builder.
    pub fn build(&mut self) -> Pipeline {
        self.sealed = true;

        let terminal: Next =
            BoxCloneSyncService::new(service_fn(|_ctx: Arc<MessageContext>| async {
                Ok::<(), BoxError>(())
            }));
        let entry = self
            .behaviors
            .iter()
            .rev()
            .fold(terminal, |next, behavior| behavior.wrap(next));

        debug!(
            pipeline = %self.name,
            behaviors = self.behaviors.len(),
            order = ?self.behaviors.iter().map(|b| b.name()).collect::<Vec<_>>(),
            "Pipeline built"
        );

        Pipeline {
            name: Arc::from(self.name.as_str()),
            entry,
            len: self.behaviors.len(),
        }
    }
}

impl fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("name", &self.name)
            .field("behaviors", &self.behaviors.len())
            .field("sealed", &self.sealed)
            .finish()
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// A composed, immutable pipeline.
///
/// Holds no per-message state. Cloning is cheap and clones share the composed
/// behaviors, so a single pipeline can serve every worker of a handler type
/// concurrently.
#[derive(Clone)]
pub struct Pipeline {
    name: Arc<str>,
    entry: Next,
    len: usize,
}

impl Pipeline {
    /// Runs one message through the pipeline.
    pub async fn invoke(&self, ctx: Arc<MessageContext>) -> Result<(), BoxError> {
        self.entry.clone().oneshot(ctx).await
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of composed behaviors.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("len", &self.len)
            .finish()
    }
}
