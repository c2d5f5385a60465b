//! # Wyrm Framework
//!
//! Pipeline composition, routing and the built-in dispatch behaviors.
//!
//! ## Overview
//!
//! - [`PipelineBuilder`] / [`Pipeline`]: composes [`Behavior`]s into a single
//!   continuation. Every tower `Layer` with a cloneable service is a behavior.
//! - [`routing::resolve`]: turns binding metadata into a [`HandlerDescriptor`].
//! - [`EventHandler`] / [`RequestHandler`]: the handler capability traits.
//! - [`InvokeHandlerLayer`] / [`PublishResultLayer`]: the dispatch behaviors.
//!
//! ## Example
//!
//! ```rust,ignore
//! use wyrm_framework::prelude::*;
//!
//! let handler = request_handler(Uppercase);
//! let descriptor = resolve(&key, handler.shape(), &bindings)?;
//! let pipeline = handler_pipeline(&descriptor, handler, broker, &[], &[])?;
//! pipeline.invoke(ctx).await?;
//! ```
//!
//! [`HandlerDescriptor`]: wyrm_core::HandlerDescriptor

pub mod dispatch;
pub mod handler;
pub mod pipeline;
pub mod routing;

pub use dispatch::{
    InvokeHandlerLayer, InvokeHandlerService, PublishResultLayer, PublishResultService,
    handler_pipeline,
};
pub use handler::{
    BoxedHandler, ErasedHandler, EventHandler, RequestHandler, event_handler, request_handler,
};
pub use pipeline::{Behavior, FnService, Next, Pipeline, PipelineBuilder, call_next, from_fn};
pub use routing::resolve;

pub use async_trait::async_trait;

/// Prelude for common imports.
pub mod prelude {
    pub use super::{
        Behavior, EventHandler, Next, Pipeline, PipelineBuilder, RequestHandler, async_trait,
        call_next, event_handler, from_fn, handler_pipeline, request_handler, resolve,
    };
}
