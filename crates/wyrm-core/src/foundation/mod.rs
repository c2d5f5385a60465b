//! Foundation layer - messages, contexts, payloads and errors.

pub mod context;
pub mod error;
pub mod headers;
pub mod payload;

pub use context::{MessageContext, MessageSource};
pub use error::{
    BoxError, BrokerError, BrokerResult, ConfigurationError, ConfigurationResult, DispatchError,
    PayloadError, PayloadResult,
};
pub use headers::{CallerIdentity, Delivery, HeaderValue, Headers};
pub use payload::{
    InboundPayload, Json, KeyCase, OutboundPayload, Payload, PayloadKind, PayloadStream,
    decode_structured, rewrite_keys,
};
