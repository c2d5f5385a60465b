//! Payload codec.
//!
//! Handlers declare their input and output types through the
//! [`InboundPayload`] and [`OutboundPayload`] traits. The payload kind of each
//! type is fixed at compile time and recorded in the handler's
//! [`HandlerShape`](crate::HandlerShape) when it is registered.
//!
//! | Type | Kind | Wire format |
//! |------|------|-------------|
//! | `Vec<u8>` | `Bytes` | raw bytes |
//! | [`PayloadStream`] | `Stream` | raw bytes, exposed as a reader |
//! | `String` | `Text` | UTF-8 |
//! | [`Json<T>`] / `serde_json::Value` | `Structured` | JSON |

use std::io::{self, BufRead, Cursor, Read};
use std::ops::{Deref, DerefMut};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::trace;

use crate::foundation::error::{PayloadError, PayloadResult};

/// The wire representation class of a handler input or output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    Bytes,
    Stream,
    Text,
    Structured,
}

/// A handler output waiting to be published.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Vec<u8>),
    Text(String),
    Structured(Value),
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Bytes(_) => PayloadKind::Bytes,
            Payload::Text(_) => PayloadKind::Text,
            Payload::Structured(_) => PayloadKind::Structured,
        }
    }

    /// Encodes the payload into a message body.
    ///
    /// Structured values become JSON, bytes and text pass through unchanged.
    pub fn encode(self) -> PayloadResult<Vec<u8>> {
        match self {
            Payload::Bytes(bytes) => Ok(bytes),
            Payload::Text(text) => Ok(text.into_bytes()),
            Payload::Structured(value) => {
                serde_json::to_vec(&value).map_err(|e| PayloadError::Encode(e.to_string()))
            }
        }
    }
}

// =============================================================================
// Wrapper Types
// =============================================================================

/// Marks a structured (JSON) handler input or output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Json<T>(pub T);

impl<T> Json<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for Json<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for Json<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

/// A message body exposed as a readable stream.
#[derive(Debug, Clone, Default)]
pub struct PayloadStream {
    inner: Cursor<Vec<u8>>,
}

impl PayloadStream {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            inner: Cursor::new(bytes),
        }
    }

    /// Returns the remaining unread bytes.
    pub fn remaining(&self) -> &[u8] {
        let pos = (self.inner.position() as usize).min(self.inner.get_ref().len());
        &self.inner.get_ref()[pos..]
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.inner.into_inner()
    }
}

impl Read for PayloadStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl BufRead for PayloadStream {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.inner.consume(amt)
    }
}

// =============================================================================
// Inbound
// =============================================================================

/// A type a handler can receive as its input.
pub trait InboundPayload: Sized + Send + 'static {
    /// The payload kind of this type.
    const KIND: PayloadKind;

    /// Decodes a non-empty message body.
    fn decode(body: &[u8]) -> PayloadResult<Self>;

    /// Name reported in deserialization errors.
    fn type_name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

impl InboundPayload for Vec<u8> {
    const KIND: PayloadKind = PayloadKind::Bytes;

    fn decode(body: &[u8]) -> PayloadResult<Self> {
        Ok(body.to_vec())
    }
}

impl InboundPayload for PayloadStream {
    const KIND: PayloadKind = PayloadKind::Stream;

    fn decode(body: &[u8]) -> PayloadResult<Self> {
        Ok(PayloadStream::new(body.to_vec()))
    }
}

impl InboundPayload for String {
    const KIND: PayloadKind = PayloadKind::Text;

    fn decode(body: &[u8]) -> PayloadResult<Self> {
        String::from_utf8(body.to_vec()).map_err(|e| PayloadError::decode(Self::type_name(), e))
    }
}

impl InboundPayload for Value {
    const KIND: PayloadKind = PayloadKind::Structured;

    fn decode(body: &[u8]) -> PayloadResult<Self> {
        serde_json::from_slice(body).map_err(|e| PayloadError::decode(Self::type_name(), e))
    }
}

impl<T> InboundPayload for Json<T>
where
    T: DeserializeOwned + Send + 'static,
{
    const KIND: PayloadKind = PayloadKind::Structured;

    fn decode(body: &[u8]) -> PayloadResult<Self> {
        decode_structured(body)
            .map(Json)
            .map_err(|e| PayloadError::decode(std::any::type_name::<T>(), e))
    }

    fn type_name() -> &'static str {
        std::any::type_name::<T>()
    }
}

/// Decodes a JSON body into `T`.
///
/// If the body does not match as-is, decoding is retried with every object
/// key rewritten to camelCase and then to snake_case. `OrderId`, `order_id`
/// and `orderId` therefore all reach the same field, and so do `TEXT` and
/// `text`.
pub fn decode_structured<T: DeserializeOwned>(body: &[u8]) -> Result<T, serde_json::Error> {
    let first = match serde_json::from_slice::<T>(body) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };

    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return Err(first);
    };

    for case in [KeyCase::Camel, KeyCase::Snake] {
        let rewritten = rewrite_keys(&value, case);
        if rewritten == value {
            continue;
        }
        trace!(
            ty = std::any::type_name::<T>(),
            ?case,
            "Retrying structured decode with rewritten keys"
        );
        if let Ok(decoded) = serde_json::from_value(rewritten) {
            return Ok(decoded);
        }
    }
    Err(first)
}

/// Naming convention applied to object keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCase {
    /// `orderId`. Used for every structured output.
    Camel,
    /// `order_id`.
    Snake,
}

impl KeyCase {
    pub fn apply(self, key: &str) -> String {
        let words = key_words(key);
        match self {
            KeyCase::Camel => {
                let mut out = String::with_capacity(key.len());
                for (i, word) in words.iter().enumerate() {
                    let lower = word.to_lowercase();
                    if i == 0 {
                        out.push_str(&lower);
                        continue;
                    }
                    let mut chars = lower.chars();
                    if let Some(first) = chars.next() {
                        out.extend(first.to_uppercase());
                        out.push_str(chars.as_str());
                    }
                }
                out
            }
            KeyCase::Snake => words
                .iter()
                .map(|w| w.to_lowercase())
                .collect::<Vec<_>>()
                .join("_"),
        }
    }
}

/// Rewrites every object key of `value`, recursively.
pub fn rewrite_keys(value: &Value, case: KeyCase) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (case.apply(k), rewrite_keys(v, case)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| rewrite_keys(v, case)).collect()),
        other => other.clone(),
    }
}

/// Splits a key into words at separators and case boundaries.
///
/// An uppercase run counts as one word, `HTTPStatus` splits into `HTTP` and
/// `Status`.
fn key_words(key: &str) -> Vec<String> {
    let chars: Vec<char> = key.chars().collect();
    let mut words = Vec::new();
    let mut current = String::new();

    for (i, &c) in chars.iter().enumerate() {
        if matches!(c, '_' | '-' | ' ') {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            continue;
        }
        if c.is_uppercase() && !current.is_empty() {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            if prev.is_lowercase() || prev.is_ascii_digit() || (prev.is_uppercase() && next_is_lower)
            {
                words.push(std::mem::take(&mut current));
            }
        }
        current.push(c);
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

// =============================================================================
// Outbound
// =============================================================================

/// A type a request handler can return as its output.
///
/// Conversion yields `None` for outputs that are logically empty, in which
/// case nothing is published.
pub trait OutboundPayload: Send + 'static {
    const KIND: PayloadKind;

    fn into_payload(self) -> PayloadResult<Option<Payload>>;
}

impl OutboundPayload for Vec<u8> {
    const KIND: PayloadKind = PayloadKind::Bytes;

    fn into_payload(self) -> PayloadResult<Option<Payload>> {
        Ok(Some(Payload::Bytes(self)))
    }
}

impl OutboundPayload for String {
    const KIND: PayloadKind = PayloadKind::Text;

    fn into_payload(self) -> PayloadResult<Option<Payload>> {
        Ok(Some(Payload::Text(self)))
    }
}

impl OutboundPayload for Value {
    const KIND: PayloadKind = PayloadKind::Structured;

    fn into_payload(self) -> PayloadResult<Option<Payload>> {
        Ok(match self {
            Value::Null => None,
            value => Some(Payload::Structured(value)),
        })
    }
}

impl<T> OutboundPayload for Json<T>
where
    T: Serialize + Send + 'static,
{
    const KIND: PayloadKind = PayloadKind::Structured;

    fn into_payload(self) -> PayloadResult<Option<Payload>> {
        let value =
            serde_json::to_value(&self.0).map_err(|e| PayloadError::Encode(e.to_string()))?;
        rewrite_keys(&value, KeyCase::Camel).into_payload()
    }
}

impl<T: OutboundPayload> OutboundPayload for Option<T> {
    const KIND: PayloadKind = T::KIND;

    fn into_payload(self) -> PayloadResult<Option<Payload>> {
        match self {
            Some(inner) => inner.into_payload(),
            None => Ok(None),
        }
    }
}
