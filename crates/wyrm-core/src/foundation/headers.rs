//! Message headers and raw deliveries.

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// An opaque header value.
pub type HeaderValue = serde_json::Value;

/// An ordered mapping of header names to opaque values.
///
/// Insertion order is preserved. Inserting a key that is already present
/// replaces its value without moving it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    entries: Vec<(String, HeaderValue)>,
}

impl Headers {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a header, returning the previous value if the key existed.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<HeaderValue>,
    ) -> Option<HeaderValue> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Returns the value under `key` if it is a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(HeaderValue::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Removes a header and returns its value.
    pub fn remove(&mut self, key: &str) -> Option<HeaderValue> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    /// Copies every entry of `other` whose key is not present in `self`.
    ///
    /// Existing values are never overwritten.
    pub fn merge_missing(&mut self, other: &Headers) {
        for (key, value) in &other.entries {
            if !self.contains_key(key) {
                self.entries.push((key.clone(), value.clone()));
            }
        }
    }

    /// Iterates over the entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<HeaderValue>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

impl Serialize for Headers {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Headers {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HeadersVisitor;

        impl<'de> Visitor<'de> for HeadersVisitor {
            type Value = Headers;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of header names to values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Headers, A::Error> {
                let mut headers = Headers::new();
                while let Some((k, v)) = access.next_entry::<String, HeaderValue>()? {
                    headers.insert(k, v);
                }
                Ok(headers)
            }
        }

        deserializer.deserialize_map(HeadersVisitor)
    }
}

/// A raw inbound message as handed over by a broker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delivery {
    pub headers: Headers,
    pub body: Vec<u8>,
    /// Whether the broker has delivered this message before.
    pub redelivered: bool,
    /// The authenticated sender, when the transport knows it.
    pub identity: Option<CallerIdentity>,
}

impl Delivery {
    /// Creates a delivery with no headers.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers: Headers::new(),
            body: body.into(),
            redelivered: false,
            identity: None,
        }
    }

    /// Attaches headers to the delivery.
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_identity(mut self, identity: CallerIdentity) -> Self {
        self.identity = Some(identity);
        self
    }
}

/// The authenticated caller of a message, if the transport knows it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallerIdentity {
    /// Principal name.
    pub subject: String,
    /// Additional claims carried with the identity.
    pub claims: Headers,
}

impl CallerIdentity {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            claims: Headers::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn insert_replaces_in_place() {
        let mut headers = Headers::new()
            .with("a", 1)
            .with("b", 2)
            .with("c", 3);

        let previous = headers.insert("b", 20);
        assert_eq!(previous, Some(json!(2)));

        let keys: Vec<_> = headers.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(headers.get("b"), Some(&json!(20)));
    }

    #[test]
    fn merge_missing_keeps_existing_values() {
        let mut outgoing = Headers::new().with("content-type", "application/json");
        let inbound = Headers::new()
            .with("content-type", "text/plain")
            .with("correlation-id", "abc");

        outgoing.merge_missing(&inbound);

        assert_eq!(outgoing.get_str("content-type"), Some("application/json"));
        assert_eq!(outgoing.get_str("correlation-id"), Some("abc"));
        assert_eq!(outgoing.len(), 2);
    }

    #[test]
    fn remove_and_contains() {
        let mut headers: Headers = [("x", "1"), ("y", "2")].into_iter().collect();
        assert!(headers.contains_key("x"));
        assert_eq!(headers.remove("x"), Some(json!("1")));
        assert!(!headers.contains_key("x"));
        assert_eq!(headers.remove("missing"), None);
    }

    #[test]
    fn serializes_as_object() {
        let headers = Headers::new().with("trace", "t-1").with("attempt", 2);
        let value = serde_json::to_value(&headers).unwrap();
        assert_eq!(value, json!({ "trace": "t-1", "attempt": 2 }));

        let back: Headers = serde_json::from_value(value).unwrap();
        assert_eq!(back.get_str("trace"), Some("t-1"));
        assert_eq!(back.len(), 2);
    }
}
