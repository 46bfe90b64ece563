//! Message records.
//!
//! A [`Message`] is one record read from a topic partition: its position
//! (partition, offset), timestamp, optional key and value payloads, and headers.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// The body of a key or value.
///
/// Text payloads serialize as JSON strings and binary payloads as arrays of
/// bytes, so a message file can mix both.
///
/// # Examples
///
/// ```
/// use ti_core::Payload;
///
/// let payload = Payload::from(r#"{"level":"error"}"#);
/// assert!(payload.structured().is_some());
///
/// let payload = Payload::from("plain text");
/// assert!(payload.structured().is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    /// UTF-8 text, possibly a serialized JSON document.
    Text(String),
    /// Raw bytes.
    Binary(Vec<u8>),
}

impl Payload {
    /// Returns the payload as text, replacing invalid UTF-8 in binary payloads.
    #[must_use]
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            Self::Text(text) => Cow::Borrowed(text),
            Self::Binary(bytes) => String::from_utf8_lossy(bytes),
        }
    }

    /// Parses the payload as structured data.
    ///
    /// Only JSON objects and arrays count as structured; scalars such as `42`
    /// or `"x"` stay plain text so that `value == "42"` compares the raw text.
    #[must_use]
    pub fn structured(&self) -> Option<serde_json::Value> {
        let text = self.as_text();
        let trimmed = text.trim_start();
        if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
            return None;
        }
        serde_json::from_str::<serde_json::Value>(trimmed)
            .ok()
            .filter(|value| value.is_object() || value.is_array())
    }

    /// Returns the payload size in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    /// Returns `true` if the payload is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

/// A single message header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Header name.
    pub key: String,
    /// Header value, decoded as text.
    pub value: String,
}

impl Header {
    /// Creates a new header.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A record read from a topic partition.
///
/// # Examples
///
/// ```
/// use ti_core::{Header, Message};
///
/// let message = Message::new(0, 42)
///     .with_key("order-7")
///     .with_value(r#"{"status":"failed"}"#)
///     .with_header(Header::new("trace-id", "abc"));
///
/// assert_eq!(message.header("trace-id"), Some("abc"));
/// assert_eq!(message.size_bytes(), 7 + 19 + 8 + 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Partition the message was read from.
    pub partition: i32,

    /// Offset within the partition.
    pub offset: i64,

    /// Producer or broker timestamp in milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,

    /// Message key, if any.
    #[serde(default)]
    pub key: Option<Payload>,

    /// Message value, if any.
    #[serde(default)]
    pub value: Option<Payload>,

    /// Message headers; most records carry only a handful.
    #[serde(default)]
    pub headers: SmallVec<[Header; 4]>,
}

impl Message {
    /// Creates a message with no key, value, or headers.
    #[must_use]
    pub fn new(partition: i32, offset: i64) -> Self {
        Self {
            partition,
            offset,
            timestamp: 0,
            key: None,
            value: None,
            headers: SmallVec::new(),
        }
    }

    /// Sets the key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<Payload>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Sets the value.
    #[must_use]
    pub fn with_value(mut self, value: impl Into<Payload>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Sets the timestamp in milliseconds.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Appends a header.
    #[must_use]
    pub fn with_header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    /// Returns the value of the first header named `key`.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|header| header.key == key)
            .map(|header| header.value.as_str())
    }

    /// Returns the approximate wire size: key, value, and header bytes.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        let key = self.key.as_ref().map_or(0, Payload::len);
        let value = self.value.as_ref().map_or(0, Payload::len);
        let headers: usize = self
            .headers
            .iter()
            .map(|header| header.key.len() + header.value.len())
            .sum();
        key + value + headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_structured_object() {
        let payload = Payload::from(r#"  {"a": 1}"#);
        let value = payload.structured().unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_payload_scalars_stay_text() {
        assert!(Payload::from("42").structured().is_none());
        assert!(Payload::from("\"quoted\"").structured().is_none());
        assert!(Payload::from("{not json").structured().is_none());
    }

    #[test]
    fn test_payload_binary_lossy_text() {
        let payload = Payload::Binary(vec![b'o', b'k', 0xff]);
        assert_eq!(payload.as_text(), "ok\u{fffd}");
        assert_eq!(payload.len(), 3);
    }

    #[test]
    fn test_message_deserialize_mixed_payloads() {
        let json = r#"{
            "partition": 1,
            "offset": 10,
            "key": [1, 2, 3],
            "value": "hello",
            "headers": [{"key": "h", "value": "v"}]
        }"#;
        let message: Message = serde_json::from_str(json).unwrap();
        assert_eq!(message.key, Some(Payload::Binary(vec![1, 2, 3])));
        assert_eq!(message.value, Some(Payload::Text("hello".to_owned())));
        assert_eq!(message.timestamp, 0);
        assert_eq!(message.header("h"), Some("v"));
        assert_eq!(message.header("missing"), None);
    }

    #[test]
    fn test_message_size_without_payloads() {
        assert_eq!(Message::new(0, 0).size_bytes(), 0);
    }
}
