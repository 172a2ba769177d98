//! The canonical message shape shared by every topic.
//!
//! An [`Envelope`] is what a consumer reads back from the log: the topic it was
//! appended to, its optional partition key, the broker-assigned position and
//! the raw value bytes. The value is kept undecoded so that a message which is
//! not valid JSON still has a position a consumer can commit past.
//!
//! On the wire the value is UTF-8 text encoding a JSON object ([`Payload`]).
//! The key is never part of the JSON body; it only drives partition
//! assignment and therefore ordering scope.
//!
//! # Example
//!
//! ```
//! use smart_ticketing_core::envelope::{Envelope, Payload};
//!
//! let mut payload = Payload::new();
//! payload.insert("ticketId".to_string(), 7.into());
//!
//! let envelope = Envelope::from_payload("payments.requested", Some("payment-7"), 0, 42, &payload);
//! assert_eq!(envelope.payload().unwrap(), payload);
//! assert_eq!(envelope.position().offset, 42);
//! ```

use crate::topic::Topic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// JSON object carried by an envelope.
pub type Payload = serde_json::Map<String, Value>;

/// A consumed envelope failed schema validation.
///
/// Such a message can never become valid by retrying, so consumers reject it,
/// record it as a dead letter and commit past it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedPayloadError {
    /// The value is not UTF-8 JSON, or not a JSON object.
    #[error("payload on '{topic}' is not a JSON object: {reason}")]
    NotAnObject {
        /// Topic the envelope was read from
        topic: String,
        /// Decoder message
        reason: String,
    },

    /// A field required by the topic schema is absent.
    #[error("payload on '{topic}' is missing required field '{field}'")]
    MissingField {
        /// Topic whose schema was violated
        topic: String,
        /// Name of the missing field
        field: String,
    },

    /// A field is present but its value cannot be used.
    #[error("field '{field}' on '{topic}' is invalid: {reason}")]
    InvalidField {
        /// Topic whose schema was violated
        topic: String,
        /// Name of the offending field
        field: String,
        /// What is wrong with it
        reason: String,
    },

    /// The envelope was read from a topic outside the registry.
    #[error("topic '{0}' is not part of the topic registry")]
    UnknownTopic(String),
}

/// Where an envelope lives in the log.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    /// Topic name
    pub topic: String,
    /// Partition within the topic
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// An envelope as delivered to a consumer group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Topic the envelope was appended to
    pub topic: String,
    /// Partition key, if the producer supplied one
    pub key: Option<String>,
    /// Partition assigned by the broker
    pub partition: i32,
    /// Broker-assigned offset, monotonically increasing per partition
    pub offset: i64,
    /// Raw value bytes (UTF-8 JSON object on a well-behaved topic)
    pub value: Vec<u8>,
}

impl Envelope {
    /// Create an envelope from raw parts.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        key: Option<String>,
        partition: i32,
        offset: i64,
        value: Vec<u8>,
    ) -> Self {
        Self {
            topic: topic.into(),
            key,
            partition,
            offset,
            value,
        }
    }

    /// Create an envelope whose value is the JSON encoding of `payload`.
    #[must_use]
    pub fn from_payload(
        topic: impl Into<String>,
        key: Option<&str>,
        partition: i32,
        offset: i64,
        payload: &Payload,
    ) -> Self {
        Self::new(topic, key.map(str::to_string), partition, offset, encode(payload))
    }

    /// Position of this envelope in the log.
    #[must_use]
    pub fn position(&self) -> Position {
        Position {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        }
    }

    /// The registry entry for this envelope's topic.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedPayloadError::UnknownTopic`] for topics outside the catalog.
    pub fn registered_topic(&self) -> Result<Topic, MalformedPayloadError> {
        self.topic
            .parse()
            .map_err(|_| MalformedPayloadError::UnknownTopic(self.topic.clone()))
    }

    /// Decode the value into a JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedPayloadError::NotAnObject`] if the value is not UTF-8
    /// JSON or decodes to something other than an object.
    pub fn payload(&self) -> Result<Payload, MalformedPayloadError> {
        match serde_json::from_slice::<Value>(&self.value) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(MalformedPayloadError::NotAnObject {
                topic: self.topic.clone(),
                reason: format!("expected object, found {}", json_kind(&other)),
            }),
            Err(e) => Err(MalformedPayloadError::NotAnObject {
                topic: self.topic.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// Decode the value and validate it against the topic schema.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedPayloadError`] if the topic is unknown, the value does
    /// not decode, or a required field is missing.
    pub fn validated_payload(&self) -> Result<(Topic, Payload), MalformedPayloadError> {
        let topic = self.registered_topic()?;
        let payload = self.payload()?;
        topic.validate(&payload)?;
        Ok((topic, payload))
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Envelope {{ {}[{}]@{}, key: {}, size: {} bytes }}",
            self.topic,
            self.partition,
            self.offset,
            self.key.as_deref().unwrap_or("<none>"),
            self.value.len()
        )
    }
}

/// An event a participant wants appended to a topic.
#[derive(Clone, Debug, PartialEq)]
pub struct OutgoingEvent {
    /// Destination topic
    pub topic: Topic,
    /// Partition key, derived from the business entity
    pub key: Option<String>,
    /// JSON body
    pub payload: Payload,
}

impl OutgoingEvent {
    /// Create a keyed outgoing event.
    #[must_use]
    pub fn keyed(topic: Topic, key: impl Into<String>, payload: Payload) -> Self {
        Self {
            topic,
            key: Some(key.into()),
            payload,
        }
    }

    /// Encoded value bytes.
    #[must_use]
    pub fn value(&self) -> Vec<u8> {
        encode(&self.payload)
    }
}

/// Broker acknowledgment of a successful append.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Topic appended to
    pub topic: String,
    /// Partition the envelope landed in
    pub partition: i32,
    /// Offset assigned by the broker
    pub offset: i64,
}

/// Encode a payload as UTF-8 JSON bytes.
#[must_use]
pub fn encode(payload: &Payload) -> Vec<u8> {
    // A map of JSON values always serializes.
    serde_json::to_vec(payload).unwrap_or_default()
}

/// Fetch a required field.
///
/// # Errors
///
/// Returns [`MalformedPayloadError::MissingField`] if the field is absent or null.
pub fn require_field<'a>(
    topic: Topic,
    payload: &'a Payload,
    field: &str,
) -> Result<&'a Value, MalformedPayloadError> {
    match payload.get(field) {
        Some(Value::Null) | None => Err(MalformedPayloadError::MissingField {
            topic: topic.to_string(),
            field: field.to_string(),
        }),
        Some(value) => Ok(value),
    }
}

/// Render the business identifier stored in `field` for use in partition keys.
///
/// Strings are used verbatim and integers are printed in decimal, so
/// `{"ticketId": 1}` and `{"ticketId": "1"}` both yield `"1"`.
///
/// # Errors
///
/// Returns [`MalformedPayloadError`] if the field is missing, an empty string,
/// or any other JSON type.
pub fn entity_id(topic: Topic, payload: &Payload, field: &str) -> Result<String, MalformedPayloadError> {
    let invalid = |reason: &str| MalformedPayloadError::InvalidField {
        topic: topic.to_string(),
        field: field.to_string(),
        reason: reason.to_string(),
    };

    match require_field(topic, payload, field)? {
        Value::String(s) if s.trim().is_empty() => Err(invalid("empty identifier")),
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) if n.is_i64() || n.is_u64() => Ok(n.to_string()),
        Value::Number(_) => Err(invalid("identifier must be an integer")),
        other => Err(invalid(&format!("identifier cannot be {}", json_kind(other)))),
    }
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
