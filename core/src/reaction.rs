//! The business step a participant performs for one incoming envelope.
//!
//! A [`Reaction`] is a pure function from an envelope to the events it wants
//! produced downstream. It performs no I/O: delivery, publication, retries and
//! offset commits all belong to the runtime. This keeps every participant
//! unit-testable without a broker.
//!
//! ```text
//! RECEIVED ─► VALIDATED ─► (no-op | PRODUCED) ─► ACKNOWLEDGED
//!                 └─► REJECTED (malformed) ─────► ACKNOWLEDGED
//! ```
//!
//! Reactions must be deterministic: the same envelope always yields the same
//! outgoing events with the same keys, so a redelivery produces a duplicate
//! rather than a divergent event.

use crate::envelope::{Envelope, MalformedPayloadError, OutgoingEvent};
use crate::event_bus::EventBusError;
use crate::topic::Service;
use thiserror::Error;

/// Why handling an envelope did not complete.
#[derive(Error, Debug, Clone)]
pub enum HandlerError {
    /// The envelope can never be processed. Reject it and move on.
    #[error(transparent)]
    Malformed(#[from] MalformedPayloadError),

    /// The reaction produced something the registry forbids. Retrying the
    /// same envelope yields the same result, so it is rejected like a
    /// malformed one.
    #[error("rejected: {0}")]
    Rejected(String),

    /// A dependency failed; the envelope may succeed on redelivery.
    #[error("transient failure: {0}")]
    Transient(String),

    /// A downstream publish did not complete; the envelope may succeed on redelivery.
    #[error(transparent)]
    Delivery(EventBusError),
}

impl HandlerError {
    /// Whether the envelope should be committed past instead of retried.
    #[must_use]
    pub const fn is_poison(&self) -> bool {
        matches!(self, Self::Malformed(_) | Self::Rejected(_))
    }
}

impl From<EventBusError> for HandlerError {
    fn from(err: EventBusError) -> Self {
        match err {
            EventBusError::MalformedPayload(e) => Self::Malformed(e),
            EventBusError::NotProducible { .. } => Self::Rejected(err.to_string()),
            other => Self::Delivery(other),
        }
    }
}

/// One participant's reaction to envelopes on its subscribed topics.
pub trait Reaction: Send + Sync + 'static {
    /// The business role performing this reaction.
    fn service(&self) -> Service;

    /// Validate `envelope` and decide what to produce downstream.
    ///
    /// An empty vector means the envelope was handled with no downstream
    /// effect (audit, or a topic this role only observes).
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Malformed`] if the payload violates the topic
    /// schema, or [`HandlerError::Transient`] if a local dependency is unavailable.
    fn react(&self, envelope: &Envelope) -> Result<Vec<OutgoingEvent>, HandlerError>;
}
