//! Business reactions, one per consuming participant.
//!
//! Each reaction is a pure [`Reaction`](smart_ticketing_core::Reaction): it
//! validates the envelope against the topic schema and returns the events to
//! append downstream. Keys are derived from the business entity so a
//! redelivered envelope produces an identical event under the same key.

pub mod admin;
pub mod notification;
pub mod payment;
pub mod ticketing;

pub use admin::AdminAudit;
pub use notification::NotificationFanIn;
pub use payment::PaymentConfirmation;
pub use ticketing::TicketIssuer;

use smart_ticketing_core::envelope::{Envelope, Payload};
use smart_ticketing_core::reaction::HandlerError;
use smart_ticketing_core::topic::{Service, Topic};

/// Decode and validate an envelope delivered to `service`.
///
/// An envelope on a topic the service does not subscribe to is rejected; it
/// can only arrive through a misconfigured subscription and retrying does not
/// change that.
pub(crate) fn accept(service: Service, envelope: &Envelope) -> Result<(Topic, Payload), HandlerError> {
    let (topic, payload) = envelope.validated_payload()?;
    if !topic.consumers().contains(&service) {
        return Err(HandlerError::Rejected(format!(
            "{service} does not subscribe to {topic}"
        )));
    }
    Ok((topic, payload))
}
