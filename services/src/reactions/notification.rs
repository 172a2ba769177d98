//! Notification: fans in every customer-facing event.

use super::accept;
use smart_ticketing_core::envelope::{Envelope, MalformedPayloadError, OutgoingEvent, entity_id};
use smart_ticketing_core::reaction::{HandlerError, Reaction};
use smart_ticketing_core::topic::{Service, Topic};

/// Relays each subscribed event to `notifications.sent`.
///
/// The notification carries the original payload unchanged and is keyed
/// `<sourceTopic>-<entityId>`, where the entity is the ticket or the trip.
/// Source topics are causally independent: a `tickets.created` may be
/// notified before the `payments.confirmed` that led to it.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotificationFanIn;

impl Reaction for NotificationFanIn {
    fn service(&self) -> Service {
        Service::Notification
    }

    fn react(&self, envelope: &Envelope) -> Result<Vec<OutgoingEvent>, HandlerError> {
        let (topic, event) = accept(Service::Notification, envelope)?;
        let field = topic
            .entity_field()
            .ok_or_else(|| MalformedPayloadError::UnknownTopic(topic.to_string()))?;
        let entity = entity_id(topic, &event, field)?;
        let key = format!("{topic}-{entity}");

        tracing::info!(source = %topic, key = %key, "Notification triggered");
        Ok(vec![OutgoingEvent::keyed(Topic::NotificationsSent, key, event)])
    }
}
