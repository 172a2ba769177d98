//! The topic registry: the fixed catalog of streams in the purchase workflow.
//!
//! Every topic has a known set of producers, a known set of consuming
//! services and a minimum payload schema. Participants only ever learn about
//! each other through this table.
//!
//! | Topic | Producer(s) | Consumer(s) | Required fields |
//! |---|---|---|---|
//! | `passengers.registered` | Passenger | Admin | `passengerId`, `name` |
//! | `trips.updated` | Transport | Notification, Admin | `tripId`, `status` |
//! | `payments.requested` | external | Payment | `ticketId`, `amount` |
//! | `payments.confirmed` | Payment | Ticketing, Notification | `ticketId` |
//! | `tickets.created` | Ticketing | Notification, Admin | `ticketId`, `status = "CREATED"` |
//! | `tickets.validated` | external | Notification | `ticketId` |
//! | `ticket-events` | alias | Admin | none |
//! | `payment-events` | alias | Admin | none |
//! | `notifications.sent` | Notification | none | none |
//!
//! The two alias streams are audited by Admin but nothing in the system
//! produces to them under those names; see
//! [`TopicRegistry::unproduced_subscriptions`].

use crate::envelope::{MalformedPayloadError, Payload, require_field};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// A topic from the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    /// A passenger signed up
    PassengersRegistered,
    /// A trip changed status
    TripsUpdated,
    /// A ticket purchase asks for payment (external stimulus)
    PaymentsRequested,
    /// A payment went through
    PaymentsConfirmed,
    /// A ticket was issued for a confirmed payment
    TicketsCreated,
    /// A ticket was validated at the gate (external stimulus)
    TicketsValidated,
    /// Audit alias stream for ticket activity
    TicketEvents,
    /// Audit alias stream for payment activity
    PaymentEvents,
    /// A notification was dispatched (terminal)
    NotificationsSent,
}

/// Who appends to a topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Producer {
    /// A participant inside the system
    Service(Service),
    /// A stimulus from outside the system (checkout front end, gate scanner)
    External,
    /// An audit stream name with no in-system producer
    Alias,
}

/// A business role. One participant process per role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Service {
    /// Originates passenger registrations
    Passenger,
    /// Originates trip status updates
    Transport,
    /// Confirms requested payments
    Payment,
    /// Issues tickets for confirmed payments
    Ticketing,
    /// Fans in ticket and trip activity, emits notifications
    Notification,
    /// Audit-only observer
    Admin,
}

/// How duplicates of an envelope are recognised.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdempotencyScope {
    /// One fact per business entity: `(topic, key, entity id)`.
    Entity,
    /// Repeated facts per entity are legitimate (a trip changes status many
    /// times), so only a repeat of the entity's latest content is a duplicate.
    Content,
}

/// Error returned when parsing an unknown topic or service name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{name}'")]
pub struct UnknownName {
    kind: &'static str,
    name: String,
}

impl Topic {
    /// Every topic in the catalog.
    pub const ALL: [Self; 9] = [
        Self::PassengersRegistered,
        Self::TripsUpdated,
        Self::PaymentsRequested,
        Self::PaymentsConfirmed,
        Self::TicketsCreated,
        Self::TicketsValidated,
        Self::TicketEvents,
        Self::PaymentEvents,
        Self::NotificationsSent,
    ];

    /// Wire name of the topic.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PassengersRegistered => "passengers.registered",
            Self::TripsUpdated => "trips.updated",
            Self::PaymentsRequested => "payments.requested",
            Self::PaymentsConfirmed => "payments.confirmed",
            Self::TicketsCreated => "tickets.created",
            Self::TicketsValidated => "tickets.validated",
            Self::TicketEvents => "ticket-events",
            Self::PaymentEvents => "payment-events",
            Self::NotificationsSent => "notifications.sent",
        }
    }

    /// Fields every payload on this topic must carry (non-null).
    #[must_use]
    pub const fn required_fields(self) -> &'static [&'static str] {
        match self {
            Self::PassengersRegistered => &["passengerId", "name"],
            Self::TripsUpdated => &["tripId", "status"],
            Self::PaymentsRequested => &["ticketId", "amount"],
            Self::PaymentsConfirmed | Self::TicketsValidated => &["ticketId"],
            Self::TicketsCreated => &["ticketId", "status"],
            Self::TicketEvents | Self::PaymentEvents | Self::NotificationsSent => &[],
        }
    }

    /// Field holding the business entity id, if the topic has one.
    #[must_use]
    pub const fn entity_field(self) -> Option<&'static str> {
        match self {
            Self::PassengersRegistered => Some("passengerId"),
            Self::TripsUpdated => Some("tripId"),
            Self::PaymentsRequested
            | Self::PaymentsConfirmed
            | Self::TicketsCreated
            | Self::TicketsValidated => Some("ticketId"),
            Self::TicketEvents | Self::PaymentEvents | Self::NotificationsSent => None,
        }
    }

    /// Who may append to this topic.
    #[must_use]
    pub const fn producers(self) -> &'static [Producer] {
        match self {
            Self::PassengersRegistered => &[Producer::Service(Service::Passenger)],
            Self::TripsUpdated => &[Producer::Service(Service::Transport)],
            Self::PaymentsRequested | Self::TicketsValidated => &[Producer::External],
            Self::PaymentsConfirmed => &[Producer::Service(Service::Payment)],
            Self::TicketsCreated => &[Producer::Service(Service::Ticketing)],
            Self::TicketEvents | Self::PaymentEvents => &[Producer::Alias],
            Self::NotificationsSent => &[Producer::Service(Service::Notification)],
        }
    }

    /// Services that subscribe to this topic.
    #[must_use]
    pub const fn consumers(self) -> &'static [Service] {
        match self {
            Self::PassengersRegistered | Self::TicketEvents | Self::PaymentEvents => {
                &[Service::Admin]
            },
            Self::TripsUpdated | Self::TicketsCreated => &[Service::Notification, Service::Admin],
            Self::PaymentsRequested => &[Service::Payment],
            Self::PaymentsConfirmed => &[Service::Ticketing, Service::Notification],
            Self::TicketsValidated => &[Service::Notification],
            Self::NotificationsSent => &[],
        }
    }

    /// How redelivered envelopes on this topic are recognised as duplicates.
    #[must_use]
    pub const fn idempotency_scope(self) -> IdempotencyScope {
        match self {
            Self::PassengersRegistered
            | Self::PaymentsRequested
            | Self::PaymentsConfirmed
            | Self::TicketsCreated => IdempotencyScope::Entity,
            Self::TripsUpdated
            | Self::TicketsValidated
            | Self::TicketEvents
            | Self::PaymentEvents
            | Self::NotificationsSent => IdempotencyScope::Content,
        }
    }

    /// Check a payload against this topic's schema.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedPayloadError::MissingField`] when a required field is
    /// absent or null, and [`MalformedPayloadError::InvalidField`] when a
    /// `tickets.created` payload does not carry `status = "CREATED"`.
    pub fn validate(self, payload: &Payload) -> Result<(), MalformedPayloadError> {
        for field in self.required_fields() {
            require_field(self, payload, field)?;
        }

        if self == Self::TicketsCreated
            && payload.get("status") != Some(&Value::String("CREATED".to_string()))
        {
            return Err(MalformedPayloadError::InvalidField {
                topic: self.to_string(),
                field: "status".to_string(),
                reason: "expected \"CREATED\"".to_string(),
            });
        }

        Ok(())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|topic| topic.as_str() == s)
            .ok_or_else(|| UnknownName {
                kind: "topic",
                name: s.to_string(),
            })
    }
}

impl Service {
    /// Every business role.
    pub const ALL: [Self; 6] = [
        Self::Passenger,
        Self::Transport,
        Self::Payment,
        Self::Ticketing,
        Self::Notification,
        Self::Admin,
    ];

    /// Short service name used in logs and group ids.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Passenger => "passenger",
            Self::Transport => "transport",
            Self::Payment => "payment",
            Self::Ticketing => "ticketing",
            Self::Notification => "notification",
            Self::Admin => "admin",
        }
    }

    /// Consumer group shared by every instance of this participant.
    #[must_use]
    pub fn consumer_group(self) -> String {
        format!("{}-service-group", self.name())
    }

    /// Topics this service may append to.
    #[must_use]
    pub fn produces(self) -> Vec<Topic> {
        TopicRegistry::producible_by(Producer::Service(self))
    }

    /// Topics this service subscribes to.
    #[must_use]
    pub fn consumes(self) -> Vec<Topic> {
        TopicRegistry::subscriptions(self)
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Service {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|service| service.name() == s)
            .ok_or_else(|| UnknownName {
                kind: "service",
                name: s.to_string(),
            })
    }
}

impl Producer {
    /// Whether this producer may append to `topic`.
    #[must_use]
    pub fn can_produce(self, topic: Topic) -> bool {
        topic.producers().contains(&self)
    }
}

impl fmt::Display for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Service(service) => write!(f, "{service}"),
            Self::External => f.write_str("external"),
            Self::Alias => f.write_str("alias"),
        }
    }
}

/// Queries over the fixed catalog.
pub struct TopicRegistry;

impl TopicRegistry {
    /// Topics `producer` may append to.
    #[must_use]
    pub fn producible_by(producer: Producer) -> Vec<Topic> {
        Topic::ALL
            .into_iter()
            .filter(|topic| producer.can_produce(*topic))
            .collect()
    }

    /// Topics `service` subscribes to.
    #[must_use]
    pub fn subscriptions(service: Service) -> Vec<Topic> {
        Topic::ALL
            .into_iter()
            .filter(|topic| topic.consumers().contains(&service))
            .collect()
    }

    /// Subscriptions of `service` that nothing in the system produces to.
    ///
    /// These are alias streams whose names drifted from the topics that are
    /// actually produced (`ticket-events` vs `tickets.created`). They are kept
    /// in the subscription list and surfaced at startup rather than silently
    /// renamed.
    #[must_use]
    pub fn unproduced_subscriptions(service: Service) -> Vec<Topic> {
        Self::subscriptions(service)
            .into_iter()
            .filter(|topic| topic.producers().iter().all(|p| *p == Producer::Alias))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn consumer_groups_follow_naming_convention() {
        assert_eq!(Service::Payment.consumer_group(), "payment-service-group");
        assert_eq!(Service::Notification.consumer_group(), "notification-service-group");
    }

    #[test]
    fn payment_flow_wiring() {
        assert_eq!(Service::Payment.consumes(), vec![Topic::PaymentsRequested]);
        assert_eq!(Service::Payment.produces(), vec![Topic::PaymentsConfirmed]);
        assert_eq!(Service::Ticketing.consumes(), vec![Topic::PaymentsConfirmed]);
        assert_eq!(Service::Ticketing.produces(), vec![Topic::TicketsCreated]);
    }

    #[test]
    fn notification_fans_in() {
        let topics = Service::Notification.consumes();
        for expected in [
            Topic::TripsUpdated,
            Topic::PaymentsConfirmed,
            Topic::TicketsCreated,
            Topic::TicketsValidated,
        ] {
            assert!(topics.contains(&expected), "missing {expected}");
        }
        assert_eq!(Service::Notification.produces(), vec![Topic::NotificationsSent]);
    }

    #[test]
    fn admin_only_observes() {
        assert!(Service::Admin.produces().is_empty());
        assert_eq!(Service::Admin.consumes().len(), 5);
    }

    #[test]
    fn alias_streams_are_flagged() {
        assert_eq!(
            TopicRegistry::unproduced_subscriptions(Service::Admin),
            vec![Topic::TicketEvents, Topic::PaymentEvents]
        );
        assert!(TopicRegistry::unproduced_subscriptions(Service::Payment).is_empty());
    }

    #[test]
    fn external_stimuli() {
        assert_eq!(
            TopicRegistry::producible_by(Producer::External),
            vec![Topic::PaymentsRequested, Topic::TicketsValidated]
        );
    }

    #[test]
    fn parses_wire_names() {
        assert_eq!("tickets.created".parse::<Topic>().unwrap(), Topic::TicketsCreated);
        assert_eq!("admin".parse::<Service>().unwrap(), Service::Admin);
        assert!("tickets.deleted".parse::<Topic>().is_err());
    }

    #[test]
    fn tickets_created_requires_created_status() {
        let Value::Object(ok) = json!({ "ticketId": 1, "status": "CREATED" }) else {
            unreachable!()
        };
        let Value::Object(wrong) = json!({ "ticketId": 1, "status": "PENDING" }) else {
            unreachable!()
        };

        assert!(Topic::TicketsCreated.validate(&ok).is_ok());
        assert!(matches!(
            Topic::TicketsCreated.validate(&wrong),
            Err(MalformedPayloadError::InvalidField { .. })
        ));
    }

    fn topic_strategy() -> impl Strategy<Value = Topic> {
        prop::sample::select(Topic::ALL.to_vec())
    }

    fn complete_payload(topic: Topic, filler: &str) -> Payload {
        let mut payload = Payload::new();
        for field in topic.required_fields() {
            payload.insert((*field).to_string(), Value::String(filler.to_string()));
        }
        if topic == Topic::TicketsCreated {
            payload.insert("status".to_string(), Value::String("CREATED".to_string()));
        }
        payload
    }

    proptest! {
        #[test]
        fn complete_payloads_validate(topic in topic_strategy(), filler in "[a-z0-9]{1,12}") {
            prop_assert!(topic.validate(&complete_payload(topic, &filler)).is_ok());
        }

        #[test]
        fn dropping_any_required_field_is_rejected(
            topic in topic_strategy(),
            index in any::<prop::sample::Index>(),
        ) {
            let fields = topic.required_fields();
            prop_assume!(!fields.is_empty());
            let mut payload = complete_payload(topic, "x");
            payload.remove(fields[index.index(fields.len())]);
            prop_assert!(topic.validate(&payload).is_err());
        }
    }
}
