//! Events that enter the choreography from outside a reaction.
//!
//! Passenger and Transport originate their facts instead of reacting to
//! envelopes; payment requests and ticket validations come from systems
//! outside the choreography entirely. Each builder returns an
//! [`OutgoingEvent`] keyed by its business entity.

use crate::config::OriginConfig;
use serde_json::{Value, json};
use smart_ticketing_core::envelope::{OutgoingEvent, Payload};
use smart_ticketing_core::topic::{Service, Topic};

fn object(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

/// A passenger joined, keyed `passenger-<id>`.
#[must_use]
pub fn passenger_registered(passenger_id: u64, name: &str) -> OutgoingEvent {
    OutgoingEvent::keyed(
        Topic::PassengersRegistered,
        format!("passenger-{passenger_id}"),
        object(json!({ "passengerId": passenger_id, "name": name })),
    )
}

/// A trip changed status, keyed `trip-<id>`.
#[must_use]
pub fn trip_updated(trip_id: u64, status: &str) -> OutgoingEvent {
    OutgoingEvent::keyed(
        Topic::TripsUpdated,
        format!("trip-{trip_id}"),
        object(json!({ "tripId": trip_id, "status": status })),
    )
}

/// A customer asked to pay for a ticket, keyed `payment-<ticketId>`.
#[must_use]
pub fn payment_requested(ticket_id: u64, amount: impl Into<Value>) -> OutgoingEvent {
    let amount: Value = amount.into();
    OutgoingEvent::keyed(
        Topic::PaymentsRequested,
        format!("payment-{ticket_id}"),
        object(json!({ "ticketId": ticket_id, "amount": amount })),
    )
}

/// A ticket was scanned at a gate, keyed `ticket-<ticketId>`.
#[must_use]
pub fn ticket_validated(ticket_id: u64) -> OutgoingEvent {
    OutgoingEvent::keyed(
        Topic::TicketsValidated,
        format!("ticket-{ticket_id}"),
        object(json!({ "ticketId": ticket_id })),
    )
}

/// What an originating service publishes when it runs.
///
/// Reacting services originate nothing.
#[must_use]
pub fn stimuli(service: Service, config: &OriginConfig) -> Vec<OutgoingEvent> {
    match service {
        Service::Passenger => vec![passenger_registered(
            config.passenger_id,
            &config.passenger_name,
        )],
        Service::Transport => vec![trip_updated(config.trip_id, &config.trip_status)],
        Service::Payment | Service::Ticketing | Service::Notification | Service::Admin => {
            Vec::new()
        },
    }
}
