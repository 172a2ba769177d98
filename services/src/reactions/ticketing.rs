//! Ticketing: issues a ticket for each confirmed payment.

use super::accept;
use serde_json::Value;
use smart_ticketing_core::envelope::{Envelope, OutgoingEvent, entity_id};
use smart_ticketing_core::reaction::{HandlerError, Reaction};
use smart_ticketing_core::topic::{Service, Topic};

/// Turns `payments.confirmed` into `tickets.created`.
///
/// The ticket keeps every payment field and adds `status: "CREATED"`,
/// keyed `ticket-<ticketId>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TicketIssuer;

impl Reaction for TicketIssuer {
    fn service(&self) -> Service {
        Service::Ticketing
    }

    fn react(&self, envelope: &Envelope) -> Result<Vec<OutgoingEvent>, HandlerError> {
        let (topic, mut ticket) = accept(Service::Ticketing, envelope)?;
        let ticket_id = entity_id(topic, &ticket, "ticketId")?;

        ticket.insert("status".to_string(), Value::String("CREATED".to_string()));

        tracing::info!(ticket_id = %ticket_id, "Ticket created");
        Ok(vec![OutgoingEvent::keyed(
            Topic::TicketsCreated,
            format!("ticket-{ticket_id}"),
            ticket,
        )])
    }
}
