//! Admin: audit trail over the operational streams.

use super::accept;
use smart_ticketing_core::envelope::{Envelope, OutgoingEvent};
use smart_ticketing_core::reaction::{HandlerError, Reaction};
use smart_ticketing_core::topic::Service;

/// Records every envelope it sees and produces nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdminAudit;

impl Reaction for AdminAudit {
    fn service(&self) -> Service {
        Service::Admin
    }

    fn react(&self, envelope: &Envelope) -> Result<Vec<OutgoingEvent>, HandlerError> {
        let (topic, event) = accept(Service::Admin, envelope)?;

        tracing::info!(
            topic = %topic,
            partition = envelope.partition,
            offset = envelope.offset,
            key = envelope.key.as_deref().unwrap_or("<none>"),
            fields = ?event.keys().collect::<Vec<_>>(),
            "Audited event"
        );
        metrics::counter!("choreography_audited_total", "topic" => topic.as_str()).increment(1);
        Ok(Vec::new())
    }
}
