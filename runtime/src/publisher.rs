//! Appending envelopes on behalf of one producer.
//!
//! A [`Publisher`] is bound to a producer identity and refuses to append to
//! topics outside that identity's producible set, so a participant can only
//! speak on the streams the registry assigns to it.

use crate::metrics::ChoreographyMetrics;
use crate::retry::{RetryPolicy, retry_with_predicate};
use smart_ticketing_core::envelope::{Ack, OutgoingEvent, Payload};
use smart_ticketing_core::event_bus::{EventBus, EventBusError};
use smart_ticketing_core::topic::{Producer, Service, Topic};
use std::sync::Arc;
use std::time::Instant;

/// Producer-scoped handle on the event bus.
#[derive(Clone)]
pub struct Publisher {
    producer: Producer,
    bus: Arc<dyn EventBus>,
}

impl Publisher {
    /// Create a publisher for `producer`.
    #[must_use]
    pub fn new(producer: Producer, bus: Arc<dyn EventBus>) -> Self {
        Self { producer, bus }
    }

    /// Publisher for a participant service.
    #[must_use]
    pub fn for_service(service: Service, bus: Arc<dyn EventBus>) -> Self {
        Self::new(Producer::Service(service), bus)
    }

    /// Publisher for stimuli that originate outside the system.
    #[must_use]
    pub fn external(bus: Arc<dyn EventBus>) -> Self {
        Self::new(Producer::External, bus)
    }

    /// Identity this publisher appends as.
    #[must_use]
    pub const fn producer(&self) -> Producer {
        self.producer
    }

    /// Append `payload` to `topic` under `key`.
    ///
    /// Completes only after the broker acknowledged the append.
    ///
    /// # Errors
    ///
    /// - [`EventBusError::NotProducible`] if this producer may not append to `topic`
    /// - [`EventBusError::MalformedPayload`] if the payload violates the topic schema
    /// - [`EventBusError::DeliveryFailed`] if the outcome is unknown (may have been appended)
    pub async fn publish(
        &self,
        topic: Topic,
        key: Option<&str>,
        payload: &Payload,
    ) -> Result<Ack, EventBusError> {
        if !self.producer.can_produce(topic) {
            return Err(EventBusError::NotProducible {
                producer: self.producer.to_string(),
                topic: topic.to_string(),
            });
        }
        topic.validate(payload)?;

        let started = Instant::now();
        match self.bus.publish(topic.as_str(), key, payload).await {
            Ok(ack) => {
                ChoreographyMetrics::record_publish(topic.as_str(), started.elapsed());
                tracing::debug!(
                    producer = %self.producer,
                    topic = %topic,
                    key = key.unwrap_or("<none>"),
                    partition = ack.partition,
                    offset = ack.offset,
                    "Published"
                );
                Ok(ack)
            },
            Err(e) => {
                ChoreographyMetrics::record_publish_error(topic.as_str());
                tracing::warn!(
                    producer = %self.producer,
                    topic = %topic,
                    key = key.unwrap_or("<none>"),
                    error = %e,
                    "Publish failed"
                );
                Err(e)
            },
        }
    }

    /// Append an outgoing event.
    ///
    /// # Errors
    ///
    /// See [`Publisher::publish`].
    pub async fn send(&self, event: &OutgoingEvent) -> Result<Ack, EventBusError> {
        self.publish(event.topic, event.key.as_deref(), &event.payload).await
    }

    /// Append an outgoing event, retrying transient failures.
    ///
    /// A retry after an unknown outcome may append a duplicate; consumers
    /// deduplicate.
    ///
    /// # Errors
    ///
    /// Returns the first permanent error, or the last transient one once the
    /// policy is exhausted.
    pub async fn send_with_retry(
        &self,
        event: &OutgoingEvent,
        policy: &RetryPolicy,
    ) -> Result<Ack, EventBusError> {
        retry_with_predicate(policy, || self.send(event), EventBusError::is_transient).await
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher").field("producer", &self.producer).finish_non_exhaustive()
    }
}
