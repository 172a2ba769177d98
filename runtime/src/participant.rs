//! Turns a pure [`Reaction`] into an envelope handler.
//!
//! For each delivered envelope the participant:
//!
//! 1. skips it if the idempotency ledger already holds its identity
//! 2. runs the reaction
//! 3. publishes every outgoing event, waiting for each acknowledgment
//! 4. records the identity in the ledger
//!
//! The subscriber commits only after this returns, so an outgoing event is
//! always acknowledged before the envelope that caused it is committed.
//!
//! When a publish fails halfway through a multi-event reaction, the number of
//! acknowledged outputs is kept per log position. The retry resumes after the
//! last acknowledged output instead of appending the earlier ones again.
//! That progress is bounded: positions abandoned by a paused partition or an
//! interrupted shutdown are forgotten oldest first.

use crate::idempotency::{IdempotencyKey, IdempotencyLedger, InMemoryLedger};
use crate::publisher::Publisher;
use crate::subscriber::{EnvelopeHandler, Handled, Subscriber};
use async_trait::async_trait;
use smart_ticketing_core::envelope::{Envelope, Position};
use smart_ticketing_core::event_bus::EventBus;
use smart_ticketing_core::reaction::{HandlerError, Reaction};
use smart_ticketing_core::topic::Service;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::debug;

/// Positions whose partial publication is remembered at once.
const PROGRESS_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct Progress {
    acknowledged: HashMap<Position, usize>,
    order: VecDeque<Position>,
}

/// A reaction wired to a publisher and an idempotency ledger.
pub struct Participant<R: Reaction> {
    reaction: R,
    publisher: Publisher,
    ledger: Arc<dyn IdempotencyLedger>,
    progress: Mutex<Progress>,
    progress_capacity: usize,
}

impl<R: Reaction> Participant<R> {
    /// Wrap `reaction`, publishing its outputs through `publisher`.
    ///
    /// Uses an [`InMemoryLedger`] with default capacity.
    #[must_use]
    pub fn new(reaction: R, publisher: Publisher) -> Self {
        Self {
            reaction,
            publisher,
            ledger: Arc::new(InMemoryLedger::default()),
            progress: Mutex::new(Progress::default()),
            progress_capacity: PROGRESS_CAPACITY,
        }
    }

    /// Use a specific idempotency ledger.
    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<dyn IdempotencyLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    /// The business role this participant plays.
    #[must_use]
    pub fn service(&self) -> Service {
        self.reaction.service()
    }

    /// Build a subscriber on the role's consumer group and registry topics.
    #[must_use]
    pub fn into_subscriber(self, bus: Arc<dyn EventBus>, shutdown: broadcast::Receiver<()>) -> Subscriber {
        let service = self.service();
        let topics = service.consumes().iter().map(ToString::to_string).collect();
        Subscriber::new(service.consumer_group(), topics, bus, Arc::new(self), shutdown)
    }

    fn acknowledged_outputs(&self, position: &Position) -> usize {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .acknowledged
            .get(position)
            .copied()
            .unwrap_or(0)
    }

    fn set_acknowledged_outputs(&self, position: &Position, count: usize) {
        let mut progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
        if progress.acknowledged.insert(position.clone(), count).is_some() {
            return;
        }
        progress.order.push_back(position.clone());

        while progress.order.len() > self.progress_capacity {
            if let Some(oldest) = progress.order.pop_front() {
                progress.acknowledged.remove(&oldest);
            }
        }
    }

    fn forget_progress(&self, position: &Position) {
        let mut progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
        if progress.acknowledged.remove(position).is_some() {
            progress.order.retain(|p| p != position);
        }
    }

    async fn react_and_publish(&self, envelope: &Envelope, position: &Position) -> Result<(), HandlerError> {
        let outputs = self.reaction.react(envelope)?;
        let already_sent = self.acknowledged_outputs(position);

        for (index, event) in outputs.iter().enumerate().skip(already_sent) {
            self.publisher.send(event).await?;
            self.set_acknowledged_outputs(position, index + 1);
        }
        Ok(())
    }
}

#[async_trait]
impl<R: Reaction> EnvelopeHandler for Participant<R> {
    async fn handle(&self, envelope: &Envelope) -> Result<Handled, HandlerError> {
        let identity = IdempotencyKey::for_envelope(envelope);
        if self.ledger.contains(&identity) {
            debug!(
                service = %self.service(),
                position = %envelope.position(),
                identity = %identity,
                "Duplicate envelope, already handled"
            );
            return Ok(Handled::Duplicate);
        }

        let position = envelope.position();
        match self.react_and_publish(envelope, &position).await {
            Ok(()) => {
                self.ledger.record(identity);
                self.forget_progress(&position);
                Ok(Handled::Processed)
            },
            Err(e) => {
                if e.is_poison() {
                    self.forget_progress(&position);
                }
                Err(e)
            },
        }
    }
}
