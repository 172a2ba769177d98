//! Consumer-group delivery loop with per-partition ordering.
//!
//! A [`Subscriber`] joins one consumer group, hands every envelope to an
//! [`EnvelopeHandler`] and commits the envelope's position only after the
//! handler finished. Anything not committed is redelivered, which makes
//! delivery at-least-once.
//!
//! # Pattern: Subscribe, Dispatch, Reconnect
//!
//! ```text
//! loop {
//!     subscribe (group, topics)
//!         for each envelope:
//!             route to the worker for (topic, partition)
//!     stream ended or failed:
//!         drain workers, back off, resubscribe
//! }
//!
//! worker (topic, partition), strictly sequential:
//!     handle ─► Ok ─────────────────────────────► commit
//!            └► poison ─► dead letter ──────────► commit
//!            └► transient ─► backoff, retry ─► … exhausted ─► pause partition
//! ```
//!
//! One worker task per partition keeps envelopes sharing a key in order
//! while unrelated partitions proceed in parallel. A partition whose handler
//! exhausted its retries stops at the failed offset: later envelopes from it
//! are discarded uncommitted. The partition resumes when the broker rewinds it
//! to the failed offset, which happens when a rebalance reassigns it or the
//! subscription is recreated.
//!
//! # Shutdown
//!
//! On the shutdown signal the subscriber stops fetching, lets in-flight
//! handlers finish within the grace period, aborts whatever is left and
//! releases the subscription. Queued envelopes are not started; they were
//! never committed, so the group redelivers them.

use crate::dead_letter::{DeadLetter, DeadLetterQueue, DeadLetterSink};
use crate::metrics::{ChoreographyMetrics, EnvelopeOutcome};
use crate::retry::RetryPolicy;
use crate::{HealthCheck, HealthStatus};
use async_trait::async_trait;
use futures::StreamExt;
use smart_ticketing_core::envelope::{Envelope, Position};
use smart_ticketing_core::event_bus::{EventBus, OffsetCommitter, Subscription};
use smart_ticketing_core::reaction::HandlerError;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What a handler did with an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// The envelope was processed and its effects are durable
    Processed,
    /// The envelope had already been processed; nothing was done
    Duplicate,
}

/// Processes envelopes delivered to a [`Subscriber`].
///
/// The subscriber commits only after `handle` returns, so every side effect
/// the handler needs must be complete (and acknowledged) by then.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    /// Handle one envelope.
    ///
    /// # Errors
    ///
    /// Poison errors ([`HandlerError::is_poison`]) are dead-lettered and
    /// committed past. Everything else is retried.
    async fn handle(&self, envelope: &Envelope) -> Result<Handled, HandlerError>;
}

/// Shared view of a subscriber's state.
#[derive(Debug, Clone)]
pub struct SubscriberHealth {
    group: String,
    state: Arc<Mutex<HealthState>>,
}

#[derive(Debug, Default)]
struct HealthState {
    connected: bool,
    paused: BTreeSet<(String, i32)>,
    last_error: Option<String>,
}

impl SubscriberHealth {
    fn new(group: &str) -> Self {
        Self {
            group: group.to_string(),
            state: Arc::new(Mutex::new(HealthState::default())),
        }
    }

    fn update<T>(&self, f: impl FnOnce(&mut HealthState) -> T) -> T {
        f(&mut self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn set_connected(&self, connected: bool, error: Option<String>) {
        self.update(|state| {
            state.connected = connected;
            if error.is_some() {
                state.last_error = error;
            }
        });
    }

    fn mark_paused(&self, topic: &str, partition: i32) {
        let count = self.update(|state| {
            state.paused.insert((topic.to_string(), partition));
            state.paused.len()
        });
        ChoreographyMetrics::record_paused_partitions(count);
    }

    fn mark_resumed(&self, topic: &str, partition: i32) {
        let count = self.update(|state| {
            state.paused.remove(&(topic.to_string(), partition));
            state.paused.len()
        });
        ChoreographyMetrics::record_paused_partitions(count);
    }

    fn clear_paused(&self) {
        self.update(|state| state.paused.clear());
        ChoreographyMetrics::record_paused_partitions(0);
    }

    /// Whether the subscriber currently holds a subscription.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.update(|state| state.connected)
    }

    /// Partitions halted after exhausting retries.
    #[must_use]
    pub fn paused_partitions(&self) -> Vec<(String, i32)> {
        self.update(|state| state.paused.iter().cloned().collect())
    }

    /// Current health of this subscriber.
    #[must_use]
    pub fn check(&self) -> HealthCheck {
        self.update(|state| {
            let mut check = if !state.connected {
                HealthCheck::unhealthy(
                    &self.group,
                    state.last_error.clone().unwrap_or_else(|| "not subscribed".to_string()),
                )
            } else if state.paused.is_empty() {
                HealthCheck::healthy(&self.group)
            } else {
                HealthCheck::degraded(
                    &self.group,
                    format!("{} partition(s) paused", state.paused.len()),
                )
            };

            for (topic, partition) in &state.paused {
                check = check.with_metadata("paused", format!("{topic}[{partition}]"));
            }
            check
        })
    }

    /// Shorthand for `check().status`.
    #[must_use]
    pub fn status(&self) -> HealthStatus {
        self.check().status
    }
}

/// Consumer-group subscriber.
///
/// `Subscriber` is `Send` so it can be moved into a tokio task via [`Subscriber::spawn`].
pub struct Subscriber {
    group: String,
    topics: Vec<String>,
    bus: Arc<dyn EventBus>,
    handler: Arc<dyn EnvelopeHandler>,
    shutdown: broadcast::Receiver<()>,
    retry_policy: RetryPolicy,
    reconnect_policy: RetryPolicy,
    shutdown_grace: Duration,
    partition_buffer: usize,
    dead_letters: Arc<dyn DeadLetterSink>,
    health: SubscriberHealth,
}

enum StreamOutcome {
    Shutdown,
    Ended,
}

impl Subscriber {
    /// Create a subscriber for `group` on `topics`.
    ///
    /// Defaults: 3 handler retries starting at 100ms, reconnect backoff from
    /// 500ms up to 30s, 10s shutdown grace, 64 envelopes buffered per partition.
    #[must_use]
    pub fn new(
        group: impl Into<String>,
        topics: Vec<String>,
        bus: Arc<dyn EventBus>,
        handler: Arc<dyn EnvelopeHandler>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let group = group.into();
        let health = SubscriberHealth::new(&group);
        Self {
            group,
            topics,
            bus,
            handler,
            shutdown,
            retry_policy: RetryPolicy::default(),
            reconnect_policy: RetryPolicy::builder()
                .initial_delay(Duration::from_millis(500))
                .max_delay(Duration::from_secs(30))
                .jitter(0.1)
                .build(),
            shutdown_grace: Duration::from_secs(10),
            partition_buffer: 64,
            dead_letters: Arc::new(DeadLetterQueue::default()),
            health,
        }
    }

    /// Set how a failing envelope is redelivered before its partition pauses.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the backoff between resubscription attempts.
    ///
    /// `max_retries` is ignored: a subscriber keeps reconnecting until shutdown.
    #[must_use]
    pub fn with_reconnect_policy(mut self, policy: RetryPolicy) -> Self {
        self.reconnect_policy = policy;
        self
    }

    /// Set how long in-flight handlers may run after shutdown.
    #[must_use]
    pub const fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Set how many envelopes may queue per partition.
    #[must_use]
    pub fn with_partition_buffer(mut self, buffer: usize) -> Self {
        self.partition_buffer = buffer.max(1);
        self
    }

    /// Set where poison messages are recorded.
    #[must_use]
    pub fn with_dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = sink;
        self
    }

    /// Consumer group id.
    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Handle for observing this subscriber after it was spawned.
    #[must_use]
    pub fn health_handle(&self) -> SubscriberHealth {
        self.health.clone()
    }

    /// Spawn the subscriber as a background task.
    ///
    /// The task runs until the shutdown signal fires.
    #[must_use]
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&mut self) {
        info!(group = %self.group, topics = ?self.topics, "Subscriber started");
        let mut failures = 0usize;

        loop {
            let topics: Vec<&str> = self.topics.iter().map(String::as_str).collect();

            let subscribed = tokio::select! {
                _ = self.shutdown.recv() => break,
                result = self.bus.subscribe(&self.group, &topics) => result,
            };

            match subscribed {
                Ok(subscription) => {
                    failures = 0;
                    info!(group = %self.group, topics = ?self.topics, "Subscribed");
                    self.health.set_connected(true, None);

                    let outcome = self.consume(subscription).await;
                    self.health.set_connected(false, None);
                    self.health.clear_paused();

                    if matches!(outcome, StreamOutcome::Shutdown) {
                        break;
                    }
                },
                Err(e) => {
                    failures += 1;
                    self.health.set_connected(false, Some(e.to_string()));
                    error!(group = %self.group, error = %e, attempt = failures, "Subscribe failed");
                },
            }

            let delay = self.reconnect_policy.backoff(failures);
            warn!(group = %self.group, delay_ms = delay.as_millis(), "Resubscribing after delay");
            tokio::select! {
                _ = self.shutdown.recv() => break,
                () = tokio::time::sleep(delay) => {},
            }
        }

        info!(group = %self.group, "Subscriber stopped");
    }

    async fn consume(&mut self, subscription: Subscription) -> StreamOutcome {
        let Subscription {
            group,
            mut stream,
            committer,
        } = subscription;
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut senders: HashMap<(String, i32), mpsc::Sender<Envelope>> = HashMap::new();
        let mut workers: Vec<JoinHandle<()>> = Vec::new();

        let outcome = loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(group = %group, "Shutdown signal received, draining in-flight handlers");
                    break StreamOutcome::Shutdown;
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(envelope)) => {
                            let route = (envelope.topic.clone(), envelope.partition);
                            let sender = senders.entry(route).or_insert_with(|| {
                                let (tx, rx) = mpsc::channel(self.partition_buffer);
                                let worker = PartitionWorker {
                                    group: group.clone(),
                                    topic: envelope.topic.clone(),
                                    partition: envelope.partition,
                                    handler: Arc::clone(&self.handler),
                                    committer: Arc::clone(&committer),
                                    dead_letters: Arc::clone(&self.dead_letters),
                                    retry_policy: self.retry_policy.clone(),
                                    health: self.health.clone(),
                                    stop: stop_rx.clone(),
                                };
                                workers.push(tokio::spawn(worker.run(rx)));
                                tx
                            });

                            let position = envelope.position();
                            tokio::select! {
                                _ = self.shutdown.recv() => {
                                    info!(group = %group, "Shutdown signal received, draining in-flight handlers");
                                    break StreamOutcome::Shutdown;
                                }
                                sent = sender.send(envelope) => {
                                    if sent.is_err() {
                                        warn!(group = %group, position = %position, "Partition worker gone, envelope left for redelivery");
                                    }
                                }
                            }
                        }
                        Some(Err(e)) => {
                            ChoreographyMetrics::record_stream_error();
                            warn!(group = %group, error = %e, "Error receiving from broker");
                            if !e.is_transient() {
                                break StreamOutcome::Ended;
                            }
                        }
                        None => {
                            warn!(group = %group, "Delivery stream ended");
                            break StreamOutcome::Ended;
                        }
                    }
                }
            }
        };

        stop_tx.send_replace(true);
        drop(senders);

        let deadline = tokio::time::Instant::now() + self.shutdown_grace;
        for mut worker in workers {
            if tokio::time::timeout_at(deadline, &mut worker).await.is_err() {
                warn!(group = %group, "Handler still running after grace period, aborting");
                worker.abort();
            }
        }

        drop(stream);
        debug!(group = %group, "Subscription released");
        outcome
    }
}

enum Disposition {
    Committed,
    Paused,
    Interrupted,
}

struct PartitionWorker {
    group: String,
    topic: String,
    partition: i32,
    handler: Arc<dyn EnvelopeHandler>,
    committer: Arc<dyn OffsetCommitter>,
    dead_letters: Arc<dyn DeadLetterSink>,
    retry_policy: RetryPolicy,
    health: SubscriberHealth,
    stop: watch::Receiver<bool>,
}

impl PartitionWorker {
    async fn run(mut self, mut inbox: mpsc::Receiver<Envelope>) {
        let mut paused_at: Option<i64> = None;

        while let Some(envelope) = inbox.recv().await {
            if *self.stop.borrow() {
                break;
            }
            if let Some(failed) = paused_at {
                // Offsets past the failed one were fetched before the pause took effect.
                if envelope.offset > failed {
                    debug!(
                        group = %self.group,
                        position = %envelope.position(),
                        "Partition paused, leaving envelope uncommitted"
                    );
                    continue;
                }
                info!(
                    group = %self.group,
                    position = %envelope.position(),
                    "Partition rewound to the failed offset, resuming"
                );
                self.health.mark_resumed(&self.topic, self.partition);
                paused_at = None;
            }

            match self.process(&envelope).await {
                Disposition::Committed => {},
                Disposition::Paused => paused_at = Some(envelope.offset),
                Disposition::Interrupted => break,
            }
        }
    }

    async fn process(&mut self, envelope: &Envelope) -> Disposition {
        let position = envelope.position();
        let mut attempt = 0;

        loop {
            let started = Instant::now();
            match self.handler.handle(envelope).await {
                Ok(handled) => {
                    let outcome = match handled {
                        Handled::Processed => EnvelopeOutcome::Acknowledged,
                        Handled::Duplicate => EnvelopeOutcome::Duplicate,
                    };
                    ChoreographyMetrics::record_envelope(&self.topic, outcome, started.elapsed());
                    debug!(group = %self.group, position = %position, ?handled, "Envelope handled");
                    self.commit(&position).await;
                    return Disposition::Committed;
                },
                Err(e) if e.is_poison() => {
                    ChoreographyMetrics::record_envelope(
                        &self.topic,
                        EnvelopeOutcome::Rejected,
                        started.elapsed(),
                    );
                    self.dead_letters.record(DeadLetter::new(&self.group, envelope, e.to_string()));
                    self.commit(&position).await;
                    return Disposition::Committed;
                },
                Err(e) if attempt >= self.retry_policy.max_retries => {
                    ChoreographyMetrics::record_envelope(
                        &self.topic,
                        EnvelopeOutcome::Failed,
                        started.elapsed(),
                    );
                    error!(
                        group = %self.group,
                        position = %position,
                        attempts = attempt + 1,
                        error = %e,
                        "Handler exhausted retries, pausing partition"
                    );
                    if let Err(pause_err) = self.committer.pause(&self.topic, self.partition) {
                        warn!(group = %self.group, error = %pause_err, "Failed to pause partition");
                    }
                    self.health.mark_paused(&self.topic, self.partition);
                    return Disposition::Paused;
                },
                Err(e) => {
                    ChoreographyMetrics::record_envelope(
                        &self.topic,
                        EnvelopeOutcome::Failed,
                        started.elapsed(),
                    );
                    ChoreographyMetrics::record_retry(&self.topic);
                    let delay = self.retry_policy.backoff(attempt);
                    warn!(
                        group = %self.group,
                        position = %position,
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Handler failed, retrying"
                    );
                    attempt += 1;

                    tokio::select! {
                        () = tokio::time::sleep(delay) => {},
                        _ = self.stop.changed() => return Disposition::Interrupted,
                    }
                },
            }
        }
    }

    async fn commit(&self, position: &Position) {
        if let Err(e) = self.committer.commit(position).await {
            ChoreographyMetrics::record_commit_error(&position.topic);
            warn!(
                group = %self.group,
                position = %position,
                error = %e,
                "Commit failed, envelope will be redelivered"
            );
        }
    }
}
