//! Partition-accurate in-memory broker.
//!
//! [`InMemoryEventBus`] keeps one append-only log per `(topic, partition)` and
//! one committed cursor per `(group, topic, partition)`, which is enough to
//! reproduce the delivery properties participants rely on:
//!
//! - envelopes sharing a key land in the same partition, in append order
//! - a new subscription resumes from the group's committed cursor, so anything
//!   not committed is delivered again
//! - a paused partition stops delivering until the subscription is recreated
//!   or the group's partitions are reassigned
//!
//! Every subscription of a group receives every partition; there is no
//! rebalancing between members. [`InMemoryEventBus::reassign`] replays what a
//! rebalance does to a live subscription: pauses are dropped and delivery
//! rewinds to the committed cursors.
//!
//! Failure injection covers the unhappy paths: rejected publishes, publishes
//! that append but lose their acknowledgment, refused subscribes and commits,
//! and a broker outage that ends every open stream.

use smart_ticketing_core::envelope::{Ack, Envelope, Payload, Position, encode};
use smart_ticketing_core::event_bus::{
    BusFuture, DeliveryStream, EventBus, EventBusError, OffsetCommitter, Subscription,
};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Default number of partitions per topic.
pub const DEFAULT_PARTITIONS: i32 = 3;

type Slot = (String, i32);

#[derive(Debug, Default)]
struct Failures {
    skip_publishes: usize,
    publishes: usize,
    lost_acks: usize,
    subscribes: usize,
    commits: usize,
}

#[derive(Debug, Default)]
struct BrokerState {
    logs: HashMap<String, Vec<Vec<Envelope>>>,
    appended: HashMap<String, Vec<Envelope>>,
    committed: HashMap<(String, String, i32), i64>,
    paused: HashSet<(u64, String, i32)>,
    reassignments: u64,
    next_subscription: u64,
    round_robin: i32,
    available: bool,
    generation: u64,
    failures: Failures,
    subscribes: usize,
    disconnects: usize,
}

impl BrokerState {
    fn append(&mut self, partitions: i32, topic: &str, key: Option<&str>, value: Vec<u8>) -> Ack {
        let partition = match key {
            Some(key) => partition_for_key(key, partitions),
            None => {
                self.round_robin = (self.round_robin + 1) % partitions;
                self.round_robin
            },
        };

        let log = self
            .logs
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); slot_count(partitions)]);
        let entries = &mut log[slot_index(partition)];
        let offset = i64::try_from(entries.len()).unwrap_or(i64::MAX);
        let envelope = Envelope::new(topic, key.map(str::to_string), partition, offset, value);

        entries.push(envelope.clone());
        self.appended.entry(topic.to_string()).or_default().push(envelope);

        Ack {
            topic: topic.to_string(),
            partition,
            offset,
        }
    }

    fn committed_cursor(&self, group: &str, topic: &str, partition: i32) -> i64 {
        self.committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
            .unwrap_or(0)
    }

    fn next_envelope(
        &self,
        subscription: u64,
        cursors: &mut HashMap<Slot, i64>,
        slots: &[Slot],
        turn: &mut usize,
    ) -> Option<Envelope> {
        let n = slots.len();
        for step in 0..n {
            let index = (*turn + step) % n;
            let (topic, partition) = &slots[index];
            if self.paused.contains(&(subscription, topic.clone(), *partition)) {
                continue;
            }

            let Some(cursor) = cursors.get_mut(&slots[index]) else {
                continue;
            };
            let found = self
                .logs
                .get(topic)
                .and_then(|log| log.get(slot_index(*partition)))
                .and_then(|entries| entries.get(usize::try_from(*cursor).ok()?));

            if let Some(envelope) = found {
                *cursor += 1;
                *turn = (index + 1) % n;
                return Some(envelope.clone());
            }
        }
        None
    }
}

fn slot_count(partitions: i32) -> usize {
    usize::try_from(partitions).unwrap_or(1)
}

fn slot_index(partition: i32) -> usize {
    usize::try_from(partition).unwrap_or(0)
}

fn partition_for_key(key: &str, partitions: i32) -> i32 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    let buckets = u64::try_from(partitions.max(1)).unwrap_or(1);
    i32::try_from(hasher.finish() % buckets).unwrap_or(0)
}

/// In-memory implementation of [`EventBus`].
///
/// Cloning shares the same broker.
#[derive(Debug, Clone)]
pub struct InMemoryEventBus {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
    partitions: i32,
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventBus {
    /// Create a broker with [`DEFAULT_PARTITIONS`] partitions per topic.
    #[must_use]
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    /// Create a broker with `partitions` partitions per topic.
    #[must_use]
    pub fn with_partitions(partitions: i32) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                available: true,
                ..BrokerState::default()
            })),
            notify: Arc::new(Notify::new()),
            partitions: partitions.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Partition a keyed envelope lands in.
    #[must_use]
    pub fn partition_for(&self, key: &str) -> i32 {
        partition_for_key(key, self.partitions)
    }

    /// Every envelope appended to `topic`, in append order.
    #[must_use]
    pub fn records(&self, topic: &str) -> Vec<Envelope> {
        self.lock().appended.get(topic).cloned().unwrap_or_default()
    }

    /// Append raw value bytes, bypassing schema and producer checks.
    ///
    /// Used to plant malformed messages.
    pub fn append_raw(&self, topic: &str, key: Option<&str>, value: Vec<u8>) -> Ack {
        let ack = self.lock().append(self.partitions, topic, key, value);
        self.notify.notify_waiters();
        ack
    }

    /// Committed next offset of `group` on `(topic, partition)`.
    #[must_use]
    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.lock()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Fail the next `count` publishes without appending.
    pub fn fail_next_publishes(&self, count: usize) {
        self.fail_publishes(0, count);
    }

    /// Let `skip` publishes through, then fail the following `count` without appending.
    pub fn fail_publishes(&self, skip: usize, count: usize) {
        let mut state = self.lock();
        state.failures.skip_publishes = skip;
        state.failures.publishes = count;
    }

    /// Append the next `count` publishes but report them as failed.
    ///
    /// Models a broker acknowledgment lost in transit.
    pub fn lose_next_acks(&self, count: usize) {
        self.lock().failures.lost_acks = count;
    }

    /// Refuse the next `count` subscribe calls.
    pub fn fail_next_subscribes(&self, count: usize) {
        self.lock().failures.subscribes = count;
    }

    /// Refuse the next `count` commits.
    pub fn fail_next_commits(&self, count: usize) {
        self.lock().failures.commits = count;
    }

    /// Simulate a broker outage or recovery.
    ///
    /// Going unavailable ends every open stream with a connection error and
    /// fails every call until the broker is available again.
    pub fn set_available(&self, available: bool) {
        {
            let mut state = self.lock();
            if state.available && !available {
                state.generation += 1;
            }
            state.available = available;
        }
        self.notify.notify_waiters();
    }

    /// Simulate a rebalance that hands every partition back to its owner.
    ///
    /// Open subscriptions lose their pauses and resume from the committed
    /// cursor, so uncommitted envelopes are delivered again.
    pub fn reassign(&self) {
        {
            let mut state = self.lock();
            state.reassignments += 1;
            state.paused.clear();
        }
        self.notify.notify_waiters();
    }

    /// Number of successful subscribe calls.
    #[must_use]
    pub fn subscribe_count(&self) -> usize {
        self.lock().subscribes
    }

    /// Number of `disconnect` calls.
    #[must_use]
    pub fn disconnect_count(&self) -> usize {
        self.lock().disconnects
    }

    fn delivery_stream(
        &self,
        group: String,
        subscription: u64,
        generation: u64,
        slots: Vec<Slot>,
        mut cursors: HashMap<Slot, i64>,
    ) -> DeliveryStream {
        let state = Arc::clone(&self.state);
        let notify = Arc::clone(&self.notify);
        let mut reassignments = self.lock().reassignments;

        Box::pin(async_stream::stream! {
            let mut turn = 0usize;
            loop {
                let notified = notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let (lost, next) = {
                    let state = state.lock().unwrap_or_else(PoisonError::into_inner);
                    if state.reassignments != reassignments {
                        reassignments = state.reassignments;
                        for ((topic, partition), cursor) in &mut cursors {
                            *cursor = state.committed_cursor(&group, topic, *partition);
                        }
                    }
                    if state.generation == generation {
                        (false, state.next_envelope(subscription, &mut cursors, &slots, &mut turn))
                    } else {
                        (true, None)
                    }
                };

                if lost {
                    yield Err(EventBusError::ConnectionFailed("broker became unavailable".to_string()));
                    break;
                }
                match next {
                    Some(envelope) => yield Ok(envelope),
                    None => notified.await,
                }
            }
        })
    }
}

impl EventBus for InMemoryEventBus {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        key: Option<&'a str>,
        payload: &'a Payload,
    ) -> BusFuture<'a, Ack> {
        Box::pin(async move {
            let result = {
                let mut state = self.lock();
                if !state.available {
                    Err(EventBusError::DeliveryFailed {
                        topic: topic.to_string(),
                        reason: "broker unavailable".to_string(),
                    })
                } else if state.failures.skip_publishes == 0 && state.failures.publishes > 0 {
                    state.failures.publishes -= 1;
                    Err(EventBusError::DeliveryFailed {
                        topic: topic.to_string(),
                        reason: "injected publish failure".to_string(),
                    })
                } else {
                    state.failures.skip_publishes = state.failures.skip_publishes.saturating_sub(1);
                    let ack = state.append(self.partitions, topic, key, encode(payload));
                    if state.failures.lost_acks > 0 {
                        state.failures.lost_acks -= 1;
                        Err(EventBusError::DeliveryFailed {
                            topic: topic.to_string(),
                            reason: "acknowledgment lost".to_string(),
                        })
                    } else {
                        Ok(ack)
                    }
                }
            };
            self.notify.notify_waiters();
            result
        })
    }

    fn subscribe<'a>(&'a self, group: &'a str, topics: &'a [&'a str]) -> BusFuture<'a, Subscription> {
        Box::pin(async move {
            let (subscription, generation, slots, cursors) = {
                let mut state = self.lock();
                let refuse = |reason: &str| EventBusError::SubscriptionFailed {
                    group: group.to_string(),
                    topics: topics.iter().map(ToString::to_string).collect(),
                    reason: reason.to_string(),
                };

                if !state.available {
                    return Err(EventBusError::ConnectionFailed("broker unavailable".to_string()));
                }
                if topics.is_empty() {
                    return Err(refuse("no topics"));
                }
                if state.failures.subscribes > 0 {
                    state.failures.subscribes -= 1;
                    return Err(refuse("injected subscribe failure"));
                }

                let slots: Vec<Slot> = topics
                    .iter()
                    .flat_map(|topic| (0..self.partitions).map(move |p| ((*topic).to_string(), p)))
                    .collect();
                let cursors = slots
                    .iter()
                    .map(|(topic, p)| ((topic.clone(), *p), state.committed_cursor(group, topic, *p)))
                    .collect();

                state.next_subscription += 1;
                state.subscribes += 1;
                (state.next_subscription, state.generation, slots, cursors)
            };

            tracing::debug!(group, ?topics, subscription, "In-memory subscription created");

            Ok(Subscription {
                group: group.to_string(),
                stream: self.delivery_stream(group.to_string(), subscription, generation, slots, cursors),
                committer: Arc::new(InMemoryCommitter {
                    group: group.to_string(),
                    subscription,
                    state: Arc::clone(&self.state),
                    notify: Arc::clone(&self.notify),
                }),
            })
        })
    }

    fn disconnect(&self) -> BusFuture<'_, ()> {
        Box::pin(async move {
            self.lock().disconnects += 1;
            Ok(())
        })
    }
}

struct InMemoryCommitter {
    group: String,
    subscription: u64,
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl OffsetCommitter for InMemoryCommitter {
    fn commit(&self, position: &Position) -> BusFuture<'_, ()> {
        let position = position.clone();
        Box::pin(async move {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if !state.available {
                return Err(EventBusError::CommitFailed {
                    position,
                    reason: "broker unavailable".to_string(),
                });
            }
            if state.failures.commits > 0 {
                state.failures.commits -= 1;
                return Err(EventBusError::CommitFailed {
                    position,
                    reason: "injected commit failure".to_string(),
                });
            }

            state.committed.insert(
                (self.group.clone(), position.topic.clone(), position.partition),
                position.offset + 1,
            );
            Ok(())
        })
    }

    fn pause(&self, topic: &str, partition: i32) -> Result<(), EventBusError> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .paused
            .insert((self.subscription, topic.to_string(), partition));
        self.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn keys_map_to_stable_partitions() {
        let bus = InMemoryEventBus::new();
        let first = bus.partition_for("ticket-1");
        assert_eq!(first, bus.partition_for("ticket-1"));
        assert!((0..DEFAULT_PARTITIONS).contains(&first));
    }

    #[tokio::test]
    async fn keyed_appends_share_a_partition() {
        let bus = InMemoryEventBus::new();
        let payload = Payload::new();
        let a = bus.publish("trips.updated", Some("trip-101"), &payload).await.unwrap();
        let b = bus.publish("trips.updated", Some("trip-101"), &payload).await.unwrap();

        assert_eq!(a.partition, b.partition);
        assert_eq!(b.offset, a.offset + 1);
    }

    #[tokio::test]
    async fn subscription_resumes_from_commit() {
        let bus = InMemoryEventBus::with_partitions(1);
        for _ in 0..3 {
            bus.append_raw("tickets.validated", Some("t"), b"{}".to_vec());
        }

        let mut sub = bus.subscribe("g", &["tickets.validated"]).await.unwrap();
        let first = sub.stream.next().await.unwrap().unwrap();
        sub.committer.commit(&first.position()).await.unwrap();
        drop(sub);

        let mut again = bus.subscribe("g", &["tickets.validated"]).await.unwrap();
        let next = again.stream.next().await.unwrap().unwrap();
        assert_eq!(next.offset, 1);
        assert_eq!(bus.committed_offset("g", "tickets.validated", 0), Some(1));
    }

    #[tokio::test]
    async fn outage_ends_streams() {
        let bus = InMemoryEventBus::new();
        let mut sub = bus.subscribe("g", &["trips.updated"]).await.unwrap();
        bus.set_available(false);

        assert!(matches!(
            sub.stream.next().await,
            Some(Err(EventBusError::ConnectionFailed(_)))
        ));
        assert!(sub.stream.next().await.is_none());
        assert!(bus.subscribe("g", &["trips.updated"]).await.is_err());
    }
}
