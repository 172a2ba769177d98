//! Delivery loop behavior against the in-memory broker.

#![allow(clippy::unwrap_used)]

use async_trait::async_trait;
use serde_json::json;
use smart_ticketing_core::envelope::{Envelope, MalformedPayloadError};
use smart_ticketing_core::event_bus::EventBus;
use smart_ticketing_core::reaction::HandlerError;
use smart_ticketing_runtime::{
    DeadLetterQueue, EnvelopeHandler, Handled, HealthStatus, RetryPolicy, Subscriber,
};
use smart_ticketing_testing::InMemoryEventBus;
use smart_ticketing_testing::helpers::{init_test_tracing, json_payload, wait_until};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

const GROUP: &str = "notification-service-group";
const TOPIC: &str = "trips.updated";
const WAIT: Duration = Duration::from_secs(3);

type Decide = dyn Fn(&Envelope, usize) -> Result<Handled, HandlerError> + Send + Sync;

/// Records every attempt and lets each test decide the outcome.
struct Scripted {
    attempts: AtomicUsize,
    handled: Mutex<Vec<Envelope>>,
    delay: Duration,
    decide: Box<Decide>,
}

impl Scripted {
    fn new(decide: impl Fn(&Envelope, usize) -> Result<Handled, HandlerError> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            attempts: AtomicUsize::new(0),
            handled: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            decide: Box::new(decide),
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            attempts: AtomicUsize::new(0),
            handled: Mutex::new(Vec::new()),
            delay,
            decide: Box::new(|_, _| Ok(Handled::Processed)),
        })
    }

    fn accepting() -> Arc<Self> {
        Self::new(|_, _| Ok(Handled::Processed))
    }

    fn handled(&self) -> Vec<Envelope> {
        self.handled.lock().unwrap().clone()
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EnvelopeHandler for Scripted {
    async fn handle(&self, envelope: &Envelope) -> Result<Handled, HandlerError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let outcome = (self.decide)(envelope, attempt);
        if outcome.is_ok() {
            self.handled.lock().unwrap().push(envelope.clone());
        }
        outcome
    }
}

fn fast_retries(max_retries: usize) -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(max_retries)
        .initial_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(5))
        .build()
}

fn subscriber(
    bus: &Arc<InMemoryEventBus>,
    handler: Arc<Scripted>,
    shutdown: broadcast::Receiver<()>,
) -> Subscriber {
    let bus: Arc<dyn EventBus> = bus.clone();
    Subscriber::new(GROUP, vec![TOPIC.to_string()], bus, handler, shutdown)
        .with_retry_policy(fast_retries(2))
        .with_reconnect_policy(fast_retries(0))
        .with_shutdown_grace(Duration::from_millis(200))
}

async fn publish_trip(bus: &InMemoryEventBus, trip: u64, status: &str) {
    let payload = json_payload(json!({ "tripId": trip, "status": status }));
    bus.publish(TOPIC, Some(&format!("trip-{trip}")), &payload).await.unwrap();
}

#[tokio::test]
async fn commits_each_envelope_after_handling() {
    init_test_tracing();
    let bus = Arc::new(InMemoryEventBus::with_partitions(1));
    let handler = Scripted::accepting();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    for status in ["DELAYED", "DEPARTED", "ARRIVED"] {
        publish_trip(&bus, 101, status).await;
    }

    let task = subscriber(&bus, handler.clone(), shutdown_rx).spawn();
    assert!(wait_until(WAIT, || bus.committed_offset(GROUP, TOPIC, 0) == Some(3)).await);

    let statuses: Vec<_> = handler
        .handled()
        .iter()
        .map(|e| e.payload().unwrap()["status"].clone())
        .collect();
    assert_eq!(statuses, vec![json!("DELAYED"), json!("DEPARTED"), json!("ARRIVED")]);

    shutdown_tx.send(()).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn keeps_order_per_key_across_partitions() {
    let bus = Arc::new(InMemoryEventBus::new());
    let handler = Scripted::accepting();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = subscriber(&bus, handler.clone(), shutdown_rx).spawn();

    for step in 0..5 {
        for trip in [101, 102, 103, 104] {
            publish_trip(&bus, trip, &format!("STEP-{step}")).await;
        }
    }

    assert!(wait_until(WAIT, || handler.handled().len() == 20).await);
    for trip in ["trip-101", "trip-102", "trip-103", "trip-104"] {
        let offsets: Vec<_> = handler
            .handled()
            .into_iter()
            .filter(|e| e.key.as_deref() == Some(trip))
            .map(|e| e.offset)
            .collect();
        let mut sorted = offsets.clone();
        sorted.sort_unstable();
        assert_eq!(offsets, sorted, "{trip} delivered out of order");
        assert_eq!(offsets.len(), 5);
    }

    let _ = shutdown_tx.send(());
    task.await.unwrap();
}

#[tokio::test]
async fn poison_message_is_dead_lettered_and_skipped() {
    let bus = Arc::new(InMemoryEventBus::with_partitions(1));
    let handler = Scripted::new(|envelope, _| {
        envelope.payload()?;
        Ok(Handled::Processed)
    });
    let dead_letters = DeadLetterQueue::new(10);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    bus.append_raw(TOPIC, Some("trip-101"), b"not json".to_vec());
    publish_trip(&bus, 101, "DELAYED").await;

    let task = subscriber(&bus, handler.clone(), shutdown_rx)
        .with_dead_letters(Arc::new(dead_letters.clone()))
        .spawn();

    assert!(wait_until(WAIT, || bus.committed_offset(GROUP, TOPIC, 0) == Some(2)).await);
    assert_eq!(dead_letters.len(), 1);
    assert_eq!(dead_letters.peek().unwrap().position.offset, 0);
    assert_eq!(handler.handled().len(), 1);
    // Poison is never retried.
    assert_eq!(handler.attempts(), 2);

    let _ = shutdown_tx.send(());
    task.await.unwrap();
}

#[tokio::test]
async fn transient_failures_are_retried_before_commit() {
    let bus = Arc::new(InMemoryEventBus::with_partitions(1));
    let handler = Scripted::new(|_, attempt| {
        if attempt < 2 {
            Err(HandlerError::Transient("downstream unavailable".to_string()))
        } else {
            Ok(Handled::Processed)
        }
    });
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    publish_trip(&bus, 101, "DELAYED").await;

    let task = subscriber(&bus, handler.clone(), shutdown_rx).spawn();

    assert!(wait_until(WAIT, || bus.committed_offset(GROUP, TOPIC, 0) == Some(1)).await);
    assert_eq!(handler.attempts(), 3);

    let _ = shutdown_tx.send(());
    task.await.unwrap();
}

#[tokio::test]
async fn exhausted_retries_pause_the_partition() {
    let bus = Arc::new(InMemoryEventBus::with_partitions(1));
    let handler = Scripted::new(|envelope, _| {
        if envelope.offset == 0 {
            Err(HandlerError::Transient("still failing".to_string()))
        } else {
            Ok(Handled::Processed)
        }
    });
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    publish_trip(&bus, 101, "DELAYED").await;
    publish_trip(&bus, 101, "DEPARTED").await;

    let subscriber = subscriber(&bus, handler.clone(), shutdown_rx);
    let health = subscriber.health_handle();
    let task = subscriber.spawn();

    assert!(wait_until(WAIT, || health.status() == HealthStatus::Degraded).await);
    assert_eq!(health.paused_partitions(), vec![(TOPIC.to_string(), 0)]);
    assert_eq!(handler.attempts(), 3);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(handler.handled().is_empty(), "later envelope overtook the failed one");
    assert_eq!(bus.committed_offset(GROUP, TOPIC, 0), None);

    let _ = shutdown_tx.send(());
    task.await.unwrap();
}

#[tokio::test]
async fn reassigned_partition_resumes_from_the_failed_offset() {
    let bus = Arc::new(InMemoryEventBus::with_partitions(1));
    let healed = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&healed);
    let handler = Scripted::new(move |envelope, _| {
        if envelope.offset == 0 && !flag.load(Ordering::SeqCst) {
            Err(HandlerError::Transient("downstream unavailable".to_string()))
        } else {
            Ok(Handled::Processed)
        }
    });
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    publish_trip(&bus, 101, "DELAYED").await;
    publish_trip(&bus, 101, "DEPARTED").await;

    let subscriber = subscriber(&bus, handler.clone(), shutdown_rx);
    let health = subscriber.health_handle();
    let task = subscriber.spawn();
    assert!(wait_until(WAIT, || health.status() == HealthStatus::Degraded).await);

    healed.store(true, Ordering::SeqCst);
    bus.reassign();

    assert!(wait_until(WAIT, || bus.committed_offset(GROUP, TOPIC, 0) == Some(2)).await);
    assert_eq!(health.status(), HealthStatus::Healthy);
    assert!(health.paused_partitions().is_empty());
    assert_eq!(bus.subscribe_count(), 1);
    let offsets: Vec<i64> = handler.handled().iter().map(|e| e.offset).collect();
    assert_eq!(offsets, vec![0, 1]);

    let _ = shutdown_tx.send(());
    task.await.unwrap();
}

#[tokio::test]
async fn resubscribes_after_failed_subscribe() {
    let bus = Arc::new(InMemoryEventBus::with_partitions(1));
    bus.fail_next_subscribes(2);
    let handler = Scripted::accepting();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    publish_trip(&bus, 101, "DELAYED").await;

    let task = subscriber(&bus, handler.clone(), shutdown_rx).spawn();

    assert!(wait_until(WAIT, || handler.handled().len() == 1).await);
    assert_eq!(bus.subscribe_count(), 1);

    let _ = shutdown_tx.send(());
    task.await.unwrap();
}

#[tokio::test]
async fn recovers_from_broker_outage() {
    let bus = Arc::new(InMemoryEventBus::with_partitions(1));
    let handler = Scripted::accepting();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let subscriber = subscriber(&bus, handler.clone(), shutdown_rx);
    let health = subscriber.health_handle();
    let task = subscriber.spawn();
    assert!(wait_until(WAIT, || health.is_connected()).await);

    bus.set_available(false);
    assert!(wait_until(WAIT, || !health.is_connected()).await);
    bus.set_available(true);

    publish_trip(&bus, 101, "DELAYED").await;
    assert!(wait_until(WAIT, || bus.committed_offset(GROUP, TOPIC, 0) == Some(1)).await);
    assert!(bus.subscribe_count() >= 2);

    let _ = shutdown_tx.send(());
    task.await.unwrap();
}

#[tokio::test]
async fn shutdown_lets_in_flight_handler_finish() {
    let bus = Arc::new(InMemoryEventBus::with_partitions(1));
    let handler = Scripted::slow(Duration::from_millis(100));
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    publish_trip(&bus, 101, "DELAYED").await;

    let task = subscriber(&bus, handler.clone(), shutdown_rx).spawn();
    assert!(wait_until(WAIT, || handler.attempts() == 1).await);

    shutdown_tx.send(()).unwrap();
    task.await.unwrap();

    assert_eq!(handler.handled().len(), 1);
    assert_eq!(bus.committed_offset(GROUP, TOPIC, 0), Some(1));
}

#[tokio::test]
async fn shutdown_aborts_handlers_past_the_grace_period() {
    let bus = Arc::new(InMemoryEventBus::with_partitions(1));
    let handler = Scripted::slow(Duration::from_secs(30));
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    publish_trip(&bus, 101, "DELAYED").await;

    let task = subscriber(&bus, handler.clone(), shutdown_rx)
        .with_shutdown_grace(Duration::from_millis(20))
        .spawn();
    assert!(wait_until(WAIT, || handler.attempts() == 1).await);

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();

    assert!(handler.handled().is_empty());
    assert_eq!(bus.committed_offset(GROUP, TOPIC, 0), None);
}

#[tokio::test]
async fn malformed_error_converts_from_payload_error() {
    let err: HandlerError = MalformedPayloadError::UnknownTopic("orders.placed".to_string()).into();
    assert!(err.is_poison());
}
