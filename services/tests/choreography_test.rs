//! End-to-end purchase choreography on the in-memory bus.
//!
//! Every participant runs through [`run_until`] exactly as the binaries do,
//! sharing one [`InMemoryEventBus`].

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use serde_json::json;
use smart_ticketing::config::Config;
use smart_ticketing::origin;
use smart_ticketing::run_until;
use smart_ticketing_core::envelope::{Envelope, OutgoingEvent};
use smart_ticketing_core::event_bus::EventBus;
use smart_ticketing_core::topic::Service;
use smart_ticketing_runtime::Publisher;
use smart_ticketing_testing::InMemoryEventBus;
use smart_ticketing_testing::helpers::wait_until;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const SETTLE: Duration = Duration::from_secs(3);

fn test_config() -> Config {
    let mut config = Config::from_lookup(|_| None).unwrap();
    config.delivery.handler_retry_initial_ms = 1;
    config.delivery.handler_retry_max_ms = 5;
    config.delivery.shutdown_grace_secs = 1;
    config
}

struct Running {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Running {
    async fn stop(self) {
        let _ = self.stop.send(());
        self.task.await.expect("participant task panicked");
    }
}

fn start(service: Service, bus: &Arc<InMemoryEventBus>) -> Running {
    let (stop, stopped) = oneshot::channel::<()>();
    let shared: Arc<dyn EventBus> = bus.clone();
    let task = tokio::spawn(async move {
        run_until(service, shared, &test_config(), async {
            let _ = stopped.await;
        })
        .await
        .expect("participant failed");
    });
    Running { stop, task }
}

async fn request(bus: &Arc<InMemoryEventBus>, event: &OutgoingEvent) {
    let shared: Arc<dyn EventBus> = bus.clone();
    Publisher::external(shared).send(event).await.unwrap();
}

fn keys(records: &[Envelope]) -> BTreeSet<String> {
    records.iter().filter_map(|e| e.key.clone()).collect()
}

#[tokio::test]
async fn purchase_flows_from_payment_to_notification() {
    let bus = Arc::new(InMemoryEventBus::new());
    let running = vec![
        start(Service::Payment, &bus),
        start(Service::Ticketing, &bus),
        start(Service::Notification, &bus),
        start(Service::Admin, &bus),
    ];

    request(&bus, &origin::payment_requested(1, 20)).await;

    assert!(
        wait_until(SETTLE, || {
            let notified = keys(&bus.records("notifications.sent"));
            notified.contains("payments.confirmed-1") && notified.contains("tickets.created-1")
        })
        .await,
        "notifications were not sent"
    );

    let confirmed = bus.records("payments.confirmed");
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].key.as_deref(), Some("payment-1"));
    let payment = confirmed[0].payload().unwrap();
    assert_eq!(payment["ticketId"], json!(1));
    assert_eq!(payment["amount"], json!(20));

    let created = bus.records("tickets.created");
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].key.as_deref(), Some("ticket-1"));
    let ticket = created[0].payload().unwrap();
    assert_eq!(ticket["status"], json!("CREATED"));
    assert_eq!(ticket["ticketId"], json!(1));

    for participant in running {
        participant.stop().await;
    }

    let partition = bus.partition_for("payment-1");
    assert_eq!(
        bus.committed_offset("payment-service-group", "payments.requested", partition),
        Some(1)
    );
}

#[tokio::test]
async fn trip_updates_are_notified_in_publish_order() {
    let bus = Arc::new(InMemoryEventBus::new());
    let shared: Arc<dyn EventBus> = bus.clone();
    let transport = Publisher::for_service(Service::Transport, shared);
    for status in ["DELAYED", "DEPARTED", "ARRIVED"] {
        transport.send(&origin::trip_updated(101, status)).await.unwrap();
    }

    let notification = start(Service::Notification, &bus);
    assert!(wait_until(SETTLE, || bus.records("notifications.sent").len() == 3).await);
    notification.stop().await;

    let statuses: Vec<_> = bus
        .records("notifications.sent")
        .iter()
        .map(|e| e.payload().unwrap()["status"].clone())
        .collect();
    assert_eq!(statuses, vec![json!("DELAYED"), json!("DEPARTED"), json!("ARRIVED")]);
}

#[tokio::test]
async fn trip_returning_to_an_earlier_status_is_notified_again() {
    let bus = Arc::new(InMemoryEventBus::new());
    let shared: Arc<dyn EventBus> = bus.clone();
    let transport = Publisher::for_service(Service::Transport, shared);
    for status in ["DELAYED", "ON_TIME", "DELAYED"] {
        transport.send(&origin::trip_updated(101, status)).await.unwrap();
    }

    let notification = start(Service::Notification, &bus);
    let partition = bus.partition_for("trip-101");
    assert!(
        wait_until(SETTLE, || {
            bus.committed_offset("notification-service-group", "trips.updated", partition) == Some(3)
        })
        .await
    );
    notification.stop().await;

    let statuses: Vec<_> = bus
        .records("notifications.sent")
        .iter()
        .map(|e| e.payload().unwrap()["status"].clone())
        .collect();
    assert_eq!(statuses, vec![json!("DELAYED"), json!("ON_TIME"), json!("DELAYED")]);
}

#[tokio::test]
async fn duplicate_request_confirms_once() {
    let bus = Arc::new(InMemoryEventBus::new());
    let event = origin::payment_requested(7, 30);
    request(&bus, &event).await;
    request(&bus, &event).await;

    let payment = start(Service::Payment, &bus);
    let partition = bus.partition_for("payment-7");
    assert!(
        wait_until(SETTLE, || {
            bus.committed_offset("payment-service-group", "payments.requested", partition)
                == Some(2)
        })
        .await
    );
    payment.stop().await;

    assert_eq!(bus.records("payments.confirmed").len(), 1);
}

#[tokio::test]
async fn uncommitted_envelope_is_redelivered_and_absorbed_downstream() {
    let bus = Arc::new(InMemoryEventBus::new());
    request(&bus, &origin::payment_requested(4, 10)).await;
    bus.fail_next_commits(1);

    let first = start(Service::Payment, &bus);
    assert!(wait_until(SETTLE, || bus.records("payments.confirmed").len() == 1).await);
    first.stop().await;

    let partition = bus.partition_for("payment-4");
    assert_eq!(
        bus.committed_offset("payment-service-group", "payments.requested", partition),
        None
    );

    // A fresh process has an empty ledger, so the redelivery is reacted to again.
    let restarted = start(Service::Payment, &bus);
    let ticketing = start(Service::Ticketing, &bus);
    assert!(wait_until(SETTLE, || bus.records("payments.confirmed").len() == 2).await);
    assert!(
        wait_until(SETTLE, || {
            bus.committed_offset("ticketing-service-group", "payments.confirmed", bus.partition_for("payment-4"))
                == Some(2)
        })
        .await
    );
    restarted.stop().await;
    ticketing.stop().await;

    let confirmed = bus.records("payments.confirmed");
    assert_eq!(confirmed[0].value, confirmed[1].value);
    assert_eq!(confirmed[0].key, confirmed[1].key);
    assert_eq!(bus.records("tickets.created").len(), 1);
}

#[tokio::test]
async fn poison_message_does_not_stall_the_partition() {
    let bus = Arc::new(InMemoryEventBus::new());
    bus.append_raw("payments.requested", Some("payment-5"), b"{ticketId: 5".to_vec());
    request(&bus, &origin::payment_requested(5, 25)).await;

    let payment = start(Service::Payment, &bus);
    let partition = bus.partition_for("payment-5");
    assert!(
        wait_until(SETTLE, || {
            bus.committed_offset("payment-service-group", "payments.requested", partition)
                == Some(2)
        })
        .await,
        "partition stalled behind the malformed envelope"
    );
    payment.stop().await;

    let confirmed = bus.records("payments.confirmed");
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].key.as_deref(), Some("payment-5"));
}

#[tokio::test]
async fn distinct_tickets_progress_independently() {
    let bus = Arc::new(InMemoryEventBus::new());
    let payment = start(Service::Payment, &bus);
    let ticketing = start(Service::Ticketing, &bus);

    request(&bus, &origin::payment_requested(1, 20)).await;
    request(&bus, &origin::payment_requested(2, 35)).await;

    assert!(wait_until(SETTLE, || bus.records("tickets.created").len() == 2).await);
    payment.stop().await;
    ticketing.stop().await;

    // Relative order across keys is unspecified; only the set is checked.
    let expected: BTreeSet<String> = ["ticket-1", "ticket-2"].into_iter().map(String::from).collect();
    assert_eq!(keys(&bus.records("tickets.created")), expected);
}

#[tokio::test]
async fn validated_tickets_are_notified() {
    let bus = Arc::new(InMemoryEventBus::new());
    let notification = start(Service::Notification, &bus);

    request(&bus, &origin::ticket_validated(9)).await;

    assert!(
        wait_until(SETTLE, || keys(&bus.records("notifications.sent")).contains("tickets.validated-9"))
            .await
    );
    notification.stop().await;
}
