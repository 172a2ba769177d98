//! Delivery semantics of the in-memory broker.

#![allow(clippy::unwrap_used)]

use futures::StreamExt;
use serde_json::json;
use smart_ticketing_core::event_bus::{EventBus, EventBusError};
use smart_ticketing_testing::InMemoryEventBus;
use smart_ticketing_testing::helpers::json_payload;
use std::time::Duration;

#[tokio::test]
async fn same_key_is_delivered_in_append_order() {
    let bus = InMemoryEventBus::new();
    for status in ["DELAYED", "DEPARTED", "ARRIVED"] {
        let payload = json_payload(json!({ "tripId": 101, "status": status }));
        bus.publish("trips.updated", Some("trip-101"), &payload).await.unwrap();
    }

    let mut sub = bus.subscribe("notification-service-group", &["trips.updated"]).await.unwrap();
    let mut statuses = Vec::new();
    for _ in 0..3 {
        let envelope = sub.stream.next().await.unwrap().unwrap();
        statuses.push(envelope.payload().unwrap()["status"].clone());
    }

    assert_eq!(statuses, vec![json!("DELAYED"), json!("DEPARTED"), json!("ARRIVED")]);
}

#[tokio::test]
async fn groups_have_independent_cursors() {
    let bus = InMemoryEventBus::with_partitions(1);
    bus.append_raw("tickets.created", Some("ticket-1"), b"{}".to_vec());

    let mut notification = bus.subscribe("notification-service-group", &["tickets.created"]).await.unwrap();
    let envelope = notification.stream.next().await.unwrap().unwrap();
    notification.committer.commit(&envelope.position()).await.unwrap();

    let mut admin = bus.subscribe("admin-service-group", &["tickets.created"]).await.unwrap();
    assert_eq!(admin.stream.next().await.unwrap().unwrap().offset, 0);
}

#[tokio::test]
async fn paused_partition_stops_delivering() {
    let bus = InMemoryEventBus::with_partitions(1);
    bus.append_raw("payments.requested", Some("payment-1"), b"{}".to_vec());
    bus.append_raw("payments.requested", Some("payment-1"), b"{}".to_vec());

    let mut sub = bus.subscribe("payment-service-group", &["payments.requested"]).await.unwrap();
    let first = sub.stream.next().await.unwrap().unwrap();
    sub.committer.pause(&first.topic, first.partition).unwrap();

    let next = tokio::time::timeout(Duration::from_millis(50), sub.stream.next()).await;
    assert!(next.is_err(), "paused partition delivered {next:?}");
}

#[tokio::test]
async fn reassignment_unpauses_and_rewinds_to_committed() {
    let bus = InMemoryEventBus::with_partitions(1);
    bus.append_raw("payments.requested", Some("payment-1"), b"{}".to_vec());
    bus.append_raw("payments.requested", Some("payment-1"), b"{}".to_vec());

    let mut sub = bus.subscribe("payment-service-group", &["payments.requested"]).await.unwrap();
    let first = sub.stream.next().await.unwrap().unwrap();
    sub.committer.commit(&first.position()).await.unwrap();
    let second = sub.stream.next().await.unwrap().unwrap();
    sub.committer.pause(&second.topic, second.partition).unwrap();

    bus.reassign();

    let again = sub.stream.next().await.unwrap().unwrap();
    assert_eq!(again.offset, second.offset);
}

#[tokio::test]
async fn lost_ack_still_appends() {
    let bus = InMemoryEventBus::new();
    bus.lose_next_acks(1);
    let payload = json_payload(json!({ "ticketId": 1 }));

    let result = bus.publish("payments.confirmed", Some("payment-1"), &payload).await;
    assert!(matches!(result, Err(EventBusError::DeliveryFailed { .. })));
    assert_eq!(bus.records("payments.confirmed").len(), 1);
}

#[tokio::test]
async fn injected_publish_failure_does_not_append() {
    let bus = InMemoryEventBus::new();
    bus.fail_next_publishes(1);
    let payload = json_payload(json!({ "ticketId": 1 }));

    assert!(bus.publish("payments.confirmed", Some("payment-1"), &payload).await.is_err());
    assert!(bus.records("payments.confirmed").is_empty());
    assert!(bus.publish("payments.confirmed", Some("payment-1"), &payload).await.is_ok());
}

#[tokio::test]
async fn refused_commit_leaves_cursor() {
    let bus = InMemoryEventBus::with_partitions(1);
    bus.append_raw("tickets.validated", None, b"{}".to_vec());
    bus.fail_next_commits(1);

    let mut sub = bus.subscribe("notification-service-group", &["tickets.validated"]).await.unwrap();
    let envelope = sub.stream.next().await.unwrap().unwrap();
    assert!(sub.committer.commit(&envelope.position()).await.is_err());
    assert_eq!(bus.committed_offset("notification-service-group", "tickets.validated", 0), None);
}

#[tokio::test]
async fn delivery_wakes_on_publish() {
    let bus = InMemoryEventBus::new();
    let mut sub = bus.subscribe("admin-service-group", &["passengers.registered"]).await.unwrap();

    let publisher = bus.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let payload = json_payload(json!({ "passengerId": 1, "name": "Alice" }));
        publisher.publish("passengers.registered", Some("passenger-1"), &payload).await.unwrap();
    });

    let envelope = tokio::time::timeout(Duration::from_secs(1), sub.stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(envelope.key.as_deref(), Some("passenger-1"));
}
