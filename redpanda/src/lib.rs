//! Kafka-protocol event bus for the smart ticketing choreography.
//!
//! This crate provides [`RedpandaEventBus`], an implementation of the
//! [`EventBus`] trait from `smart-ticketing-core` on top of rdkafka. It works
//! with Redpanda, Apache Kafka or any other broker speaking the Kafka protocol.
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - Auto-commit is disabled; the subscriber commits each position explicitly
//!   after its handler finished
//! - If the process stops before commit, the envelope is redelivered
//! - Ordering is guaranteed within a partition, and the partition is chosen
//!   from the envelope key
//!
//! # Example
//!
//! ```no_run
//! use smart_ticketing_redpanda::RedpandaEventBus;
//! use smart_ticketing_core::event_bus::EventBus;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let event_bus = RedpandaEventBus::builder()
//!     .brokers("localhost:9092")
//!     .client_id("smart-ticketing")
//!     .build()?;
//! event_bus.ping().await?;
//!
//! let mut payload = serde_json::Map::new();
//! payload.insert("tripId".to_string(), 101.into());
//! payload.insert("status".to_string(), "DELAYED".into());
//! event_bus.publish("trips.updated", Some("trip-101"), &payload).await?;
//!
//! let mut subscription = event_bus
//!     .subscribe("notification-service-group", &["trips.updated"])
//!     .await?;
//! while let Some(Ok(envelope)) = subscription.stream.next().await {
//!     println!("Received: {envelope}");
//!     subscription.committer.commit(&envelope.position()).await?;
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use smart_ticketing_core::envelope::{Ack, Envelope, Payload, Position, encode};
use smart_ticketing_core::event_bus::{
    BusFuture, EventBus, EventBusError, OffsetCommitter, Subscription,
};
use std::sync::Arc;
use std::time::Duration;

/// Kafka-protocol event bus.
///
/// # Configuration
///
/// - **Broker addresses**: bootstrap servers (required)
/// - **Client id**: identifies this process to the broker (default `smart-ticketing`)
/// - **Producer settings**: acks (default `all`), compression, delivery timeout
/// - **Consumer settings**: offset reset (default `earliest`), session timeout,
///   forwarding buffer
///
/// # Example
///
/// ```no_run
/// use smart_ticketing_redpanda::RedpandaEventBus;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let event_bus = RedpandaEventBus::builder()
///     .brokers("kafka:9092")
///     .producer_acks("all")
///     .compression("lz4")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaEventBus {
    producer: FutureProducer,
    brokers: String,
    client_id: String,
    timeout: Duration,
    buffer_size: usize,
    auto_offset_reset: String,
    session_timeout: Duration,
}

impl RedpandaEventBus {
    /// Create an event bus with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the event bus.
    #[must_use]
    pub fn builder() -> RedpandaEventBusBuilder {
        RedpandaEventBusBuilder::default()
    }

    /// Bootstrap servers.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Check that at least one broker answers a metadata request.
    ///
    /// Creating the bus does not open a connection; call this at startup to
    /// fail fast on an unreachable cluster.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if no broker answered within
    /// the configured timeout.
    pub async fn ping(&self) -> Result<(), EventBusError> {
        let producer = self.producer.clone();
        let timeout = self.timeout;

        let metadata = tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(None, Timeout::After(timeout))
                .map(|metadata| metadata.brokers().len())
        })
        .await
        .map_err(|e| EventBusError::ConnectionFailed(format!("Metadata task failed: {e}")))?;

        match metadata {
            Ok(brokers) => {
                tracing::info!(brokers = %self.brokers, reachable = brokers, "Connected to broker");
                Ok(())
            },
            Err(e) => Err(EventBusError::ConnectionFailed(format!(
                "No broker reachable at {}: {e}",
                self.brokers
            ))),
        }
    }
}

/// Builder for configuring a [`RedpandaEventBus`].
#[derive(Default)]
pub struct RedpandaEventBusBuilder {
    brokers: Option<String>,
    client_id: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
    session_timeout: Option<Duration>,
}

impl RedpandaEventBusBuilder {
    /// Set the broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the client id reported to the broker.
    ///
    /// Default: `"smart-ticketing"`
    #[must_use]
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Set the producer acknowledgment mode: `"0"`, `"1"` or `"all"`.
    ///
    /// Default: `"all"`
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"`, `"zstd"`.
    ///
    /// Default: `"none"`
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set how long a publish may wait for its acknowledgment.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set how many envelopes may sit between the Kafka consumer and the
    /// subscriber. Values below 1 are raised to 1.
    ///
    /// Default: 1000
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size.max(1));
        self
    }

    /// Set where a group with no committed offset starts reading:
    /// `"earliest"`, `"latest"` or `"error"`.
    ///
    /// Default: `"earliest"`, so no envelope appended before the first
    /// subscription is missed.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Set the consumer group session timeout.
    ///
    /// Default: 6 seconds
    #[must_use]
    pub const fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Build the [`RedpandaEventBus`].
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if brokers are not set or
    /// the producer configuration is rejected.
    pub fn build(self) -> Result<RedpandaEventBus, EventBusError> {
        let brokers = self
            .brokers
            .filter(|b| !b.trim().is_empty())
            .ok_or_else(|| EventBusError::ConnectionFailed("Brokers not configured".to_string()))?;
        let client_id = self.client_id.unwrap_or_else(|| "smart-ticketing".to_string());
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));
        let acks = self.producer_acks.unwrap_or_else(|| "all".to_string());
        let compression = self.compression.unwrap_or_else(|| "none".to_string());

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("client.id", &client_id)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", &acks)
            .set("compression.type", &compression)
            .create()
            .map_err(|e| EventBusError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        let bus = RedpandaEventBus {
            producer,
            brokers,
            client_id,
            timeout,
            buffer_size: self.buffer_size.unwrap_or(1000),
            auto_offset_reset: self.auto_offset_reset.unwrap_or_else(|| "earliest".to_string()),
            session_timeout: self.session_timeout.unwrap_or(Duration::from_secs(6)),
        };

        tracing::info!(
            brokers = %bus.brokers,
            client_id = %bus.client_id,
            acks = %acks,
            compression = %compression,
            auto_offset_reset = %bus.auto_offset_reset,
            "RedpandaEventBus created"
        );
        Ok(bus)
    }
}

impl EventBus for RedpandaEventBus {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        key: Option<&'a str>,
        payload: &'a Payload,
    ) -> BusFuture<'a, Ack> {
        Box::pin(async move {
            let value = encode(payload);
            let mut record = FutureRecord::<str, [u8]>::to(topic).payload(&value);
            if let Some(key) = key {
                record = record.key(key);
            }

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::trace!(topic, partition, offset, "Broker acknowledged append");
                    Ok(Ack {
                        topic: topic.to_string(),
                        partition,
                        offset,
                    })
                },
                Err((kafka_error, _)) => Err(EventBusError::DeliveryFailed {
                    topic: topic.to_string(),
                    reason: kafka_error.to_string(),
                }),
            }
        })
    }

    fn subscribe<'a>(&'a self, group: &'a str, topics: &'a [&'a str]) -> BusFuture<'a, Subscription> {
        Box::pin(async move {
            let failed = |reason: String| EventBusError::SubscriptionFailed {
                group: group.to_string(),
                topics: topics.iter().map(ToString::to_string).collect(),
                reason,
            };

            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("client.id", &self.client_id)
                .set("group.id", group)
                .set("enable.auto.commit", "false")
                .set("enable.auto.offset.store", "false")
                .set("auto.offset.reset", &self.auto_offset_reset)
                .set("session.timeout.ms", self.session_timeout.as_millis().to_string())
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| failed(format!("Failed to create consumer: {e}")))?;

            consumer
                .subscribe(topics)
                .map_err(|e| failed(format!("Failed to subscribe to topics: {e}")))?;

            tracing::info!(
                group,
                topics = ?topics,
                auto_offset_reset = %self.auto_offset_reset,
                manual_commit = true,
                "Joined consumer group"
            );

            let consumer = Arc::new(consumer);
            let (tx, mut rx) = tokio::sync::mpsc::channel(self.buffer_size);
            let forwarder = Arc::clone(&consumer);
            let group_id = group.to_string();

            tokio::spawn(async move {
                let mut messages = forwarder.stream();
                loop {
                    let next = tokio::select! {
                        () = tx.closed() => break,
                        next = messages.next() => next,
                    };
                    let Some(result) = next else { break };

                    let item = result
                        .map(|message| {
                            Envelope::new(
                                message.topic(),
                                message.key().map(|k| String::from_utf8_lossy(k).into_owned()),
                                message.partition(),
                                message.offset(),
                                message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                            )
                        })
                        .map_err(|e| EventBusError::Transport(format!("Failed to receive message: {e}")));

                    if tx.send(item).await.is_err() {
                        break;
                    }
                }
                tracing::debug!(group = %group_id, "Consumer forwarding task exiting");
            });

            let stream = async_stream::stream! {
                while let Some(item) = rx.recv().await {
                    yield item;
                }
            };

            Ok(Subscription {
                group: group.to_string(),
                stream: Box::pin(stream),
                committer: Arc::new(RedpandaCommitter { consumer }),
            })
        })
    }

    fn disconnect(&self) -> BusFuture<'_, ()> {
        Box::pin(async move {
            let producer = self.producer.clone();
            let timeout = self.timeout;
            let flushed = tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
                .await
                .map_err(|e| EventBusError::ConnectionFailed(format!("Flush task failed: {e}")))?;

            flushed.map_err(|e| {
                EventBusError::ConnectionFailed(format!("Pending appends not flushed: {e}"))
            })?;
            tracing::info!(brokers = %self.brokers, "Producer flushed, connection released");
            Ok(())
        })
    }
}

/// Commits positions for one consumer-group membership.
struct RedpandaCommitter {
    consumer: Arc<StreamConsumer>,
}

impl OffsetCommitter for RedpandaCommitter {
    fn commit(&self, position: &Position) -> BusFuture<'_, ()> {
        let position = position.clone();
        Box::pin(async move {
            let mut tpl = TopicPartitionList::new();
            tpl.add_partition_offset(&position.topic, position.partition, Offset::Offset(position.offset + 1))
                .map_err(|e| EventBusError::CommitFailed {
                    position: position.clone(),
                    reason: e.to_string(),
                })?;

            self.consumer
                .commit(&tpl, CommitMode::Async)
                .map_err(|e| EventBusError::CommitFailed {
                    position,
                    reason: e.to_string(),
                })
        })
    }

    fn pause(&self, topic: &str, partition: i32) -> Result<(), EventBusError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition(topic, partition);
        self.consumer
            .pause(&tpl)
            .map_err(|e| EventBusError::Transport(format!("Failed to pause {topic}[{partition}]: {e}")))
    }
}
