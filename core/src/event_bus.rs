//! Event bus abstraction over a durable, partitioned log.
//!
//! This module provides the [`EventBus`] trait: the three operations every
//! participant needs from the log service (append, read as a consumer group,
//! commit progress) plus an explicit `disconnect` so the connection handle can
//! be released on every exit path.
//!
//! # Key Principles
//!
//! - **Keyed ordering**: envelopes sharing a key land in the same partition and
//!   are delivered to every consumer group in append order
//! - **At-least-once delivery**: a group cursor only advances when the
//!   subscriber commits, so anything not committed is redelivered
//! - **Idempotency**: subscribers must tolerate duplicates
//! - **Unknown outcome on failure**: a failed publish may or may not have been
//!   appended; retrying is always safe because consumers are idempotent
//!
//! # Implementations
//!
//! - `InMemoryEventBus` (`smart-ticketing-testing`) - partition-accurate broker simulation
//! - `RedpandaEventBus` (`smart-ticketing-redpanda`) - Kafka protocol via rdkafka
//!
//! # Example
//!
//! ```rust,ignore
//! use futures::StreamExt;
//!
//! let ack = event_bus.publish("payments.confirmed", Some("payment-1"), &payload).await?;
//!
//! let mut subscription = event_bus
//!     .subscribe("ticketing-service-group", &["payments.confirmed"])
//!     .await?;
//! while let Some(Ok(envelope)) = subscription.stream.next().await {
//!     handle(&envelope)?;
//!     subscription.committer.commit(&envelope.position()).await?;
//! }
//! ```

use crate::envelope::{Ack, Envelope, MalformedPayloadError, Payload, Position};
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// The broker cannot be reached (at startup or mid-operation).
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A publish attempt failed; whether it was appended is unknown.
    #[error("Delivery failed for topic '{topic}': {reason}")]
    DeliveryFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to join a consumer group or subscribe to its topics.
    #[error("Subscription failed for group '{group}' on topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// Consumer group id
        group: String,
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// The broker refused to advance a group cursor.
    #[error("Commit failed at {position}: {reason}")]
    CommitFailed {
        /// Position that could not be committed
        position: Position,
        /// The reason for failure
        reason: String,
    },

    /// A producer tried to append to a topic outside its producible set.
    #[error("'{producer}' may not publish to '{topic}'")]
    NotProducible {
        /// Producer identity
        producer: String,
        /// Requested topic
        topic: String,
    },

    /// An outgoing payload violates the topic schema.
    #[error(transparent)]
    MalformedPayload(#[from] MalformedPayloadError),

    /// Network or transport error while reading.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl EventBusError {
    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_)
                | Self::DeliveryFailed { .. }
                | Self::CommitFailed { .. }
                | Self::Transport(_)
        )
    }
}

/// Boxed future returned by the dyn-compatible bus traits.
pub type BusFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, EventBusError>> + Send + 'a>>;

/// Stream of envelopes delivered to one subscription.
///
/// Envelopes from different partitions may interleave; envelopes from the same
/// partition arrive in offset order.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Envelope, EventBusError>> + Send>>;

/// Requests cursor movement on behalf of a consumer group.
///
/// The broker owns the group position; a subscriber only asks it to advance.
pub trait OffsetCommitter: Send + Sync {
    /// Advance the group cursor past `position`.
    ///
    /// After a successful commit the envelope at `position` (and everything
    /// before it in the same partition) is not redelivered to this group.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::CommitFailed`] if the broker rejects the commit.
    fn commit(&self, position: &Position) -> BusFuture<'_, ()>;

    /// Stop fetching from a partition until the subscription is recreated.
    ///
    /// Used when an envelope keeps failing: the partition halts at the failed
    /// offset instead of skipping past it.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Transport`] if the pause cannot be applied.
    fn pause(&self, topic: &str, partition: i32) -> Result<(), EventBusError>;
}

/// A live consumer-group membership.
///
/// Dropping the subscription leaves the group; uncommitted envelopes are then
/// redelivered to whichever instance picks up the partitions.
pub struct Subscription {
    /// Consumer group id
    pub group: String,
    /// Delivered envelopes
    pub stream: DeliveryStream,
    /// Commit handle for this membership
    pub committer: Arc<dyn OffsetCommitter>,
}

/// Trait for event bus implementations.
///
/// # Dyn Compatibility
///
/// Uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn` so the
/// bus can be shared as `Arc<dyn EventBus>` between publisher, subscribers and
/// the process lifecycle.
pub trait EventBus: Send + Sync {
    /// Append a payload to `topic`.
    ///
    /// Envelopes with the same `key` are appended to the same partition and
    /// keep their relative order. Keyless envelopes carry no ordering promise.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::DeliveryFailed`] if the broker does not
    /// acknowledge the append in time. The envelope may still have been
    /// appended; callers may retry.
    fn publish<'a>(&'a self, topic: &'a str, key: Option<&'a str>, payload: &'a Payload)
    -> BusFuture<'a, Ack>;

    /// Join consumer group `group` and subscribe to `topics`.
    ///
    /// Delivery resumes from the group's committed position on each partition
    /// assigned to this instance.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] or
    /// [`EventBusError::ConnectionFailed`] if the group cannot be joined.
    fn subscribe<'a>(&'a self, group: &'a str, topics: &'a [&'a str]) -> BusFuture<'a, Subscription>;

    /// Flush pending appends and release the connection.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if pending appends could not
    /// be flushed before the connection was released.
    fn disconnect(&self) -> BusFuture<'_, ()>;
}
