//! # Smart Ticketing Core
//!
//! Shared vocabulary for the ticket purchase choreography.
//!
//! Every service in the system talks to every other service exclusively through
//! durable, partitioned topics. This crate defines the pieces all of them agree on:
//!
//! - **Envelope**: the unit of data transported on a topic ([`envelope`])
//! - **Topic Registry**: the fixed catalog of topics, their producers, consumers
//!   and payload schemas ([`topic`])
//! - **Event Bus**: the publish/subscribe/commit contract a log service must
//!   provide ([`event_bus`])
//! - **Reaction**: the pure business step a participant performs for one
//!   incoming envelope ([`reaction`])
//!
//! ## Workflow
//!
//! ```text
//! payments.requested ──► Payment ──► payments.confirmed ──► Ticketing ──► tickets.created
//!                                          │                                   │
//!                                          └──────────► Notification ◄─────────┘
//!                                                            │
//!                                                            ▼
//!                                                   notifications.sent
//! ```
//!
//! No participant knows about any other participant, only about topic names.
//!
//! ## Example
//!
//! ```
//! use smart_ticketing_core::envelope::{Envelope, Payload};
//! use smart_ticketing_core::topic::Topic;
//!
//! let mut payload = Payload::new();
//! payload.insert("ticketId".to_string(), 1.into());
//! payload.insert("amount".to_string(), 20.into());
//!
//! assert!(Topic::PaymentsRequested.validate(&payload).is_ok());
//! ```

pub mod envelope;
pub mod event_bus;
pub mod reaction;
pub mod topic;

pub use envelope::{Ack, Envelope, MalformedPayloadError, OutgoingEvent, Payload, Position};
pub use event_bus::{DeliveryStream, EventBus, EventBusError, OffsetCommitter, Subscription};
pub use reaction::{HandlerError, Reaction};
pub use topic::{IdempotencyScope, Producer, Service, Topic, TopicRegistry};
