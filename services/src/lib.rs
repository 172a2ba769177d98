//! # Smart Ticketing
//!
//! The participants of the ticket-purchase choreography. There is no central
//! coordinator: each participant reacts to the topics it subscribes to and
//! appends its own facts, and the saga emerges from that chain.
//!
//! ```text
//! payments.requested ─► Payment ─► payments.confirmed ─► Ticketing ─► tickets.created
//!                                          │                                │
//!                                          └────────► Notification ◄────────┘
//!                                                          │
//!                                                 notifications.sent
//! ```
//!
//! - [`reactions`]: the pure business step of each consuming participant
//! - [`origin`]: events originated by Passenger, Transport and external systems
//! - [`lifecycle`]: connect, run, drain and disconnect one participant process
//! - [`config`]: environment configuration
//! - [`telemetry`]: tracing setup

pub mod config;
pub mod lifecycle;
pub mod origin;
pub mod reactions;
pub mod telemetry;

pub use config::{Config, ConfigError};
pub use lifecycle::{LaunchError, launch, run_until};
