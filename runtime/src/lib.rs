//! # Smart Ticketing Runtime
//!
//! Delivery machinery shared by every participant in the ticket-purchase
//! choreography.
//!
//! ## Core Components
//!
//! - **[`Publisher`]**: producer-scoped appends with registry enforcement
//! - **[`Subscriber`]**: consumer-group loop with per-partition ordering,
//!   commit-after-handle, bounded retries and graceful shutdown
//! - **[`Participant`]**: adapts a pure [`Reaction`](smart_ticketing_core::Reaction)
//!   into an idempotent envelope handler that publishes its outputs
//! - **Idempotency ledger**, **dead letters**, **retry policy** and
//!   **Prometheus metrics**
//!
//! ## Example
//!
//! ```ignore
//! use smart_ticketing_runtime::{Participant, Publisher};
//!
//! let publisher = Publisher::for_service(reaction.service(), bus.clone());
//! let participant = Participant::new(reaction, publisher);
//! let subscriber = participant.into_subscriber(bus, shutdown_rx);
//! let handle = subscriber.spawn();
//! ```

/// Retry logic with exponential backoff
pub mod retry;

/// Prometheus metrics for observability
pub mod metrics;

/// Poison messages that were committed past
pub mod dead_letter;

/// Duplicate detection for redelivered envelopes
pub mod idempotency;

/// Producer-scoped publishing
pub mod publisher;

/// Consumer-group delivery loop
pub mod subscriber;

/// Reaction adapter with idempotency and publish progress
pub mod participant;

pub use dead_letter::{DeadLetter, DeadLetterQueue, DeadLetterSink};
pub use idempotency::{IdempotencyKey, IdempotencyLedger, InMemoryLedger};
pub use participant::Participant;
pub use publisher::Publisher;
pub use retry::RetryPolicy;
pub use subscriber::{EnvelopeHandler, Handled, Subscriber, SubscriberHealth};

/// Health check status levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    /// Component is fully operational
    Healthy,

    /// Component is operational but some partitions are halted
    Degraded,

    /// Component is not operational
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is healthy
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Get the worst status between two statuses
    #[must_use]
    pub const fn worst(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unhealthy, _) | (_, Self::Unhealthy) => Self::Unhealthy,
            (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
            _ => Self::Healthy,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health check result for a component
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Name of the component being checked
    pub component: String,

    /// Current health status
    pub status: HealthStatus,

    /// Optional message providing details
    pub message: Option<String>,

    /// Optional metadata (paused partitions, error counts)
    pub metadata: Vec<(String, String)>,
}

impl HealthCheck {
    /// Create a healthy check result
    #[must_use]
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Healthy,
            message: None,
            metadata: Vec::new(),
        }
    }

    /// Create a degraded check result
    #[must_use]
    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            metadata: Vec::new(),
        }
    }

    /// Create an unhealthy check result
    #[must_use]
    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            metadata: Vec::new(),
        }
    }

    /// Add metadata to the health check
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }
}

/// Aggregated health report
///
/// Combines multiple health checks into an overall status.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Overall status (worst of all checks)
    pub status: HealthStatus,

    /// Individual component checks
    pub checks: Vec<HealthCheck>,

    /// Timestamp when report was generated
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl HealthReport {
    /// Create a new health report from checks
    #[must_use]
    pub fn new(checks: Vec<HealthCheck>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .fold(HealthStatus::Healthy, HealthStatus::worst);

        Self {
            status,
            checks,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Check if overall status is healthy
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }
}
