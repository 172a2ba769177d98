//! # Smart Ticketing Testing
//!
//! Test utilities for the smart ticketing choreography.
//!
//! This crate provides:
//! - [`InMemoryEventBus`]: a partition-accurate broker with failure injection
//! - Helpers for building payloads and waiting on asynchronous effects
//!
//! ## Example
//!
//! ```ignore
//! use smart_ticketing_testing::{InMemoryEventBus, helpers::wait_until};
//!
//! #[tokio::test]
//! async fn payment_is_confirmed() {
//!     let bus = Arc::new(InMemoryEventBus::new());
//!     // ... spawn participants, publish payments.requested ...
//!     wait_until(Duration::from_secs(2), || !bus.records("payments.confirmed").is_empty()).await;
//! }
//! ```

/// In-memory event bus
pub mod event_bus;

/// Mock implementations of the broker traits.
pub mod mocks {
    pub use crate::event_bus::InMemoryEventBus;
}

/// Test helpers and utilities.
pub mod helpers {
    use smart_ticketing_core::envelope::Payload;
    use std::time::Duration;

    /// Convert a `serde_json::json!` object literal into a [`Payload`].
    ///
    /// Non-object values yield an empty payload.
    #[must_use]
    pub fn json_payload(value: serde_json::Value) -> Payload {
        match value {
            serde_json::Value::Object(map) => map,
            _ => Payload::new(),
        }
    }

    /// Poll `condition` every 5ms until it holds or `timeout` elapses.
    ///
    /// Returns whether the condition was met.
    pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Install a test-friendly tracing subscriber once.
    ///
    /// Honors `RUST_LOG`; output is captured by the test harness.
    pub fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    }
}

pub use event_bus::InMemoryEventBus;
