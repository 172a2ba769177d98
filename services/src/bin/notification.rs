//! Notification service: relays customer-facing events to `notifications.sent`.
//!
//! ```bash
//! KAFKA_BROKERS=localhost:9092 cargo run --bin notification-service
//! ```

use smart_ticketing::launch;
use smart_ticketing_core::topic::Service;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    launch(Service::Notification).await?;
    Ok(())
}
