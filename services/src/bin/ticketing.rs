//! Ticketing service: issues a ticket for every confirmed payment.
//!
//! ```bash
//! KAFKA_BROKERS=localhost:9092 cargo run --bin ticketing-service
//! ```

use smart_ticketing::launch;
use smart_ticketing_core::topic::Service;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    launch(Service::Ticketing).await?;
    Ok(())
}
