//! Payment service: confirms requested payments on `payments.confirmed`.
//!
//! ```bash
//! KAFKA_BROKERS=localhost:9092 cargo run --bin payment-service
//! ```

use smart_ticketing::launch;
use smart_ticketing_core::topic::Service;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    launch(Service::Payment).await?;
    Ok(())
}
