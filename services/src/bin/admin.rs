//! Admin service: audits the operational streams.
//!
//! ```bash
//! KAFKA_BROKERS=localhost:9092 cargo run --bin admin-service
//! ```

use smart_ticketing::launch;
use smart_ticketing_core::topic::Service;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    launch(Service::Admin).await?;
    Ok(())
}
