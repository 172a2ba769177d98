//! Passenger service: registers a passenger and exits.
//!
//! ```bash
//! KAFKA_BROKERS=localhost:9092 cargo run --bin passenger-service
//! ```

use smart_ticketing::launch;
use smart_ticketing_core::topic::Service;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    launch(Service::Passenger).await?;
    Ok(())
}
