//! Transport service: announces a trip status change and exits.
//!
//! ```bash
//! KAFKA_BROKERS=localhost:9092 cargo run --bin transport-service
//! ```

use smart_ticketing::launch;
use smart_ticketing_core::topic::Service;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    launch(Service::Transport).await?;
    Ok(())
}
