//! photohunt: runs the configured services over one broker connection.
//!
//! ## Configuration
//! ```yaml
//! broker:
//!   type: amqp            # or memory
//!   url: amqp://127.0.0.1:5672
//!
//! messaging:
//!   ack_policy: auto      # or after_success
//!   queue_naming: routing_key   # or per_service
//!
//! storage:
//!   type: sqlite
//!   path: data/photohunt.db
//!
//! services: [target, user, tag]
//! ```
//!
//! `RABBIT_MQ` overrides the broker URL.

use tracing::info;

use photohunt::config::Config;
use photohunt::runtime::ServiceHost;
use photohunt::utils::bootstrap::{init_tracing, parse_config_path};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = parse_config_path();
    let config = Config::load(config_path.as_deref())?;

    let host = ServiceHost::start(&config).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    host.shutdown().await?;
    Ok(())
}
