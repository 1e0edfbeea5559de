//! Inventory engine daemon.

use souk_inventory::app::Application;
use souk_inventory::config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    info!(
        redis = %config.redis.url,
        kafka = %config.kafka.brokers,
        "Starting souk-inventoryd"
    );

    let app = Application::start(config).await?;
    app.run_until_shutdown().await
}
