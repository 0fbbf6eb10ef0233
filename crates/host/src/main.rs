use std::sync::Arc;

use eshop_host::{Service, ServiceHost};
use eshop_infra::EventBusConfig;
use eshop_infra::event_bus::AmqpConnector;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    eshop_observability::init();

    let service = Service::from_env()?;
    let config = EventBusConfig::from_env()?;

    tracing::info!(service = %service, config = ?config, "starting");

    let connector = Arc::new(AmqpConnector::from_config(&config));
    let host = ServiceHost::start(service, &config, connector).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    host.shutdown().await;

    Ok(())
}
