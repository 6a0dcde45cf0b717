//! Event service.
//!
//! Publishes the outbox: claims unpublished rows, sends them to the broker
//! with confirmation and marks them published.
//!
//! # Usage
//!
//! ```bash
//! DATABASE_URL=postgres://... AMQP_URL=amqp://... cargo run --bin event-service
//! ```

use anyhow::Context;
use outpost_amqp::AmqpBroker;
use outpost_core::broker::MessageBroker;
use outpost_core::clock::{Clock, SystemClock};
use outpost_postgres::PostgresStore;
use outpost_runtime::{MessagePublisher, MetricsServer, OutboxPoller};
use std::sync::Arc;
use std::time::Duration;
use ticketing::{Config, await_shutdown, publisher_topology, shutdown_signal};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    ticketing::init_tracing("info,ticketing=debug,outpost_runtime=debug,sqlx=warn,lapin=warn");

    let config = Config::from_env();
    info!("Starting event service");

    let mut metrics = MetricsServer::new(config.metrics_addr().context("Invalid METRICS_ADDR")?);
    metrics.start().context("Failed to start metrics server")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = PostgresStore::connect_with(&config.pool_config())
        .await
        .context("Failed to connect to PostgreSQL")?
        .with_clock(Arc::clone(&clock));
    store.migrate().await.context("Failed to run migrations")?;

    let broker = Arc::new(
        AmqpBroker::builder()
            .url(config.amqp.url.clone())
            .connect_attempts(config.amqp.connect_attempts)
            .connect_delay(Duration::from_secs(config.amqp.connect_delay_secs))
            .build()
            .await
            .context("Failed to connect to the broker")?,
    );
    broker
        .declare_topology(&publisher_topology())
        .await
        .context("Failed to declare exchanges")?;

    let publisher = MessagePublisher::new(broker.clone(), config.publisher_config());
    let poller =
        OutboxPoller::new(Arc::new(store), publisher, clock).with_config(config.poller_config());
    match poller.backlog().await {
        Ok(0) => {},
        Ok(backlog) => info!(backlog, "Unpublished outbox rows waiting"),
        Err(e) => warn!(error = %e, "Failed to read outbox backlog"),
    }
    let poller = poller.start();

    info!("Event service running");
    shutdown_signal().await;

    await_shutdown(vec![poller], config.shutdown_timeout()).await;
    if let Err(e) = broker.close().await {
        warn!(error = %e, "Failed to close broker connection");
    }
    info!("Event service stopped");
    Ok(())
}
