//! User service.
//!
//! Consumes event lifecycle messages from `user_events_queue` and counts the
//! events created for each organizer, once per message, through the inbox.
//!
//! # Usage
//!
//! ```bash
//! DATABASE_URL=postgres://... AMQP_URL=amqp://... cargo run --bin user-service
//! ```

use anyhow::Context;
use outpost_amqp::AmqpBroker;
use outpost_core::clock::{Clock, SystemClock};
use outpost_postgres::PostgresStore;
use outpost_runtime::{MessageConsumer, MetricsServer};
use std::sync::Arc;
use std::time::Duration;
use ticketing::{Config, EventLifecycleHandler, await_shutdown, organizer_topology, shutdown_signal};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    ticketing::init_tracing("info,ticketing=debug,outpost_runtime=debug,sqlx=warn,lapin=warn");

    let config = Config::from_env();
    info!("Starting user service");

    let mut metrics = MetricsServer::new(config.metrics_addr().context("Invalid METRICS_ADDR")?);
    metrics.start().context("Failed to start metrics server")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = PostgresStore::connect_with(&config.pool_config())
        .await
        .context("Failed to connect to PostgreSQL")?
        .with_clock(clock);
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

    let consumer = MessageConsumer::new(
        broker.clone(),
        Arc::new(EventLifecycleHandler::new(Arc::new(store))),
        organizer_topology(config.retry_delay()),
    )
    .with_config(config.user_consumer_config());
    consumer
        .declare_topology()
        .await
        .context("Failed to declare consumer topology")?;
    let consumer = consumer.spawn();

    info!("User service running");
    shutdown_signal().await;

    await_shutdown(vec![consumer], config.shutdown_timeout()).await;
    if let Err(e) = broker.close().await {
        warn!(error = %e, "Failed to close broker connection");
    }
    info!("User service stopped");
    Ok(())
}
