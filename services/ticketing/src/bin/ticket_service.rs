//! Ticket service.
//!
//! Consumes `ticket.created.pending` from `ticket_events_queue` and creates
//! tickets, once per message, through the inbox.
//!
//! # Usage
//!
//! ```bash
//! DATABASE_URL=postgres://... AMQP_URL=amqp://... cargo run --bin ticket-service
//! ```

use anyhow::Context;
use outpost_amqp::AmqpBroker;
use outpost_core::clock::{Clock, SystemClock};
use outpost_postgres::PostgresStore;
use outpost_runtime::{MessageConsumer, MetricsServer};
use std::sync::Arc;
use std::time::Duration;
use ticketing::{Config, TicketCreateHandler, await_shutdown, shutdown_signal, ticket_topology};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    ticketing::init_tracing("info,ticketing=debug,outpost_runtime=debug,sqlx=warn,lapin=warn");

    let config = Config::from_env();
    info!("Starting ticket service");

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

    let handler = TicketCreateHandler::new(Arc::new(store), clock);
    let consumer = MessageConsumer::new(
        broker.clone(),
        Arc::new(handler),
        ticket_topology(config.retry_delay()),
    )
    .with_config(config.consumer_config());
    consumer
        .declare_topology()
        .await
        .context("Failed to declare consumer topology")?;
    let consumer = consumer.spawn();

    info!("Ticket service running");
    shutdown_signal().await;

    await_shutdown(vec![consumer], config.shutdown_timeout()).await;
    if let Err(e) = broker.close().await {
        warn!(error = %e, "Failed to close broker connection");
    }
    info!("Ticket service stopped");
    Ok(())
}
