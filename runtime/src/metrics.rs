//! Prometheus metrics for the delivery pipeline.
//!
//! Counters and histograms are emitted through the `metrics` facade by the
//! recorder types below; [`MetricsServer`] installs the Prometheus exporter
//! that serves them.
//!
//! - Outbox: rows written, published, failed, skipped
//! - Publisher: confirmation timeouts and negative confirmations
//! - Consumer: deliveries by outcome, handler latency
//! - Inbox: duplicates absorbed
//!
//! ```rust,no_run
//! use outpost_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, histogram};

/// Why the exporter could not start.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// The listener or recorder could not be built
    #[error("Cannot build Prometheus exporter: {0}")]
    Build(String),
    /// Another global recorder is already installed
    #[error("Cannot install Prometheus recorder: {0}")]
    Install(String),
}

/// Serves the pipeline counters on `/metrics` for Prometheus.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// A server that will listen on `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the global recorder and start serving `/metrics`.
    ///
    /// Must be called from within a Tokio runtime; the HTTP listener runs as a
    /// spawned task.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or a recorder is already
    /// installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        metrics::set_global_recorder(recorder).map_err(|e| MetricsError::Install(e.to_string()))?;

        register_metrics();

        let addr = self.addr;
        tokio::spawn(async move {
            // the exporter's error type carries no Display or Debug impl
            if exporter.await.is_err() {
                tracing::error!(%addr, "Metrics exporter stopped");
            }
        });

        self.handle = Some(handle);
        tracing::info!(addr = %self.addr, "Prometheus exporter listening");
        Ok(())
    }

    /// Recorder handle, once started.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Current exposition text; `None` before [`start`](Self::start).
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Describe every pipeline metric to the installed recorder.
pub fn register_metrics() {
    // Outbox
    describe_counter!(
        "outbox.events.written",
        "Outbox rows written alongside a business transaction"
    );
    describe_counter!(
        "outbox.events.published",
        "Outbox rows published and marked published"
    );
    describe_counter!(
        "outbox.publish.failed",
        "Outbox rows left unpublished after exhausting publish attempts"
    );
    describe_counter!(
        "outbox.events.skipped",
        "Outbox rows skipped because they could not be turned into an envelope"
    );

    // Publisher
    describe_counter!(
        "publisher.confirm.timeout",
        "Publishes whose confirmation did not arrive in time (treated as success)"
    );
    describe_counter!("publisher.nacked", "Publishes rejected by the broker");

    // Consumer
    describe_counter!(
        "consumer.deliveries",
        "Deliveries settled, labelled by outcome"
    );
    describe_histogram!(
        "consumer.handler.duration_ms",
        "Time spent in the message handler"
    );

    // Inbox
    describe_counter!(
        "inbox.duplicates",
        "Messages absorbed because their id was already consumed"
    );
}

/// Outbox metrics recorder.
pub struct OutboxMetrics;

impl OutboxMetrics {
    /// Record a row written by the outbox writer.
    pub fn record_written() {
        counter!("outbox.events.written").increment(1);
    }

    /// Record a row published and marked.
    pub fn record_published() {
        counter!("outbox.events.published").increment(1);
    }

    /// Record a row whose publish attempts were exhausted.
    pub fn record_publish_failed() {
        counter!("outbox.publish.failed").increment(1);
    }

    /// Record a row that could not be dispatched.
    pub fn record_skipped(event_type: &str) {
        counter!("outbox.events.skipped", "event_type" => event_type.to_string()).increment(1);
    }
}

/// Publisher metrics recorder.
pub struct PublisherMetrics;

impl PublisherMetrics {
    /// Record a confirmation timeout.
    pub fn record_confirm_timeout() {
        counter!("publisher.confirm.timeout").increment(1);
    }

    /// Record a negative confirmation.
    pub fn record_nacked() {
        counter!("publisher.nacked").increment(1);
    }
}

/// Consumer metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record how a delivery was settled.
    pub fn record_delivery(outcome: &'static str) {
        counter!("consumer.deliveries", "outcome" => outcome).increment(1);
    }

    /// Record handler latency.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_handler_duration(duration: Duration) {
        histogram!("consumer.handler.duration_ms").record(duration.as_millis() as f64);
    }
}

/// Inbox metrics recorder.
pub struct InboxMetrics;

impl InboxMetrics {
    /// Record a duplicate absorbed by the inbox.
    pub fn record_duplicate() {
        counter!("inbox.duplicates").increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn render_with(record: impl FnOnce()) -> String {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, record);
        handle.render()
    }

    #[test]
    fn unstarted_server_renders_nothing() {
        let server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[tokio::test]
    async fn started_server_exports_the_global_recorder() {
        let mut server = MetricsServer::new("127.0.0.1:0".parse().unwrap());

        server.start().unwrap();
        OutboxMetrics::record_written();

        assert!(server.handle().is_some());
        assert!(server.render().unwrap().contains("outbox_events_written"));
        assert!(matches!(
            MetricsServer::new("127.0.0.1:0".parse().unwrap()).start(),
            Err(MetricsError::Install(_))
        ));
    }

    #[test]
    fn outbox_counters_are_exported() {
        let rendered = render_with(|| {
            OutboxMetrics::record_written();
            OutboxMetrics::record_published();
            OutboxMetrics::record_publish_failed();
            OutboxMetrics::record_skipped("order.shipped");
        });

        assert!(rendered.contains("outbox_events_written"));
        assert!(rendered.contains("outbox_events_published"));
        assert!(rendered.contains("outbox_publish_failed"));
        assert!(rendered.contains("event_type=\"order.shipped\""));
    }

    #[test]
    fn consumer_deliveries_are_labelled_by_outcome() {
        let rendered = render_with(|| {
            ConsumerMetrics::record_delivery("acked");
            ConsumerMetrics::record_delivery("retried");
            ConsumerMetrics::record_handler_duration(Duration::from_millis(12));
        });

        assert!(rendered.contains("outcome=\"acked\""));
        assert!(rendered.contains("outcome=\"retried\""));
        assert!(rendered.contains("consumer_handler_duration_ms"));
    }

    #[test]
    fn publisher_and_inbox_counters_are_exported() {
        let rendered = render_with(|| {
            PublisherMetrics::record_confirm_timeout();
            PublisherMetrics::record_nacked();
            InboxMetrics::record_duplicate();
        });

        assert!(rendered.contains("publisher_confirm_timeout"));
        assert!(rendered.contains("publisher_nacked"));
        assert!(rendered.contains("inbox_duplicates"));
    }
}
