//! Prometheus metrics for the choreography runtime.
//!
//! Recorders are plain functions over the `metrics` facade, so they are no-ops
//! until a recorder is installed. [`MetricsServer`] installs the Prometheus
//! recorder and serves it over HTTP.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `choreography_envelopes_total{topic, outcome}` - handled envelopes by outcome
//!   (`acknowledged`, `rejected`, `duplicate`, `failed`)
//! - `choreography_published_total{topic}` - acknowledged appends
//! - `choreography_publish_errors_total{topic}` - appends with unknown outcome
//! - `choreography_commit_errors_total{topic}` - refused cursor commits
//! - `choreography_dead_letters_total{topic}` - rejected poison messages
//! - `choreography_handler_retries_total{topic}` - redelivery attempts
//! - `choreography_stream_errors_total` - fetch errors from the broker
//!
//! ## Gauges
//! - `choreography_partitions_paused` - partitions halted after exhausting retries
//!
//! ## Histograms
//! - `choreography_handler_duration_seconds{topic}` - handler latency
//! - `choreography_publish_duration_seconds{topic}` - time to broker acknowledgment

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics recorder
    #[error("Failed to install metrics recorder: {0}")]
    Install(String),
}

/// Prometheus metrics endpoint.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a metrics server that will listen on `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the recorder and start serving `/metrics`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Build`] if the exporter cannot be configured and
    /// [`MetricsError::Install`] if another recorder is already installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        metrics::set_global_recorder(recorder).map_err(|e| MetricsError::Install(e.to_string()))?;

        tokio::spawn(async move {
            // ExporterError implements neither Debug nor Display.
            if exporter.await.is_err() {
                tracing::error!("Metrics exporter stopped");
            }
        });

        tracing::info!(addr = %self.addr, "Metrics available at http://{}/metrics", self.addr);
        self.handle = Some(handle);
        Ok(())
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if the server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register metric descriptions with the installed recorder.
pub fn register_metrics() {
    describe_counter!(
        "choreography_envelopes_total",
        "Envelopes handled by outcome (acknowledged, rejected, duplicate, failed)"
    );
    describe_counter!("choreography_published_total", "Envelopes acknowledged by the broker");
    describe_counter!(
        "choreography_publish_errors_total",
        "Publish attempts whose delivery outcome is unknown"
    );
    describe_counter!("choreography_commit_errors_total", "Offset commits refused by the broker");
    describe_counter!("choreography_dead_letters_total", "Poison messages committed past");
    describe_counter!("choreography_handler_retries_total", "Handler redelivery attempts");
    describe_counter!("choreography_stream_errors_total", "Errors reading from the broker");
    describe_gauge!(
        "choreography_partitions_paused",
        "Partitions halted after a handler exhausted its retries"
    );
    describe_histogram!("choreography_handler_duration_seconds", "Time spent in handlers");
    describe_histogram!(
        "choreography_publish_duration_seconds",
        "Time from publish call to broker acknowledgment"
    );
}

/// Outcome label for `choreography_envelopes_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeOutcome {
    /// Handled and committed
    Acknowledged,
    /// Poison message, dead-lettered and committed
    Rejected,
    /// Already handled before, committed without side effects
    Duplicate,
    /// Transient failure, not committed
    Failed,
}

impl EnvelopeOutcome {
    const fn label(self) -> &'static str {
        match self {
            Self::Acknowledged => "acknowledged",
            Self::Rejected => "rejected",
            Self::Duplicate => "duplicate",
            Self::Failed => "failed",
        }
    }
}

/// Metric recorders for publishers and subscribers.
pub struct ChoreographyMetrics;

impl ChoreographyMetrics {
    /// Record a handled envelope.
    pub fn record_envelope(topic: &str, outcome: EnvelopeOutcome, duration: Duration) {
        counter!(
            "choreography_envelopes_total",
            "topic" => topic.to_string(),
            "outcome" => outcome.label()
        )
        .increment(1);
        histogram!("choreography_handler_duration_seconds", "topic" => topic.to_string())
            .record(duration.as_secs_f64());
    }

    /// Record an acknowledged publish.
    pub fn record_publish(topic: &str, duration: Duration) {
        counter!("choreography_published_total", "topic" => topic.to_string()).increment(1);
        histogram!("choreography_publish_duration_seconds", "topic" => topic.to_string())
            .record(duration.as_secs_f64());
    }

    /// Record a publish with unknown outcome.
    pub fn record_publish_error(topic: &str) {
        counter!("choreography_publish_errors_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a refused commit.
    pub fn record_commit_error(topic: &str) {
        counter!("choreography_commit_errors_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a dead letter.
    pub fn record_dead_letter(topic: &str) {
        counter!("choreography_dead_letters_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a handler retry.
    pub fn record_retry(topic: &str) {
        counter!("choreography_handler_retries_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a broker read error.
    pub fn record_stream_error() {
        counter!("choreography_stream_errors_total").increment(1);
    }

    /// Record the current number of paused partitions.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_paused_partitions(count: usize) {
        gauge!("choreography_partitions_paused").set(count as f64);
    }
}
