//! Prometheus Metrics Module
//!
//! # Metrics Categories
//!
//! - **Ingestion**: trades received, persisted and dropped per channel
//! - **Notifications**: price notifications handed off or throttled
//! - **Stream**: connection state, reconnects, malformed frames
//! - **Subscriptions**: wanted tickers and upstream subscriptions
//! - **Webhook**: requests by outcome
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::application::services::BatchSummary;
use crate::domain::trade::TradeSource;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder, or return the already installed one.
///
/// # Errors
///
/// Returns `BuildError` if another recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Ingestion
    describe_counter!(
        "ingest_trades_received_total",
        "Raw trade records received per channel"
    );
    describe_counter!(
        "ingest_ticks_persisted_total",
        "Price ticks written per channel"
    );
    describe_counter!(
        "ingest_trades_dropped_total",
        "Trades not persisted, by reason"
    );
    describe_histogram!(
        "ingest_duration_seconds",
        "Time to ingest one trade batch"
    );
    describe_counter!(
        "ingest_notifications_total",
        "Price notifications handed to the gateway"
    );

    // Stream
    describe_gauge!(
        "stream_connected",
        "1 while the upstream websocket is connected"
    );
    describe_gauge!(
        "stream_active_subscriptions",
        "Symbols currently subscribed upstream"
    );
    describe_counter!(
        "stream_reconnects_total",
        "Scheduled upstream reconnect attempts"
    );
    describe_counter!(
        "stream_frames_malformed_total",
        "Inbound frames that failed to decode"
    );

    // Registry
    describe_gauge!(
        "registry_tracked_tickers",
        "Tickers with at least one watchlist reference"
    );

    // Webhook
    describe_counter!(
        "webhook_requests_total",
        "Webhook requests by outcome"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Reason a trade did not become a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Record failed validation.
    Invalid,
    /// No snapshot for the ticker.
    Untracked,
    /// Storage call failed.
    StoreError,
}

impl DropReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Untracked => "untracked",
            Self::StoreError => "store_error",
        }
    }
}

/// Webhook request outcome label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Secret missing or wrong.
    Unauthorized,
    /// Body did not parse.
    BadRequest,
    /// Non-trade event acknowledged.
    Ignored,
    /// Trades accepted for ingestion.
    Accepted,
}

impl WebhookOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::BadRequest => "bad_request",
            Self::Ignored => "ignored",
            Self::Accepted => "accepted",
        }
    }
}

/// Record raw records received on a channel.
pub fn record_trades_received(source: TradeSource, count: usize) {
    counter!("ingest_trades_received_total", "source" => source.as_str())
        .increment(count as u64);
}

/// Record the tally of one ingested batch.
pub fn record_batch(source: TradeSource, summary: &BatchSummary, duration: Duration) {
    counter!("ingest_ticks_persisted_total", "source" => source.as_str())
        .increment(summary.ingested as u64);

    for (reason, count) in [
        (DropReason::Invalid, summary.rejected),
        (DropReason::Untracked, summary.untracked),
        (DropReason::StoreError, summary.failed),
    ] {
        if count > 0 {
            counter!("ingest_trades_dropped_total", "reason" => reason.as_str())
                .increment(count as u64);
        }
    }

    if summary.notified > 0 {
        counter!("ingest_notifications_total", "outcome" => "sent")
            .increment(summary.notified as u64);
    }

    histogram!("ingest_duration_seconds", "source" => source.as_str())
        .record(duration.as_secs_f64());
}

/// Update the connection gauge.
pub fn set_stream_connected(connected: bool) {
    gauge!("stream_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Update the upstream subscription gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_subscriptions(count: usize) {
    gauge!("stream_active_subscriptions").set(count as f64);
}

/// Update the wanted-ticker gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_registry_tickers(count: usize) {
    gauge!("registry_tracked_tickers").set(count as f64);
}

/// Record a scheduled reconnect.
pub fn record_reconnect() {
    counter!("stream_reconnects_total").increment(1);
}

/// Record an undecodable inbound frame.
pub fn record_malformed_frame() {
    counter!("stream_frames_malformed_total").increment(1);
}

/// Record a webhook request.
pub fn record_webhook_request(outcome: WebhookOutcome) {
    counter!("webhook_requests_total", "outcome" => outcome.as_str()).increment(1);
}

// =============================================================================
// Tests
// =============================================================================
