//! Prometheus Metrics Module
//!
//! Exposes application metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Frames**: DTC frames decoded and frames dropped as malformed
//! - **Session**: current session state, reconnect attempts
//! - **Subscriptions**: active subscriptions, rejects by category, dropped updates
//! - **Tick files**: records decoded, corrupt records skipped, tailer faults
//! - **Historical**: fetch duration by outcome
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! before [`init_metrics`] is a no-op.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::subscription::RejectCategory;
use crate::infrastructure::dtc::session::SessionState;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Subsequent calls return the handle installed by the first.
///
/// # Errors
///
/// Returns an error if the global recorder cannot be installed.
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
    // Frame counters
    describe_counter!(
        "dtc_market_data_frames_decoded_total",
        "Total DTC frames decoded by message type"
    );
    describe_counter!(
        "dtc_market_data_decode_errors_total",
        "Total DTC frames dropped as malformed"
    );

    // Session
    describe_gauge!(
        "dtc_market_data_session_state",
        "Current DTC session state (0 disconnected .. 4 active)"
    );
    describe_counter!(
        "dtc_market_data_reconnects_total",
        "Total DTC reconnection attempts"
    );

    // Subscriptions
    describe_gauge!(
        "dtc_market_data_active_subscriptions",
        "Subscriptions currently streaming"
    );
    describe_counter!(
        "dtc_market_data_subscription_rejects_total",
        "Market data rejects by category"
    );
    describe_counter!(
        "dtc_market_data_updates_dropped_total",
        "Price updates dropped due to slow consumers"
    );

    // Tick files
    describe_counter!(
        "dtc_market_data_tick_records_total",
        "Tick file records decoded"
    );
    describe_counter!(
        "dtc_market_data_corrupt_records_total",
        "Records skipped as corrupt"
    );
    describe_counter!(
        "dtc_market_data_tailer_faults_total",
        "Tick file access faults by kind"
    );

    // Historical
    describe_histogram!(
        "dtc_market_data_historical_fetch_seconds",
        "Duration of historical fetches by outcome"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Where a corrupt record was found.
#[derive(Debug, Clone, Copy)]
pub enum RecordSource {
    /// Tailed or decoded tick file.
    TickFile,
    /// Historical response stream.
    Historical,
}

impl RecordSource {
    const fn as_str(self) -> &'static str {
        match self {
            Self::TickFile => "tick_file",
            Self::Historical => "historical",
        }
    }
}

/// Record a decoded DTC frame.
pub fn record_frame_decoded(type_code: u16) {
    counter!(
        "dtc_market_data_frames_decoded_total",
        "type" => type_code.to_string()
    )
    .increment(1);
}

/// Record a malformed DTC frame.
pub fn record_decode_error() {
    counter!("dtc_market_data_decode_errors_total").increment(1);
}

/// Publish the session state.
pub fn set_session_state(state: SessionState) {
    gauge!("dtc_market_data_session_state").set(f64::from(state.ordinal()));
}

/// Record a reconnection attempt.
pub fn record_reconnect() {
    counter!("dtc_market_data_reconnects_total").increment(1);
}

/// Update the active subscription count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_subscriptions(count: usize) {
    gauge!("dtc_market_data_active_subscriptions").set(count as f64);
}

/// Record a market data reject.
pub fn record_subscription_reject(category: RejectCategory) {
    counter!(
        "dtc_market_data_subscription_rejects_total",
        "category" => category.as_str()
    )
    .increment(1);
}

/// Record price updates dropped because a consumer fell behind.
pub fn record_updates_dropped(count: u64) {
    counter!("dtc_market_data_updates_dropped_total").increment(count);
}

/// Record tick file records decoded.
pub fn record_tick_records(count: u64) {
    counter!("dtc_market_data_tick_records_total").increment(count);
}

/// Record records skipped as corrupt.
pub fn record_corrupt_records(source: RecordSource, count: u64) {
    if count == 0 {
        return;
    }
    counter!(
        "dtc_market_data_corrupt_records_total",
        "source" => source.as_str()
    )
    .increment(count);
}

/// Record a tailer access fault.
pub fn record_tailer_fault(kind: &'static str) {
    counter!(
        "dtc_market_data_tailer_faults_total",
        "kind" => kind
    )
    .increment(1);
}

/// Record how long a historical fetch took to reach its terminal event.
pub fn record_historical_duration(outcome: &'static str, duration: Duration) {
    histogram!(
        "dtc_market_data_historical_fetch_seconds",
        "outcome" => outcome
    )
    .record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================
