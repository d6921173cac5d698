//! Metric sinks for the realtime data plane.
//!
//! Components record through the [`MetricsRecorder`] trait so the exporter
//! wiring stays outside this crate. [`InMemoryMetricsRecorder`] records into its
//! own prometheus registry, which tests read back and the CLI renders.

pub mod in_memory;

pub use in_memory::{HistogramSnapshot, InMemoryMetricsRecorder};

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Handler latency for one realtime message, in microseconds.
pub const RECEIVED_LOW_LATENCY_NOTIFICATIONS: &str = "ReceivedLowLatencyNotifications";
/// Producer `time_sent` attribute to receipt, in microseconds.
pub const RECEIVED_LOW_LATENCY_NOTIFICATIONS_E2E: &str = "ReceivedLowLatencyNotificationsE2E";
/// Transport publish time to receipt, in microseconds.
pub const RECEIVED_LOW_LATENCY_NOTIFICATIONS_E2E_TRANSPORT: &str =
    "ReceivedLowLatencyNotificationsE2ETransportProvided";
pub const REALTIME_DECODE_FAILURE: &str = "RealtimeDecodeRealtimeMessageFailure";
pub const REALTIME_APPLICATION_FAILURE: &str = "RealtimeRealtimeMessageApplicationFailure";
pub const REALTIME_TOTAL_ROWS_UPDATED: &str = "RealtimeTotalRowsUpdated";

/// Bucket boundaries for end-to-end latency histograms, in microseconds.
pub const E2E_BUCKET_BOUNDARIES: [f64; 20] = [
    160.0,
    220.0,
    280.0,
    320.0,
    640.0,
    1_200.0,
    2_500.0,
    5_000.0,
    10_000.0,
    20_000.0,
    40_000.0,
    80_000.0,
    160_000.0,
    320_000.0,
    640_000.0,
    1_000_000.0,
    1_300_000.0,
    2_600_000.0,
    5_000_000.0,
    10_000_000_000.0,
];

pub trait MetricsRecorder: Send + Sync {
    /// Declares bucket boundaries for a histogram before it is recorded into.
    fn register_histogram(&self, name: &str, description: &str, unit: &str, boundaries: &[f64]);

    fn increment_event_counter(&self, name: &str);

    /// Counts `count` events for `name` under a success or failure outcome.
    fn increment_event_status(&self, name: &str, ok: bool, count: u64);

    fn record_histogram_event(&self, name: &str, value: i64);

    fn record_latency(&self, name: &str, latency: Duration) {
        let micros = latency.as_micros().min(i64::MAX as u128) as i64;
        self.record_histogram_event(name, micros);
    }
}

/// Discards every observation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsRecorder;

impl MetricsRecorder for NoopMetricsRecorder {
    fn register_histogram(&self, _: &str, _: &str, _: &str, _: &[f64]) {}
    fn increment_event_counter(&self, _: &str) {}
    fn increment_event_status(&self, _: &str, _: bool, _: u64) {}
    fn record_histogram_event(&self, _: &str, _: i64) {}
}

/// Records the time between construction and drop as a latency observation.
pub struct ScopeLatencyRecorder {
    name: &'static str,
    started: Instant,
    metrics: Arc<dyn MetricsRecorder>,
}

impl ScopeLatencyRecorder {
    pub fn new(name: &'static str, metrics: Arc<dyn MetricsRecorder>) -> Self {
        Self {
            name,
            started: Instant::now(),
            metrics,
        }
    }
}

impl Drop for ScopeLatencyRecorder {
    fn drop(&mut self) {
        self.metrics.record_latency(self.name, self.started.elapsed());
    }
}
