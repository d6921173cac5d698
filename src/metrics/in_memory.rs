use super::MetricsRecorder;
use crate::core::{KvError, Result};
use prometheus::{Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

const EVENTS_TOTAL: &str = "kv_realtime_events_total";
const EVENT_STATUS_TOTAL: &str = "kv_realtime_event_status_total";

/// Point-in-time view of one histogram.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramSnapshot {
    /// Bucket upper bounds, ascending; the `+Inf` bucket is implicit.
    pub boundaries: Vec<f64>,
    pub count: u64,
    pub sum: f64,
}

struct NamedHistogram {
    histogram: Histogram,
    boundaries: Vec<f64>,
    declared: bool,
}

/// Process-local recorder backed by its own prometheus [`Registry`].
///
/// Event counters share one counter vector labelled by `event`, outcome counters
/// one labelled by `event` and `status`. Every histogram is a separate
/// collector so each keeps the buckets it was declared with.
pub struct InMemoryMetricsRecorder {
    registry: Registry,
    events: IntCounterVec,
    statuses: IntCounterVec,
    histograms: RwLock<HashMap<String, NamedHistogram>>,
}

fn status_label(ok: bool) -> &'static str {
    if ok { "success" } else { "error" }
}

/// Maps an event name onto the prometheus metric name charset.
fn metric_name(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == ':' { c } else { '_' })
        .collect();
    if sanitized.is_empty() || sanitized.starts_with(|c: char| c.is_ascii_digit()) {
        sanitized.insert(0, '_');
    }
    sanitized
}

fn sorted_boundaries(boundaries: &[f64]) -> Vec<f64> {
    let mut sorted: Vec<f64> = boundaries.iter().copied().filter(|b| b.is_finite()).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted.dedup();
    sorted
}

impl InMemoryMetricsRecorder {
    /// Creates a recorder with its own registry and the shared event counters.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let events = IntCounterVec::new(
            Opts::new(EVENTS_TOTAL, "Realtime events by name"),
            &["event"],
        )
        .map_err(|e| KvError::Execution(format!("Failed to create {}: {}", EVENTS_TOTAL, e)))?;
        let statuses = IntCounterVec::new(
            Opts::new(EVENT_STATUS_TOTAL, "Realtime event outcomes by name and status"),
            &["event", "status"],
        )
        .map_err(|e| {
            KvError::Execution(format!("Failed to create {}: {}", EVENT_STATUS_TOTAL, e))
        })?;
        for collector in [&events, &statuses] {
            registry
                .register(Box::new(collector.clone()))
                .map_err(|e| KvError::Execution(format!("Failed to register counters: {}", e)))?;
        }

        Ok(Self {
            registry,
            events,
            statuses,
            histograms: RwLock::new(HashMap::new()),
        })
    }

    /// The registry every metric of this recorder lives in, for exporters.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn read_histograms(&self) -> RwLockReadGuard<'_, HashMap<String, NamedHistogram>> {
        self.histograms.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_histograms(&self) -> RwLockWriteGuard<'_, HashMap<String, NamedHistogram>> {
        self.histograms.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn build_histogram(
        &self,
        name: &str,
        help: &str,
        boundaries: &[f64],
    ) -> Result<NamedHistogram> {
        let help = if help.is_empty() { name } else { help };
        let mut opts = HistogramOpts::new(metric_name(name), help);
        let boundaries = sorted_boundaries(boundaries);
        if !boundaries.is_empty() {
            opts = opts.buckets(boundaries.clone());
        }
        let histogram = Histogram::with_opts(opts)
            .map_err(|err| KvError::Execution(format!("histogram {}: {}", name, err)))?;
        self.registry
            .register(Box::new(histogram.clone()))
            .map_err(|err| KvError::Execution(format!("register histogram {}: {}", name, err)))?;
        let boundaries = if boundaries.is_empty() {
            prometheus::DEFAULT_BUCKETS.to_vec()
        } else {
            boundaries
        };
        Ok(NamedHistogram {
            histogram,
            boundaries,
            declared: false,
        })
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.events.with_label_values(&[name]).get()
    }

    pub fn status_count(&self, name: &str, ok: bool) -> u64 {
        self.statuses
            .with_label_values(&[name, status_label(ok)])
            .get()
    }

    pub fn histogram_count(&self, name: &str) -> u64 {
        self.read_histograms()
            .get(name)
            .map_or(0, |named| named.histogram.get_sample_count())
    }

    pub fn histogram(&self, name: &str) -> Option<HistogramSnapshot> {
        self.read_histograms().get(name).map(|named| HistogramSnapshot {
            boundaries: named.boundaries.clone(),
            count: named.histogram.get_sample_count(),
            sum: named.histogram.get_sample_sum(),
        })
    }

    /// `true` once `register_histogram` declared `name`.
    pub fn is_registered(&self, name: &str) -> bool {
        self.read_histograms()
            .get(name)
            .is_some_and(|named| named.declared)
    }

    /// Prometheus text exposition of everything recorded so far.
    pub fn render(&self) -> Result<String> {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .map_err(|err| KvError::Execution(format!("encode metrics: {}", err)))
    }
}

impl MetricsRecorder for InMemoryMetricsRecorder {
    fn register_histogram(&self, name: &str, description: &str, unit: &str, boundaries: &[f64]) {
        let mut histograms = self.write_histograms();
        if let Some(named) = histograms.get_mut(name) {
            named.declared = true;
            return;
        }
        let help = if unit.is_empty() {
            description.to_string()
        } else {
            format!("{} ({})", description, unit)
        };
        match self.build_histogram(name, &help, boundaries) {
            Ok(mut named) => {
                named.declared = true;
                histograms.insert(name.to_string(), named);
            }
            Err(err) => log::warn!("Dropping histogram {}: {}", name, err),
        }
    }

    fn increment_event_counter(&self, name: &str) {
        self.events.with_label_values(&[name]).inc();
    }

    fn increment_event_status(&self, name: &str, ok: bool, count: u64) {
        self.statuses
            .with_label_values(&[name, status_label(ok)])
            .inc_by(count);
    }

    fn record_histogram_event(&self, name: &str, value: i64) {
        if let Some(named) = self.read_histograms().get(name) {
            named.histogram.observe(value as f64);
            return;
        }

        let mut histograms = self.write_histograms();
        if !histograms.contains_key(name) {
            match self.build_histogram(name, name, &[]) {
                Ok(named) => {
                    histograms.insert(name.to_string(), named);
                }
                Err(err) => {
                    log::warn!("Dropping observation for histogram {}: {}", name, err);
                    return;
                }
            }
        }
        if let Some(named) = histograms.get(name) {
            named.histogram.observe(value as f64);
        }
    }
}
