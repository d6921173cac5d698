use super::ApplyCallback;
use crate::codec::MutationCodec;
use crate::metrics::{
    MetricsRecorder, REALTIME_APPLICATION_FAILURE, REALTIME_DECODE_FAILURE,
    REALTIME_TOTAL_ROWS_UPDATED, RECEIVED_LOW_LATENCY_NOTIFICATIONS,
    RECEIVED_LOW_LATENCY_NOTIFICATIONS_E2E, RECEIVED_LOW_LATENCY_NOTIFICATIONS_E2E_TRANSPORT,
    ScopeLatencyRecorder,
};
use crate::transport::{AckHandler, ReceivedMessage, TIME_SENT_ATTRIBUTE};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use tracing::{Level, event, info_span};

/// Per-message work of the ingestion worker. Runs on transport threads, so it
/// only touches the callback and the metrics sink.
pub(crate) struct MessageProcessor {
    callback: ApplyCallback,
    metrics: Arc<dyn MetricsRecorder>,
}

impl MessageProcessor {
    pub(crate) fn new(callback: ApplyCallback, metrics: Arc<dyn MetricsRecorder>) -> Self {
        Self { callback, metrics }
    }

    /// Every delivery is acked, whatever happens to it. A message that cannot
    /// be decoded or applied would otherwise be redelivered forever.
    pub(crate) fn handle(&self, message: ReceivedMessage, ack: AckHandler) {
        {
            let _latency =
                ScopeLatencyRecorder::new(RECEIVED_LOW_LATENCY_NOTIFICATIONS, self.metrics.clone());
            let span = info_span!(
                "realtime.message",
                message_id = %message.message_id,
                delivery_attempt = message.delivery_attempt
            );
            let _enter = span.enter();
            self.process(&message);
        }
        ack.ack();
    }

    fn process(&self, message: &ReceivedMessage) {
        let binary = match MutationCodec::verify_payload(&message.data) {
            Ok(binary) => binary,
            Err(err) => {
                self.metrics.increment_event_counter(REALTIME_DECODE_FAILURE);
                event!(Level::ERROR, error = %err, "failed to decode realtime message");
                return;
            }
        };

        match (self.callback)(&binary) {
            Ok(stats) => {
                self.metrics.increment_event_status(
                    REALTIME_TOTAL_ROWS_UPDATED,
                    true,
                    stats.rows_touched(),
                );
                event!(
                    Level::DEBUG,
                    updated = stats.total_updated_records,
                    deleted = stats.total_deleted_records,
                    dropped = stats.total_dropped_records,
                    "realtime message applied"
                );
            }
            Err(err) => {
                self.metrics
                    .increment_event_counter(REALTIME_APPLICATION_FAILURE);
                event!(Level::ERROR, error = %err, "failed to apply realtime message");
            }
        }

        self.record_transport_latency(message);
        self.record_producer_latency(message);
    }

    fn record_transport_latency(&self, message: &ReceivedMessage) {
        self.record_since(RECEIVED_LOW_LATENCY_NOTIFICATIONS_E2E_TRANSPORT, message.publish_time);
    }

    fn record_producer_latency(&self, message: &ReceivedMessage) {
        let Some(sent_nanos) = message
            .attribute(TIME_SENT_ATTRIBUTE)
            .and_then(|raw| raw.trim().parse::<i64>().ok())
        else {
            return;
        };
        self.record_since(RECEIVED_LOW_LATENCY_NOTIFICATIONS_E2E, Utc.timestamp_nanos(sent_nanos));
    }

    fn record_since(&self, name: &str, since: DateTime<Utc>) {
        let elapsed = Utc::now().signed_duration_since(since);
        let micros = elapsed.num_microseconds().unwrap_or(i64::MAX);
        self.metrics.record_histogram_event(name, micros);
    }
}
