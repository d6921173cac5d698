// ============================================================================
// kv-realtime Library
// ============================================================================

pub mod cache;
pub mod cloud;
pub mod codec;
pub mod config;
pub mod core;
pub mod metrics;
pub mod realtime;
pub mod retry;
pub mod transport;

// Re-export main types for convenience
pub use cache::{Cache, CacheStats, KeyValueCache, cache_apply_callback};
pub use codec::{DecodeError, MutationCodec};
pub use config::{NotifierMetadata, RealtimeConfig, RetryPolicy};
pub use crate::core::{DataLoadingStats, KvError, LogicalTime, MutationKind, MutationRecord, Result};
pub use metrics::{InMemoryMetricsRecorder, MetricsRecorder, NoopMetricsRecorder};
pub use realtime::{
    ApplyCallback, IngestionWorker, RealtimeNotifier, RealtimeNotifierOptions,
    create_realtime_notifier,
};
pub use retry::{BackoffPolicy, CancellableWait, RetryEngine, SleepFor, WaitOutcome};
pub use transport::{LocalBroker, LocalTopic};
