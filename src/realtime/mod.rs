//! Realtime ingestion: subscribe to the mutation stream and hand every verified
//! record to an apply callback.
//!
//! The worker never touches the cache itself; the [`ApplyCallback`] passed to
//! [`RealtimeNotifier::start`] is the only seam between the two (see
//! [`crate::cache::cache_apply_callback`]).

mod handler;
pub mod worker;

pub use worker::{IngestionWorker, WorkerState};

use crate::config::{NotifierMetadata, RealtimeConfig};
use crate::core::{DataLoadingStats, KvError, Result};
use crate::metrics::MetricsRecorder;
use crate::retry::{CancellableWait, SleepFor};
use crate::transport::{LocalBroker, Subscriber};
use async_trait::async_trait;
use std::sync::Arc;

/// Applies one verified binary record; called concurrently from transport threads.
pub type ApplyCallback = Arc<dyn Fn(&[u8]) -> Result<DataLoadingStats> + Send + Sync>;

/// Builds the wait a worker idles and backs off on for one start/stop cycle.
pub type WaitFactory = Arc<dyn Fn() -> Arc<dyn CancellableWait> + Send + Sync>;

#[async_trait]
pub trait RealtimeNotifier: Send + Sync {
    /// Begins consuming in the background. Fails with
    /// [`KvError::AlreadyRunning`] unless the notifier is stopped.
    fn start(&self, callback: ApplyCallback) -> Result<()>;

    /// Cancels the session, wakes the worker and waits for it to exit.
    /// Stopping a stopped notifier is a no-op.
    async fn stop(&self) -> Result<()>;

    fn is_running(&self) -> bool;
}

/// Overrides for [`create_realtime_notifier`].
#[derive(Clone, Default)]
pub struct RealtimeNotifierOptions {
    pub subscriber: Option<Arc<dyn Subscriber>>,
    pub wait_factory: Option<WaitFactory>,
}

impl RealtimeNotifierOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `subscriber` instead of resolving one from the metadata
    pub fn subscriber(mut self, subscriber: Arc<dyn Subscriber>) -> Self {
        self.subscriber = Some(subscriber);
        self
    }

    pub fn wait_factory(mut self, wait_factory: WaitFactory) -> Self {
        self.wait_factory = Some(wait_factory);
        self
    }
}

fn default_wait_factory() -> WaitFactory {
    Arc::new(|| Arc::new(SleepFor::new()) as Arc<dyn CancellableWait>)
}

fn subscriber_for(metadata: &NotifierMetadata) -> Result<Arc<dyn Subscriber>> {
    match metadata {
        NotifierMetadata::Local { topic, .. } => Ok(Arc::new(LocalBroker::topic(topic))),
        other => Err(KvError::Configuration(format!(
            "no transport linked for provider {:?}",
            other.provider()
        ))),
    }
}

/// Creates the notifier for `metadata`, consuming with `metadata.num_threads()`
/// concurrent handlers.
pub fn create_realtime_notifier(
    metrics: Arc<dyn MetricsRecorder>,
    metadata: &NotifierMetadata,
    config: RealtimeConfig,
    options: RealtimeNotifierOptions,
) -> Result<Box<dyn RealtimeNotifier>> {
    let subscriber = match options.subscriber {
        Some(subscriber) => subscriber,
        None => subscriber_for(metadata)?,
    };
    let wait_factory = options.wait_factory.unwrap_or_else(default_wait_factory);

    Ok(Box::new(IngestionWorker::new(
        metrics,
        subscriber,
        config,
        metadata.num_threads(),
        wait_factory,
    )))
}
