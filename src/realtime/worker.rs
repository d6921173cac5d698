use super::handler::MessageProcessor;
use super::{ApplyCallback, RealtimeNotifier, WaitFactory};
use crate::config::RealtimeConfig;
use crate::core::{KvError, Result};
use crate::metrics::{
    E2E_BUCKET_BOUNDARIES, MetricsRecorder, RECEIVED_LOW_LATENCY_NOTIFICATIONS_E2E,
    RECEIVED_LOW_LATENCY_NOTIFICATIONS_E2E_TRANSPORT,
};
use crate::retry::{CancellableWait, RetryEngine};
use crate::transport::{
    AckHandler, MessageHandler, ReceivedMessage, SubscribeOptions, Subscriber, SubscriptionSession,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{Instrument, Level, event, info_span};

const SUBSCRIBE_TASK: &str = "RealtimeSubscribe";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

// Lifecycle bookkeeping is replaced whole, so a panicked holder leaves it usable.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct WorkerShared {
    state: Mutex<WorkerState>,
    /// Written by the worker task, cancelled by `stop`.
    session: Mutex<Option<Box<dyn SubscriptionSession>>>,
    wait: Mutex<Option<Arc<dyn CancellableWait>>>,
    /// Terminal subscribe failure of the current cycle, reported by `stop`.
    failure: Mutex<Option<KvError>>,
    subscriber: Arc<dyn Subscriber>,
    metrics: Arc<dyn MetricsRecorder>,
    config: RealtimeConfig,
    num_threads: usize,
}

impl WorkerShared {
    fn set_state(&self, from: WorkerState, to: WorkerState) {
        let mut state = lock(&self.state);
        if *state == from {
            *state = to;
        }
    }

    /// Stores the session unless `stop` already interrupted this cycle.
    fn install_session(&self, session: Box<dyn SubscriptionSession>, wait: &dyn CancellableWait) {
        let mut slot = lock(&self.session);
        if wait.is_interrupted() {
            if let Err(err) = session.cancel() {
                event!(Level::WARN, error = %err, "failed to cancel late session");
            }
            return;
        }
        *slot = Some(session);
    }

    fn cancel_session(&self) -> Result<()> {
        match lock(&self.session).take() {
            Some(session) => session.cancel(),
            None => Ok(()),
        }
    }
}

/// Drives one subscription per start/stop cycle on a background task.
///
/// `start` spawns the task, which opens the session (retrying per
/// [`RealtimeConfig::subscribe_retry`]) and then idles on the cycle's
/// [`CancellableWait`] until `stop` interrupts it. Message handling happens on
/// the transport's own threads through a [`MessageProcessor`].
pub struct IngestionWorker {
    shared: Arc<WorkerShared>,
    wait_factory: WaitFactory,
    join_handle: Mutex<Option<JoinHandle<()>>>,
    /// Serializes concurrent `stop` calls.
    stopping: tokio::sync::Mutex<()>,
}

impl IngestionWorker {
    pub fn new(
        metrics: Arc<dyn MetricsRecorder>,
        subscriber: Arc<dyn Subscriber>,
        config: RealtimeConfig,
        num_threads: usize,
        wait_factory: WaitFactory,
    ) -> Self {
        metrics.register_histogram(
            RECEIVED_LOW_LATENCY_NOTIFICATIONS_E2E,
            "Low latency notifications E2E latency",
            "microsecond",
            &E2E_BUCKET_BOUNDARIES,
        );
        metrics.register_histogram(
            RECEIVED_LOW_LATENCY_NOTIFICATIONS_E2E_TRANSPORT,
            "Low latency notifications E2E latency transport supplied",
            "microsecond",
            &E2E_BUCKET_BOUNDARIES,
        );

        Self {
            shared: Arc::new(WorkerShared {
                state: Mutex::new(WorkerState::Stopped),
                session: Mutex::new(None),
                wait: Mutex::new(None),
                failure: Mutex::new(None),
                subscriber,
                metrics,
                config,
                num_threads: num_threads.max(1),
            }),
            wait_factory,
            join_handle: Mutex::new(None),
            stopping: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> WorkerState {
        *lock(&self.shared.state)
    }

    /// `true` while the current session is open and delivering.
    pub fn is_subscribed(&self) -> bool {
        lock(&self.shared.session)
            .as_ref()
            .is_some_and(|session| session.is_active())
    }
}

async fn watch_stream(
    shared: Arc<WorkerShared>,
    callback: ApplyCallback,
    wait: Arc<dyn CancellableWait>,
) {
    let processor = Arc::new(MessageProcessor::new(callback, shared.metrics.clone()));
    let handler: MessageHandler = Arc::new(move |message: ReceivedMessage, ack: AckHandler| {
        processor.handle(message, ack)
    });
    let options = SubscribeOptions {
        max_concurrency: shared.num_threads,
    };

    let engine =
        RetryEngine::from_policy(SUBSCRIBE_TASK, &shared.config.subscribe_retry, wait.clone())
            .metrics(shared.metrics.clone());
    let subscriber = shared.subscriber.clone();
    let subscribed = engine
        .run_traced(|| subscriber.subscribe(handler.clone(), options))
        .await;

    match subscribed {
        Ok(session) => shared.install_session(session, wait.as_ref()),
        Err(err) => {
            if !err.is_cancelled() {
                event!(Level::ERROR, error = %err, "realtime subscription failed");
                *lock(&shared.failure) = Some(err);
            }
            return;
        }
    }

    shared.set_state(WorkerState::Starting, WorkerState::Running);
    event!(Level::INFO, "realtime notifier initialized");

    wait.idle().await;

    if let Err(err) = shared.cancel_session() {
        event!(Level::WARN, error = %err, "failed to cancel session on exit");
    }
    event!(Level::INFO, "realtime notifier stopped watching");
}

#[async_trait]
impl RealtimeNotifier for IngestionWorker {
    fn start(&self, callback: ApplyCallback) -> Result<()> {
        let mut state = lock(&self.shared.state);
        if *state != WorkerState::Stopped {
            return Err(KvError::AlreadyRunning);
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|err| {
            KvError::Configuration(format!("realtime notifier needs a tokio runtime: {}", err))
        })?;

        // A wait cannot be reset once interrupted, so every cycle gets its own.
        let wait = (self.wait_factory)();
        *lock(&self.shared.wait) = Some(wait.clone());
        *lock(&self.shared.failure) = None;
        *state = WorkerState::Starting;

        let span = info_span!("realtime.watch", threads = self.shared.num_threads);
        let watch = watch_stream(self.shared.clone(), callback, wait).instrument(span);
        let join_handle = runtime.spawn(watch);
        *lock(&self.join_handle) = Some(join_handle);

        event!(Level::INFO, "realtime notifier starting");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let _serial = self.stopping.lock().await;
        {
            let mut state = lock(&self.shared.state);
            if *state == WorkerState::Stopped {
                return Ok(());
            }
            *state = WorkerState::Stopping;
        }
        event!(Level::INFO, "realtime notifier received stop signal");

        let mut first_error = None;
        {
            // Held across both steps so the worker cannot install a session in between.
            let mut session = lock(&self.shared.session);
            if let Some(session) = session.take() {
                if let Err(err) = session.cancel() {
                    first_error.get_or_insert(err);
                }
            }
            let wait = lock(&self.shared.wait).take();
            if let Some(wait) = wait {
                if let Err(err) = wait.interrupt() {
                    first_error.get_or_insert(err);
                }
            }
        }

        let join_handle = lock(&self.join_handle).take();
        if let Some(join_handle) = join_handle {
            if let Err(err) = join_handle.await {
                first_error.get_or_insert(KvError::Execution(format!(
                    "realtime worker join: {}",
                    err
                )));
            }
        }

        let failure = lock(&self.shared.failure).take();
        *lock(&self.shared.state) = WorkerState::Stopped;
        event!(Level::INFO, "realtime notifier stopped");

        match first_error.or(failure) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn is_running(&self) -> bool {
        self.state() != WorkerState::Stopped
    }
}

impl Drop for IngestionWorker {
    fn drop(&mut self) {
        if self.state() == WorkerState::Stopped {
            return;
        }
        event!(Level::WARN, "realtime notifier dropped without stop");
        if let Err(err) = self.shared.cancel_session() {
            event!(Level::WARN, error = %err, "failed to cancel session on drop");
        }
        if let Some(wait) = lock(&self.shared.wait).take() {
            if let Err(err) = wait.interrupt() {
                event!(Level::WARN, error = %err, "failed to interrupt retry wait on drop");
            }
        }
    }
}
