use super::backoff::BackoffPolicy;
use super::wait::{CancellableWait, WaitOutcome};
use crate::config::RetryPolicy;
use crate::core::{KvError, Result};
use crate::metrics::MetricsRecorder;
use log::warn;
use std::future::Future;
use std::sync::Arc;
use tracing::{Instrument, info_span};

/// Retries a fallible async operation with exponential backoff.
///
/// Every attempt outcome is counted under `task_name` when a metrics sink is
/// attached. Backoff sleeps go through the shared [`CancellableWait`], so
/// interrupting the wait aborts the loop with [`KvError::Cancelled`] even when
/// attempts remain. Errors for which [`KvError::is_retryable`] is `false` are
/// returned from the attempt that produced them.
#[derive(Clone)]
pub struct RetryEngine {
    task_name: String,
    max_attempts: Option<u32>,
    backoff: BackoffPolicy,
    metrics: Option<Arc<dyn MetricsRecorder>>,
    wait: Arc<dyn CancellableWait>,
}

impl RetryEngine {
    /// Creates an engine that retries until the operation succeeds.
    pub fn new(task_name: impl Into<String>, wait: Arc<dyn CancellableWait>) -> Self {
        Self {
            task_name: task_name.into(),
            max_attempts: None,
            backoff: BackoffPolicy::default(),
            metrics: None,
            wait,
        }
    }

    pub fn from_policy(
        task_name: impl Into<String>,
        policy: &RetryPolicy,
        wait: Arc<dyn CancellableWait>,
    ) -> Self {
        Self::new(task_name, wait)
            .max_attempts(policy.max_attempts)
            .backoff(BackoffPolicy::from(policy))
    }

    /// Bounds the number of attempts; `<= 0` means unlimited.
    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = u32::try_from(max_attempts).ok().filter(|max| *max > 0);
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    /// Runs `operation` until it succeeds, the attempt bound is hit, or the
    /// backoff wait is interrupted.
    ///
    /// Operations with no payload use `T = ()`.
    pub async fn run<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_loop(operation, false).await
    }

    /// Same as [`RetryEngine::run`], inside a `retry.until_ok` span with one
    /// `retry.attempt` child span per attempt.
    pub async fn run_traced<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let span = info_span!("retry.until_ok", task = %self.task_name);
        self.run_loop(operation, true).instrument(span).await
    }

    async fn run_loop<T, F, Fut>(&self, mut operation: F, traced: bool) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 1;
        loop {
            let result = if traced {
                operation()
                    .instrument(info_span!("retry.attempt", task = %self.task_name, attempt))
                    .await
            } else {
                operation().await
            };

            if let Some(metrics) = &self.metrics {
                metrics.increment_event_status(&self.task_name, result.is_ok(), 1);
            }

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(err);
            }

            warn!(
                "{} failed with '{}' for attempt {}",
                self.task_name, err, attempt
            );

            if self.max_attempts.is_some_and(|max| attempt >= max) {
                return Err(err);
            }

            let delay = self.backoff.delay_for_attempt(attempt);
            if self.wait.wait(delay).await == WaitOutcome::Interrupted {
                return Err(KvError::Cancelled(format!(
                    "{} retry interrupted during backoff after attempt {}",
                    self.task_name, attempt
                )));
            }

            attempt = attempt.saturating_add(1);
        }
    }
}
