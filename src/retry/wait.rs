use crate::core::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

/// How a [`CancellableWait::wait`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed,
    Interrupted,
}

/// An interruptible timer shared between a sleeping task and a controller.
///
/// Once interrupted, an instance stays interrupted: every later wait returns
/// [`WaitOutcome::Interrupted`] immediately.
#[async_trait]
pub trait CancellableWait: Send + Sync {
    async fn wait(&self, duration: Duration) -> WaitOutcome;

    /// Blocks until [`CancellableWait::interrupt`] is called.
    async fn idle(&self) -> WaitOutcome {
        self.wait(Duration::MAX).await
    }

    /// Wakes every current and future waiter. May be called from any thread.
    fn interrupt(&self) -> Result<()>;

    fn is_interrupted(&self) -> bool;
}

/// Tokio-timer implementation of [`CancellableWait`].
pub struct SleepFor {
    interrupted: watch::Sender<bool>,
}

impl SleepFor {
    pub fn new() -> Self {
        let (interrupted, _) = watch::channel(false);
        Self { interrupted }
    }
}

impl Default for SleepFor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CancellableWait for SleepFor {
    async fn wait(&self, duration: Duration) -> WaitOutcome {
        let mut interrupted = self.interrupted.subscribe();
        if *interrupted.borrow_and_update() {
            return WaitOutcome::Interrupted;
        }

        tokio::select! {
            biased;
            _ = until_interrupted(&mut interrupted) => WaitOutcome::Interrupted,
            _ = sleep(duration) => WaitOutcome::Completed,
        }
    }

    async fn idle(&self) -> WaitOutcome {
        let mut interrupted = self.interrupted.subscribe();
        until_interrupted(&mut interrupted).await;
        WaitOutcome::Interrupted
    }

    fn interrupt(&self) -> Result<()> {
        self.interrupted.send_replace(true);
        Ok(())
    }

    fn is_interrupted(&self) -> bool {
        *self.interrupted.borrow()
    }
}

async fn until_interrupted(receiver: &mut watch::Receiver<bool>) {
    loop {
        if *receiver.borrow_and_update() {
            return;
        }
        // The sender lives as long as the `SleepFor`, so `changed` only fails
        // once nobody can interrupt anymore.
        if receiver.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// A wait nobody holds a handle to interrupt; used for setup-time retries.
pub fn unstoppable() -> std::sync::Arc<dyn CancellableWait> {
    std::sync::Arc::new(SleepFor::new())
}
