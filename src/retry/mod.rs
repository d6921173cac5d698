//! Resilience primitives: an interruptible wait and the retry engine built on it.
//!
//! The same [`CancellableWait`] instance is typically shared by a worker's idle
//! loop and the retries it performs, so a single `interrupt` both ends the idle
//! wait and aborts any backoff in progress.

pub mod backoff;
pub mod engine;
pub mod wait;

pub use backoff::BackoffPolicy;
pub use engine::RetryEngine;
pub use wait::{CancellableWait, SleepFor, WaitOutcome, unstoppable};
