//! Message transport seam between the realtime worker and a pub/sub provider.
//!
//! A [`Subscriber`] opens a [`SubscriptionSession`] that delivers each message
//! to a [`MessageHandler`] together with an [`AckHandler`]. Delivery is
//! at-least-once: a message that is nacked, or whose handler is dropped without
//! acking, is delivered again.

pub mod local;

pub use local::{LocalBroker, LocalTopic};

use crate::core::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Attribute carrying the producer send time, in nanoseconds since the epoch.
pub const TIME_SENT_ATTRIBUTE: &str = "time_sent";

#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
    /// Time the transport accepted the message.
    pub publish_time: DateTime<Utc>,
    /// 1 on first delivery.
    pub delivery_attempt: u32,
}

impl ReceivedMessage {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Ack,
    Nack,
}

/// Settles one delivery. Dropping it without calling [`AckHandler::ack`]
/// counts as a nack.
pub struct AckHandler {
    settle: Option<Box<dyn FnOnce(AckOutcome) + Send>>,
}

impl AckHandler {
    pub fn new(settle: impl FnOnce(AckOutcome) + Send + 'static) -> Self {
        Self {
            settle: Some(Box::new(settle)),
        }
    }

    pub fn ack(mut self) {
        self.finish(AckOutcome::Ack);
    }

    pub fn nack(mut self) {
        self.finish(AckOutcome::Nack);
    }

    fn finish(&mut self, outcome: AckOutcome) {
        if let Some(settle) = self.settle.take() {
            settle(outcome);
        }
    }
}

impl Drop for AckHandler {
    fn drop(&mut self) {
        self.finish(AckOutcome::Nack);
    }
}

impl fmt::Debug for AckHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandler")
            .field("settled", &self.settle.is_none())
            .finish()
    }
}

/// Invoked once per delivery, possibly from several threads at once.
pub type MessageHandler = Arc<dyn Fn(ReceivedMessage, AckHandler) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Upper bound on concurrently running handler invocations.
    pub max_concurrency: usize,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self { max_concurrency: 1 }
    }
}

/// An open subscription. Cancelling stops new deliveries; handlers already
/// running finish on their own.
pub trait SubscriptionSession: Send + Sync {
    fn cancel(&self) -> Result<()>;

    fn is_active(&self) -> bool;
}

#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(
        &self,
        handler: MessageHandler,
        options: SubscribeOptions,
    ) -> Result<Box<dyn SubscriptionSession>>;
}
