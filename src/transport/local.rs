use super::{
    AckHandler, AckOutcome, MessageHandler, ReceivedMessage, SubscribeOptions, Subscriber,
    SubscriptionSession, TIME_SENT_ATTRIBUTE,
};
use crate::codec::MutationCodec;
use crate::core::{MutationRecord, Result};
use async_trait::async_trait;
use chrono::Utc;
use lazy_static::lazy_static;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Notify, Semaphore, watch};
use tracing::{Level, event};
use uuid::Uuid;

#[derive(Default)]
struct TopicState {
    queue: Mutex<VecDeque<ReceivedMessage>>,
    available: Notify,
    published: AtomicU64,
    acked: AtomicU64,
    redelivered: AtomicU64,
    in_flight: AtomicU64,
}

impl TopicState {
    fn enqueue(&self, message: ReceivedMessage) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(message);
        self.available.notify_one();
    }

    fn try_take(&self) -> Option<ReceivedMessage> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let message = queue.pop_front()?;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(message)
    }

    async fn take(&self) -> ReceivedMessage {
        loop {
            if let Some(message) = self.try_take() {
                return message;
            }
            self.available.notified().await;
        }
    }

    fn ack_handler(self: &Arc<Self>, message: ReceivedMessage) -> AckHandler {
        let state = Arc::clone(self);
        // A settled delivery leaves `in_flight` before it is counted as acked,
        // and a nacked one is queued again before it leaves.
        AckHandler::new(move |outcome| match outcome {
            AckOutcome::Ack => {
                state.in_flight.fetch_sub(1, Ordering::SeqCst);
                state.acked.fetch_add(1, Ordering::SeqCst);
            }
            AckOutcome::Nack => {
                state.redelivered.fetch_add(1, Ordering::SeqCst);
                let mut message = message;
                message.delivery_attempt = message.delivery_attempt.saturating_add(1);
                state.enqueue(message);
                state.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        })
    }
}

/// In-process topic with at-least-once delivery.
///
/// Messages published before anyone subscribes are buffered. Clones share the
/// same queue and counters.
#[derive(Clone)]
pub struct LocalTopic {
    name: Arc<str>,
    state: Arc<TopicState>,
}

impl LocalTopic {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            state: Arc::new(TopicState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publishes raw bytes; returns the generated message id.
    pub fn publish(&self, data: impl Into<Vec<u8>>, attributes: HashMap<String, String>) -> String {
        let message_id = Uuid::new_v4().to_string();
        self.state.enqueue(ReceivedMessage {
            message_id: message_id.clone(),
            data: data.into(),
            attributes,
            publish_time: Utc::now(),
            delivery_attempt: 1,
        });
        self.state.published.fetch_add(1, Ordering::SeqCst);
        message_id
    }

    /// Encodes `record` and publishes it stamped with the current `time_sent`.
    pub fn publish_record(&self, record: &MutationRecord) -> Result<String> {
        let payload = MutationCodec::encode(record)?;
        let sent_nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let attributes = HashMap::from([(TIME_SENT_ATTRIBUTE.to_string(), sent_nanos.to_string())]);
        Ok(self.publish(payload, attributes))
    }

    pub fn published(&self) -> u64 {
        self.state.published.load(Ordering::SeqCst)
    }

    pub fn acked(&self) -> u64 {
        self.state.acked.load(Ordering::SeqCst)
    }

    /// Deliveries that were nacked or dropped and queued again.
    pub fn redelivered(&self) -> u64 {
        self.state.redelivered.load(Ordering::SeqCst)
    }

    /// Messages waiting for delivery.
    pub fn pending(&self) -> usize {
        self.state
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// `true` once nothing is queued and no delivery awaits settlement.
    pub fn is_idle(&self) -> bool {
        self.pending() == 0 && self.state.in_flight.load(Ordering::SeqCst) == 0
    }
}

#[async_trait]
impl Subscriber for LocalTopic {
    async fn subscribe(
        &self,
        handler: MessageHandler,
        options: SubscribeOptions,
    ) -> Result<Box<dyn SubscriptionSession>> {
        let (cancel, cancelled) = watch::channel(false);
        let active = Arc::new(AtomicBool::new(true));
        let permits = Arc::new(Semaphore::new(options.max_concurrency.max(1)));

        tokio::spawn(dispatch(
            self.state.clone(),
            handler,
            permits,
            cancelled,
            active.clone(),
        ));

        event!(
            Level::DEBUG,
            topic = %self.name,
            max_concurrency = options.max_concurrency,
            "local subscription opened"
        );
        Ok(Box::new(LocalSession { cancel, active }))
    }
}

async fn dispatch(
    state: Arc<TopicState>,
    handler: MessageHandler,
    permits: Arc<Semaphore>,
    mut cancelled: watch::Receiver<bool>,
    active: Arc<AtomicBool>,
) {
    loop {
        let permit = tokio::select! {
            biased;
            _ = until_cancelled(&mut cancelled) => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let message = tokio::select! {
            biased;
            _ = until_cancelled(&mut cancelled) => break,
            message = state.take() => message,
        };

        let ack = state.ack_handler(message.clone());
        let handler = handler.clone();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            handler(message, ack);
        });
    }
    active.store(false, Ordering::SeqCst);
}

/// Resolves once the session is cancelled or dropped.
async fn until_cancelled(cancelled: &mut watch::Receiver<bool>) {
    while !*cancelled.borrow_and_update() {
        if cancelled.changed().await.is_err() {
            return;
        }
    }
}

struct LocalSession {
    cancel: watch::Sender<bool>,
    active: Arc<AtomicBool>,
}

impl SubscriptionSession for LocalSession {
    fn cancel(&self) -> Result<()> {
        self.cancel.send_replace(true);
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && !*self.cancel.borrow()
    }
}

lazy_static! {
    static ref LOCAL_TOPICS: Mutex<HashMap<String, LocalTopic>> = Mutex::new(HashMap::new());
}

/// Process-wide registry of named local topics.
pub struct LocalBroker;

impl LocalBroker {
    /// Returns the topic called `name`, creating it on first use.
    pub fn topic(name: &str) -> LocalTopic {
        LOCAL_TOPICS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_insert_with(|| LocalTopic::new(name))
            .clone()
    }

    pub fn remove(name: &str) -> Option<LocalTopic> {
        LOCAL_TOPICS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }
}
