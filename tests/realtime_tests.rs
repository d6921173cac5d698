use async_trait::async_trait;
use futures::future::join_all;
use kv_realtime::metrics::{
    REALTIME_APPLICATION_FAILURE, REALTIME_DECODE_FAILURE, REALTIME_TOTAL_ROWS_UPDATED,
    RECEIVED_LOW_LATENCY_NOTIFICATIONS, RECEIVED_LOW_LATENCY_NOTIFICATIONS_E2E,
    RECEIVED_LOW_LATENCY_NOTIFICATIONS_E2E_TRANSPORT,
};
use kv_realtime::transport::{MessageHandler, SubscribeOptions, Subscriber, SubscriptionSession};
use kv_realtime::{
    ApplyCallback, BackoffPolicy, Cache, CancellableWait, DataLoadingStats, InMemoryMetricsRecorder,
    KeyValueCache, KvError, LocalTopic, MutationRecord, NotifierMetadata, RealtimeConfig,
    RealtimeNotifier, RealtimeNotifierOptions, Result, RetryPolicy, SleepFor, WaitOutcome,
    cache_apply_callback, create_realtime_notifier,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {}", what);
}

fn notifier_for(
    topic: &LocalTopic,
    metrics: Arc<InMemoryMetricsRecorder>,
    config: RealtimeConfig,
) -> Box<dyn RealtimeNotifier> {
    create_realtime_notifier(
        metrics,
        &NotifierMetadata::local(topic.name()).with_num_threads(2),
        config,
        RealtimeNotifierOptions::new().subscriber(Arc::new(topic.clone())),
    )
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn realtime_updates_reach_the_cache() {
    let topic = LocalTopic::new("e2e");
    let metrics = Arc::new(InMemoryMetricsRecorder::new().unwrap());
    let cache = Arc::new(KeyValueCache::new());
    let notifier = notifier_for(&topic, metrics.clone(), RealtimeConfig::default());

    notifier.start(cache_apply_callback(cache.clone())).unwrap();
    assert!(notifier.is_running());

    topic.publish_record(&MutationRecord::update("a", "1", 1)).unwrap();
    eventually("first update", || topic.acked() == 1).await;
    topic.publish_record(&MutationRecord::update("b", "2", 1)).unwrap();
    topic.publish_record(&MutationRecord::delete("a", 3)).unwrap();
    eventually("second batch", || topic.acked() == 3).await;
    topic.publish_record(&MutationRecord::update("a", "stale", 2)).unwrap();
    eventually("stale update", || topic.acked() == 4).await;

    assert_eq!(cache.get(b"a"), None);
    assert_eq!(cache.get(b"b"), Some(b"2".to_vec()));
    assert_eq!(metrics.status_count(REALTIME_TOTAL_ROWS_UPDATED, true), 3);
    assert_eq!(metrics.histogram_count(RECEIVED_LOW_LATENCY_NOTIFICATIONS), 4);
    assert_eq!(metrics.histogram_count(RECEIVED_LOW_LATENCY_NOTIFICATIONS_E2E), 4);
    assert_eq!(
        metrics.histogram_count(RECEIVED_LOW_LATENCY_NOTIFICATIONS_E2E_TRANSPORT),
        4
    );
    assert_eq!(topic.redelivered(), 0);

    notifier.stop().await.unwrap();
    assert!(!notifier.is_running());
}

#[tokio::test]
async fn latency_histograms_are_registered_with_e2e_buckets() {
    let metrics = Arc::new(InMemoryMetricsRecorder::new().unwrap());
    let _notifier = notifier_for(
        &LocalTopic::new("buckets"),
        metrics.clone(),
        RealtimeConfig::default(),
    );

    for name in [
        RECEIVED_LOW_LATENCY_NOTIFICATIONS_E2E,
        RECEIVED_LOW_LATENCY_NOTIFICATIONS_E2E_TRANSPORT,
    ] {
        assert!(metrics.is_registered(name));
        let histogram = metrics.histogram(name).unwrap();
        assert_eq!(histogram.boundaries.len(), 20);
        assert_eq!(histogram.boundaries[0], 160.0);
    }
    let exposition = metrics.render().unwrap();
    assert!(exposition.contains(r#"ReceivedLowLatencyNotificationsE2E_bucket{le="160"} 0"#));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_message_is_acked_and_does_not_block_the_stream() {
    let topic = LocalTopic::new("poison");
    let metrics = Arc::new(InMemoryMetricsRecorder::new().unwrap());
    let cache = Arc::new(KeyValueCache::new());
    let notifier = notifier_for(&topic, metrics.clone(), RealtimeConfig::default());
    notifier.start(cache_apply_callback(cache.clone())).unwrap();

    topic.publish("definitely not base64 !!", HashMap::new());
    topic.publish_record(&MutationRecord::update("k", "v", 1)).unwrap();
    eventually("both messages acked", || topic.acked() == 2).await;

    assert_eq!(metrics.counter(REALTIME_DECODE_FAILURE), 1);
    assert_eq!(cache.get(b"k"), Some(b"v".to_vec()));
    assert_eq!(topic.redelivered(), 0);
    notifier.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn application_failure_is_counted_not_redelivered() {
    let topic = LocalTopic::new("apply-failure");
    let metrics = Arc::new(InMemoryMetricsRecorder::new().unwrap());
    let notifier = notifier_for(&topic, metrics.clone(), RealtimeConfig::default());
    let failing: ApplyCallback = Arc::new(|_: &[u8]| Err(KvError::Application("disk full".into())));
    notifier.start(failing).unwrap();

    topic.publish_record(&MutationRecord::update("k", "v", 1)).unwrap();
    eventually("message acked", || topic.acked() == 1).await;

    assert_eq!(metrics.counter(REALTIME_APPLICATION_FAILURE), 1);
    assert_eq!(metrics.status_count(REALTIME_TOTAL_ROWS_UPDATED, true), 0);
    assert_eq!(topic.redelivered(), 0);
    // Per-message failures never surface through the lifecycle.
    notifier.stop().await.unwrap();
}

#[tokio::test]
async fn stop_is_idempotent() {
    let notifier = notifier_for(
        &LocalTopic::new("idle"),
        Arc::new(InMemoryMetricsRecorder::new().unwrap()),
        RealtimeConfig::default(),
    );
    notifier.stop().await.unwrap();
    notifier.stop().await.unwrap();
    assert!(!notifier.is_running());

    notifier.start(Arc::new(|_: &[u8]| Ok(DataLoadingStats::default()))).unwrap();
    notifier.stop().await.unwrap();
    notifier.stop().await.unwrap();
    assert!(!notifier.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_stops_all_succeed() {
    let notifier = notifier_for(
        &LocalTopic::new("concurrent-stop"),
        Arc::new(InMemoryMetricsRecorder::new().unwrap()),
        RealtimeConfig::default(),
    );
    notifier.start(Arc::new(|_: &[u8]| Ok(DataLoadingStats::default()))).unwrap();

    let results = join_all((0..4).map(|_| notifier.stop())).await;
    assert!(results.iter().all(|result| result.is_ok()));
    assert!(!notifier.is_running());
}

#[tokio::test]
async fn second_start_is_rejected() {
    let notifier = notifier_for(
        &LocalTopic::new("double-start"),
        Arc::new(InMemoryMetricsRecorder::new().unwrap()),
        RealtimeConfig::default(),
    );
    let callback: ApplyCallback = Arc::new(|_: &[u8]| Ok(DataLoadingStats::default()));
    notifier.start(callback.clone()).unwrap();
    assert!(matches!(notifier.start(callback), Err(KvError::AlreadyRunning)));
    notifier.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopped_notifier_can_restart() {
    let topic = LocalTopic::new("restart");
    let cache = Arc::new(KeyValueCache::new());
    let waits_built = Arc::new(AtomicU32::new(0));
    let counter = waits_built.clone();
    let notifier = create_realtime_notifier(
        Arc::new(InMemoryMetricsRecorder::new().unwrap()),
        &NotifierMetadata::local(topic.name()),
        RealtimeConfig::default(),
        RealtimeNotifierOptions::new()
            .subscriber(Arc::new(topic.clone()))
            .wait_factory(Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Arc::new(SleepFor::new()) as Arc<dyn CancellableWait>
            })),
    )
    .unwrap();

    notifier.start(cache_apply_callback(cache.clone())).unwrap();
    topic.publish_record(&MutationRecord::update("k", "v1", 1)).unwrap();
    eventually("first cycle", || topic.acked() == 1).await;
    notifier.stop().await.unwrap();

    topic.publish_record(&MutationRecord::update("k", "v2", 2)).unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(topic.acked(), 1, "nothing is consumed while stopped");

    notifier.start(cache_apply_callback(cache.clone())).unwrap();
    eventually("second cycle", || topic.acked() == 2).await;
    notifier.stop().await.unwrap();

    assert_eq!(cache.get(b"k"), Some(b"v2".to_vec()));
    assert_eq!(waits_built.load(Ordering::SeqCst), 2);
}

/// Fails every subscribe attempt with a transient error.
#[derive(Default)]
struct UnavailableSubscriber {
    attempts: AtomicU32,
}

#[async_trait]
impl Subscriber for UnavailableSubscriber {
    async fn subscribe(
        &self,
        _handler: MessageHandler,
        _options: SubscribeOptions,
    ) -> Result<Box<dyn SubscriptionSession>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        Err(KvError::TransientUpstream(format!(
            "subscription unavailable (attempt {})",
            attempt
        )))
    }
}

fn notifier_with_subscriber(
    subscriber: Arc<UnavailableSubscriber>,
    policy: RetryPolicy,
) -> Box<dyn RealtimeNotifier> {
    create_realtime_notifier(
        Arc::new(InMemoryMetricsRecorder::new().unwrap()),
        &NotifierMetadata::local("unused"),
        RealtimeConfig::new().subscribe_retry(policy),
        RealtimeNotifierOptions::new().subscriber(subscriber),
    )
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_interrupts_subscribe_backoff() {
    let subscriber = Arc::new(UnavailableSubscriber::default());
    let notifier = notifier_with_subscriber(
        subscriber.clone(),
        RetryPolicy::unlimited().backoff(Duration::from_secs(3600), Duration::from_secs(3600)),
    );

    notifier.start(Arc::new(|_: &[u8]| Ok(DataLoadingStats::default()))).unwrap();
    eventually("first subscribe attempt", || {
        subscriber.attempts.load(Ordering::SeqCst) == 1
    })
    .await;

    let stopped = tokio::time::timeout(Duration::from_secs(5), notifier.stop()).await;
    assert!(stopped.expect("stop must not wait out the backoff").is_ok());
    assert_eq!(subscriber.attempts.load(Ordering::SeqCst), 1);
    assert!(!notifier.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_subscribe_retries_surface_on_stop() {
    let subscriber = Arc::new(UnavailableSubscriber::default());
    let notifier = notifier_with_subscriber(
        subscriber.clone(),
        RetryPolicy::with_max_attempts(2)
            .backoff(Duration::from_millis(1), Duration::from_millis(1)),
    );

    notifier.start(Arc::new(|_: &[u8]| Ok(DataLoadingStats::default()))).unwrap();
    eventually("both subscribe attempts", || {
        subscriber.attempts.load(Ordering::SeqCst) == 2
    })
    .await;

    let err = notifier.stop().await.unwrap_err();
    assert!(matches!(err, KvError::TransientUpstream(_)));
    // The failure belongs to that cycle only.
    notifier.stop().await.unwrap();
}

/// Opens sessions whose cancellation always fails.
#[derive(Default)]
struct StickySubscriber {
    cancel_calls: Arc<AtomicU32>,
}

struct StickySession {
    cancel_calls: Arc<AtomicU32>,
}

impl SubscriptionSession for StickySession {
    fn cancel(&self) -> Result<()> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        Err(KvError::TransientUpstream("cancel rpc failed".to_string()))
    }

    fn is_active(&self) -> bool {
        true
    }
}

#[async_trait]
impl Subscriber for StickySubscriber {
    async fn subscribe(
        &self,
        _handler: MessageHandler,
        _options: SubscribeOptions,
    ) -> Result<Box<dyn SubscriptionSession>> {
        Ok(Box::new(StickySession {
            cancel_calls: self.cancel_calls.clone(),
        }))
    }
}

/// Flags the moment the worker parks on its wait, which is after the session is installed.
struct IdleFlagWait {
    inner: SleepFor,
    idling: Arc<AtomicBool>,
}

#[async_trait]
impl CancellableWait for IdleFlagWait {
    async fn wait(&self, duration: Duration) -> WaitOutcome {
        self.inner.wait(duration).await
    }

    async fn idle(&self) -> WaitOutcome {
        self.idling.store(true, Ordering::SeqCst);
        self.inner.idle().await
    }

    fn interrupt(&self) -> Result<()> {
        self.inner.interrupt()
    }

    fn is_interrupted(&self) -> bool {
        self.inner.is_interrupted()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_session_cancel_is_reported_and_stop_still_completes() {
    let subscriber = Arc::new(StickySubscriber::default());
    let idling = Arc::new(AtomicBool::new(false));
    let flag = idling.clone();
    let notifier = create_realtime_notifier(
        Arc::new(InMemoryMetricsRecorder::new().unwrap()),
        &NotifierMetadata::local("unused"),
        RealtimeConfig::default(),
        RealtimeNotifierOptions::new()
            .subscriber(subscriber.clone())
            .wait_factory(Arc::new(move || {
                flag.store(false, Ordering::SeqCst);
                Arc::new(IdleFlagWait {
                    inner: SleepFor::new(),
                    idling: flag.clone(),
                }) as Arc<dyn CancellableWait>
            })),
    )
    .unwrap();
    let callback: ApplyCallback = Arc::new(|_: &[u8]| Ok(DataLoadingStats::default()));

    notifier.start(callback.clone()).unwrap();
    eventually("session installed", || idling.load(Ordering::SeqCst)).await;

    let stopped = tokio::time::timeout(Duration::from_secs(5), notifier.stop()).await;
    let err = stopped.expect("stop must finish teardown").unwrap_err();
    assert!(matches!(err, KvError::TransientUpstream(ref msg) if msg == "cancel rpc failed"));
    assert_eq!(subscriber.cancel_calls.load(Ordering::SeqCst), 1);
    assert!(!notifier.is_running());
    notifier.stop().await.unwrap();

    notifier.start(callback).unwrap();
    assert!(notifier.is_running());
    eventually("second session installed", || idling.load(Ordering::SeqCst)).await;
    assert!(notifier.stop().await.is_err());
    assert_eq!(subscriber.cancel_calls.load(Ordering::SeqCst), 2);
    assert!(!notifier.is_running());
}

#[tokio::test]
async fn backoff_policy_follows_retry_policy() {
    let policy = RetryPolicy::default();
    let backoff = BackoffPolicy::from(&policy);
    assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(2));
    assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(8));
    assert_eq!(backoff.delay_for_attempt(40), Duration::from_secs(30 * 60));
}
