use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry behavior for calls to external dependencies.
///
/// `max_attempts <= 0` retries until the call succeeds or the wait is interrupted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, `<= 0` for unlimited.
    pub max_attempts: i32,
    /// Backoff after the first failed attempt, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Upper bound for any single backoff, in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_backoff_ms: 2_000,
            max_backoff_ms: 30 * 60_000,
        }
    }
}

impl RetryPolicy {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(max_attempts: i32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Set both backoff bounds at once
    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff_ms = initial.as_millis().min(u64::MAX as u128) as u64;
        self.max_backoff_ms = max.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_attempts <= 0
    }
}

/// Settings for the realtime ingestion worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Retry policy applied while opening the subscription session.
    #[serde(default)]
    pub subscribe_retry: RetryPolicy,
}

impl RealtimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the subscribe retry policy
    pub fn subscribe_retry(mut self, policy: RetryPolicy) -> Self {
        self.subscribe_retry = policy;
        self
    }
}

/// Cloud provider a notifier is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provider {
    Local,
    Gcp,
    Aws,
}

/// Provider-specific description of the realtime mutation stream.
///
/// The ingestion core only reads the provider-neutral accessors; the variant
/// fields are consumed by whichever transport is linked for that provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum NotifierMetadata {
    /// In-process topic registered with the local broker.
    Local { topic: String, num_threads: usize },
    Gcp {
        project_id: String,
        topic_id: String,
        num_threads: usize,
    },
    Aws {
        queue_url: String,
        sns_arn: String,
        num_threads: usize,
    },
}

impl NotifierMetadata {
    pub fn local(topic: impl Into<String>) -> Self {
        Self::Local {
            topic: topic.into(),
            num_threads: 1,
        }
    }

    pub fn provider(&self) -> Provider {
        match self {
            Self::Local { .. } => Provider::Local,
            Self::Gcp { .. } => Provider::Gcp,
            Self::Aws { .. } => Provider::Aws,
        }
    }

    /// Concurrency hint for message delivery, never below one.
    pub fn num_threads(&self) -> usize {
        let threads = match self {
            Self::Local { num_threads, .. }
            | Self::Gcp { num_threads, .. }
            | Self::Aws { num_threads, .. } => *num_threads,
        };
        threads.max(1)
    }

    pub fn with_num_threads(mut self, threads: usize) -> Self {
        match &mut self {
            Self::Local { num_threads, .. }
            | Self::Gcp { num_threads, .. }
            | Self::Aws { num_threads, .. } => *num_threads = threads,
        }
        self
    }
}

/// Parameter values served by the local parameter client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalParameters {
    #[serde(default = "default_realtime_topic")]
    pub realtime_topic: String,
    #[serde(default = "default_one")]
    pub realtime_updater_num_threads: i32,
    #[serde(default = "default_one")]
    pub num_shards: i32,
    #[serde(default = "default_data_loading_threads")]
    pub data_loading_num_threads: i32,
    #[serde(default)]
    pub launch_hook: String,
    #[serde(default = "default_export_interval_ms")]
    pub metrics_export_interval_ms: i32,
    #[serde(default = "default_export_timeout_ms")]
    pub metrics_export_timeout_ms: i32,
    #[serde(default)]
    pub use_external_metrics_collector_endpoint: bool,
}

fn default_realtime_topic() -> String {
    "realtime".to_string()
}

fn default_one() -> i32 {
    1
}

fn default_data_loading_threads() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get().min(8) as i32)
        .unwrap_or(1)
}

fn default_export_interval_ms() -> i32 {
    30_000
}

fn default_export_timeout_ms() -> i32 {
    5_000
}

impl Default for LocalParameters {
    fn default() -> Self {
        Self {
            realtime_topic: default_realtime_topic(),
            realtime_updater_num_threads: default_one(),
            num_shards: default_one(),
            data_loading_num_threads: default_data_loading_threads(),
            launch_hook: String::new(),
            metrics_export_interval_ms: default_export_interval_ms(),
            metrics_export_timeout_ms: default_export_timeout_ms(),
            use_external_metrics_collector_endpoint: false,
        }
    }
}

impl LocalParameters {
    /// Parse parameters from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> crate::core::Result<Self> {
        serde_json::from_str(json).map_err(|err| {
            crate::core::KvError::Configuration(format!("invalid local parameters: {}", err))
        })
    }
}
