use super::ParameterClient;
use crate::config::NotifierMetadata;
use crate::core::{KvError, Result};
use crate::metrics::MetricsRecorder;
use crate::retry::{BackoffPolicy, RetryEngine, unstoppable};
use std::sync::Arc;

/// Resolves `kv-server-<environment>-<name>` parameters, retrying each lookup
/// until it succeeds or fails for a reason retrying cannot fix.
pub struct ParameterFetcher {
    environment: String,
    client: Arc<dyn ParameterClient>,
    metrics: Option<Arc<dyn MetricsRecorder>>,
    backoff: BackoffPolicy,
}

impl ParameterFetcher {
    pub fn new(
        environment: impl Into<String>,
        client: Arc<dyn ParameterClient>,
        metrics: Option<Arc<dyn MetricsRecorder>>,
    ) -> Self {
        Self {
            environment: environment.into(),
            client,
            metrics,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    fn parameter_name(&self, name: &str) -> String {
        format!("kv-server-{}-{}", self.environment, name)
    }

    fn engine(&self, task_name: &str) -> RetryEngine {
        let engine = RetryEngine::new(task_name, unstoppable()).backoff(self.backoff);
        match &self.metrics {
            Some(metrics) => engine.metrics(metrics.clone()),
            None => engine,
        }
    }

    pub async fn get_parameter(&self, name: &str) -> Result<String> {
        let parameter_name = self.parameter_name(name);
        let parameter_name = parameter_name.as_str();
        let value = self
            .engine("GetParameter")
            .run_traced(|| self.client.get_parameter(parameter_name))
            .await?;
        log::info!("Retrieved {} parameter: {}", parameter_name, value);
        Ok(value)
    }

    pub async fn get_int32_parameter(&self, name: &str) -> Result<i32> {
        let parameter_name = self.parameter_name(name);
        let parameter_name = parameter_name.as_str();
        let value = self
            .engine("GetInt32Parameter")
            .run_traced(|| self.client.get_int32_parameter(parameter_name))
            .await?;
        log::info!("Retrieved {} parameter: {}", parameter_name, value);
        Ok(value)
    }

    pub async fn get_bool_parameter(&self, name: &str) -> Result<bool> {
        let parameter_name = self.parameter_name(name);
        let parameter_name = parameter_name.as_str();
        let value = self
            .engine("GetBoolParameter")
            .run_traced(|| self.client.get_bool_parameter(parameter_name))
            .await?;
        log::info!("Retrieved {} parameter: {}", parameter_name, value);
        Ok(value)
    }

    /// Metadata of the realtime stream this shard consumes. With more than one
    /// shard every shard reads its own `<topic>-shard-<n>` topic.
    pub async fn get_realtime_notifier_metadata(
        &self,
        num_shards: i32,
        shard_num: i32,
    ) -> Result<NotifierMetadata> {
        if num_shards < 1 || !(0..num_shards).contains(&shard_num) {
            return Err(KvError::Configuration(format!(
                "shard {} is outside of {} shards",
                shard_num, num_shards
            )));
        }

        let topic = self.get_parameter("realtime-topic").await?;
        let num_threads = self
            .get_int32_parameter("realtime-updater-num-threads")
            .await?;

        let topic = if num_shards > 1 {
            format!("{}-shard-{}", topic, shard_num)
        } else {
            topic
        };
        Ok(NotifierMetadata::Local {
            topic,
            num_threads: usize::try_from(num_threads).unwrap_or(1).max(1),
        })
    }
}
