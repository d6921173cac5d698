use crate::config::LocalParameters;
use crate::core::{KvError, Result};
use async_trait::async_trait;
use std::collections::HashMap;

/// Named configuration values stored by the cloud provider.
#[async_trait]
pub trait ParameterClient: Send + Sync {
    async fn get_parameter(&self, parameter_name: &str) -> Result<String>;

    async fn get_int32_parameter(&self, parameter_name: &str) -> Result<i32>;

    async fn get_bool_parameter(&self, parameter_name: &str) -> Result<bool>;
}

const LOCAL_PREFIX: &str = "kv-server-local-";

/// Parameter client for the `local` environment, backed by [`LocalParameters`].
pub struct LocalParameterClient {
    strings: HashMap<String, String>,
    int32s: HashMap<String, i32>,
    bools: HashMap<String, bool>,
}

impl LocalParameterClient {
    pub fn new(parameters: LocalParameters) -> Self {
        let key = |name: &str| format!("{}{}", LOCAL_PREFIX, name);

        let strings = HashMap::from([
            (key("realtime-topic"), parameters.realtime_topic),
            (key("launch-hook"), parameters.launch_hook),
        ]);
        let int32s = HashMap::from([
            (
                key("realtime-updater-num-threads"),
                parameters.realtime_updater_num_threads,
            ),
            (key("num-shards"), parameters.num_shards),
            (
                key("data-loading-num-threads"),
                parameters.data_loading_num_threads,
            ),
            (
                key("metrics-export-interval-millis"),
                parameters.metrics_export_interval_ms,
            ),
            (
                key("metrics-export-timeout-millis"),
                parameters.metrics_export_timeout_ms,
            ),
        ]);
        let bools = HashMap::from([(
            key("use-external-metrics-collector-endpoint"),
            parameters.use_external_metrics_collector_endpoint,
        )]);

        Self {
            strings,
            int32s,
            bools,
        }
    }
}

impl Default for LocalParameterClient {
    fn default() -> Self {
        Self::new(LocalParameters::default())
    }
}

fn lookup<T: Clone>(values: &HashMap<String, T>, kind: &str, parameter_name: &str) -> Result<T> {
    values.get(parameter_name).cloned().ok_or_else(|| {
        KvError::Configuration(format!(
            "Unknown local {} parameter: {}",
            kind, parameter_name
        ))
    })
}

#[async_trait]
impl ParameterClient for LocalParameterClient {
    async fn get_parameter(&self, parameter_name: &str) -> Result<String> {
        lookup(&self.strings, "string", parameter_name)
    }

    async fn get_int32_parameter(&self, parameter_name: &str) -> Result<i32> {
        lookup(&self.int32s, "int32", parameter_name)
    }

    async fn get_bool_parameter(&self, parameter_name: &str) -> Result<bool> {
        lookup(&self.bools, "bool", parameter_name)
    }
}
