use crate::core::{KvError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::{Level, event};

pub const ENVIRONMENT_LABEL: &str = "environment";
pub const SHARD_NUM_LABEL: &str = "shard-num";

/// Identity and lifecycle hooks of the instance the server runs on.
#[async_trait]
pub trait InstanceClient: Send + Sync {
    async fn environment_tag(&self) -> Result<String>;

    async fn shard_num_tag(&self) -> Result<String>;

    async fn instance_id(&self) -> Result<String>;

    async fn record_lifecycle_heartbeat(&self, lifecycle_hook_name: &str) -> Result<()>;

    async fn complete_lifecycle(&self, lifecycle_hook_name: &str) -> Result<()>;
}

/// Labels and id of the current instance, as a provider would report them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceIdentity {
    pub instance_id: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl InstanceIdentity {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            labels: HashMap::new(),
        }
    }

    pub fn label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Heartbeat,
    Complete,
}

/// Serves a fixed [`InstanceIdentity`]; lifecycle calls are only recorded.
pub struct LocalInstanceClient {
    identity: InstanceIdentity,
    lifecycle: Mutex<Vec<(LifecycleEvent, String)>>,
}

impl LocalInstanceClient {
    pub fn new(identity: InstanceIdentity) -> Self {
        Self {
            identity,
            lifecycle: Mutex::new(Vec::new()),
        }
    }

    /// Lifecycle calls received so far, oldest first.
    pub fn lifecycle_events(&self) -> Vec<(LifecycleEvent, String)> {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn required_label(&self, name: &str) -> Result<String> {
        match self.identity.labels.get(name) {
            Some(value) if !value.is_empty() => Ok(value.clone()),
            _ => Err(KvError::Configuration(format!(
                "instance label '{}' not found",
                name
            ))),
        }
    }

    fn record(&self, lifecycle_event: LifecycleEvent, hook: &str) {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((lifecycle_event, hook.to_string()));
    }
}

#[async_trait]
impl InstanceClient for LocalInstanceClient {
    async fn environment_tag(&self) -> Result<String> {
        self.required_label(ENVIRONMENT_LABEL)
    }

    async fn shard_num_tag(&self) -> Result<String> {
        self.required_label(SHARD_NUM_LABEL)
    }

    async fn instance_id(&self) -> Result<String> {
        if self.identity.instance_id.is_empty() {
            return Err(KvError::Configuration("instance id not found".to_string()));
        }
        Ok(self.identity.instance_id.clone())
    }

    async fn record_lifecycle_heartbeat(&self, lifecycle_hook_name: &str) -> Result<()> {
        event!(Level::INFO, hook = %lifecycle_hook_name, "record lifecycle heartbeat");
        self.record(LifecycleEvent::Heartbeat, lifecycle_hook_name);
        Ok(())
    }

    async fn complete_lifecycle(&self, lifecycle_hook_name: &str) -> Result<()> {
        event!(Level::INFO, hook = %lifecycle_hook_name, "complete lifecycle");
        self.record(LifecycleEvent::Complete, lifecycle_hook_name);
        Ok(())
    }
}
