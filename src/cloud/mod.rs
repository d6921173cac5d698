//! Cloud collaborators consumed during server setup: instance identity and the
//! parameter store. Only local implementations are linked.

pub mod fetcher;
pub mod instance;
pub mod parameter;

pub use fetcher::ParameterFetcher;
pub use instance::{
    ENVIRONMENT_LABEL, InstanceClient, InstanceIdentity, LifecycleEvent, LocalInstanceClient,
    SHARD_NUM_LABEL,
};
pub use parameter::{LocalParameterClient, ParameterClient};
