pub mod error;
pub mod types;

pub use error::{KvError, Result};
pub use types::{DataLoadingStats, LogicalTime, MutationKind, MutationRecord};
