use serde::{Deserialize, Serialize};
use std::fmt;

/// Upstream-assigned ordering value for a mutation. Never wall-clock time.
pub type LogicalTime = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationKind {
    Update,
    Delete,
}

impl MutationKind {
    /// Wire discriminant: `UPDATE = 0`, `DELETE = 1`.
    pub fn wire_value(self) -> u8 {
        match self {
            Self::Update => 0,
            Self::Delete => 1,
        }
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Update),
            1 => Some(Self::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Update => write!(f, "UPDATE"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

/// A single decoded mutation. `value` is `None` for deletes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub kind: MutationKind,
    pub logical_commit_time: LogicalTime,
}

impl MutationRecord {
    pub fn update(
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        logical_commit_time: LogicalTime,
    ) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            kind: MutationKind::Update,
            logical_commit_time,
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>, logical_commit_time: LogicalTime) -> Self {
        Self {
            key: key.into(),
            value: None,
            kind: MutationKind::Delete,
            logical_commit_time,
        }
    }
}

/// Row counts reported by an apply callback for one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataLoadingStats {
    pub total_updated_records: u64,
    pub total_deleted_records: u64,
    /// Stale or duplicate mutations that the cache ignored.
    pub total_dropped_records: u64,
}

impl DataLoadingStats {
    pub fn rows_touched(&self) -> u64 {
        self.total_updated_records
            .saturating_add(self.total_deleted_records)
    }
}

impl std::ops::AddAssign for DataLoadingStats {
    fn add_assign(&mut self, other: Self) {
        self.total_updated_records += other.total_updated_records;
        self.total_deleted_records += other.total_deleted_records;
        self.total_dropped_records += other.total_dropped_records;
    }
}
