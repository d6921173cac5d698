//! Versioned key-value cache served to read traffic.
//!
//! Every key remembers the largest logical commit time it has seen. Mutations
//! at or below that time are ignored, which makes application idempotent and
//! independent of delivery order. Deletes leave a tombstone behind until
//! [`Cache::remove_deleted_keys`] drops it.
//!
//! Compaction is only safe for a cutoff no newer than the oldest mutation still
//! in flight; callers choose the cutoff and own that guarantee.

pub mod key_value;

pub use key_value::{CacheEntry, KeyValueCache};

use crate::codec::MutationCodec;
use crate::core::{DataLoadingStats, KvError, LogicalTime, MutationKind, Result};
use crate::realtime::ApplyCallback;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub live_entries: usize,
    pub tombstones: usize,
}

pub trait Cache: Send + Sync {
    /// Returns the live values for `keys`. Absent and deleted keys are omitted.
    fn get_key_value_pairs(&self, keys: &[&[u8]]) -> HashMap<Vec<u8>, Vec<u8>>;

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.get_key_value_pairs(&[key]).into_values().next()
    }

    /// Stores `value` if `logical_commit_time` is newer than anything seen for
    /// `key`. Returns whether the mutation was applied.
    fn update_key_value(
        &self,
        key: &[u8],
        value: &[u8],
        logical_commit_time: LogicalTime,
    ) -> bool;

    /// Writes a tombstone under the same ordering rule as updates.
    fn delete_key(&self, key: &[u8], logical_commit_time: LogicalTime) -> bool;

    /// Physically drops tombstones at or below `cutoff`; returns how many.
    fn remove_deleted_keys(&self, cutoff: LogicalTime) -> usize;

    fn stats(&self) -> CacheStats;
}

/// Builds the apply callback that feeds verified realtime records into `cache`.
pub fn cache_apply_callback(cache: Arc<dyn Cache>) -> ApplyCallback {
    Arc::new(move |binary: &[u8]| -> Result<DataLoadingStats> {
        let record = MutationCodec::decode_binary(binary)
            .map_err(|err| KvError::Application(format!("undecodable record: {}", err)))?;

        let mut stats = DataLoadingStats::default();
        let applied = match record.kind {
            MutationKind::Update => {
                let value = record.value.as_deref().unwrap_or_default();
                let applied =
                    cache.update_key_value(&record.key, value, record.logical_commit_time);
                if applied {
                    stats.total_updated_records += 1;
                }
                applied
            }
            MutationKind::Delete => {
                let applied = cache.delete_key(&record.key, record.logical_commit_time);
                if applied {
                    stats.total_deleted_records += 1;
                }
                applied
            }
        };
        if !applied {
            stats.total_dropped_records += 1;
        }
        Ok(stats)
    })
}
