use super::{Cache, CacheStats};
use crate::core::LogicalTime;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Stored state of one key. A tombstone keeps the delete time so an older
/// update cannot bring the key back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub value: Vec<u8>,
    pub logical_commit_time: LogicalTime,
    pub tombstone: bool,
}

impl CacheEntry {
    fn live(value: Vec<u8>, logical_commit_time: LogicalTime) -> Self {
        Self {
            value,
            logical_commit_time,
            tombstone: false,
        }
    }

    fn tombstone(logical_commit_time: LogicalTime) -> Self {
        Self {
            value: Vec::new(),
            logical_commit_time,
            tombstone: true,
        }
    }
}

/// Concurrent key-value cache ordered by logical commit time.
///
/// Lock order is always: key map, then entry, then tombstone index.
/// Mutating an existing key holds the map lock shared and only its own entry
/// exclusively, so writers to unrelated keys never block each other. The map
/// lock is taken exclusively only to insert a new key or to compact.
#[derive(Default)]
pub struct KeyValueCache {
    entries: RwLock<HashMap<Vec<u8>, RwLock<CacheEntry>>>,
    /// Delete times to keys, so compaction only visits expired tombstones.
    deleted_index: Mutex<BTreeMap<LogicalTime, Vec<Vec<u8>>>>,
}

impl KeyValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    // All operations are total, so a panicked holder must not take the cache
    // down with it: entries are only ever replaced whole.
    fn read_entries(&self) -> RwLockReadGuard<'_, HashMap<Vec<u8>, RwLock<CacheEntry>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_entries(&self) -> RwLockWriteGuard<'_, HashMap<Vec<u8>, RwLock<CacheEntry>>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn deleted_index(&self) -> MutexGuard<'_, BTreeMap<LogicalTime, Vec<Vec<u8>>>> {
        self.deleted_index
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the entry if `incoming` is strictly newer.
    fn apply_to_slot(&self, key: &[u8], slot: &RwLock<CacheEntry>, incoming: CacheEntry) -> bool {
        let mut current = slot.write().unwrap_or_else(PoisonError::into_inner);
        if incoming.logical_commit_time <= current.logical_commit_time {
            return false;
        }
        let tombstone_time = incoming.tombstone.then_some(incoming.logical_commit_time);
        *current = incoming;
        if let Some(time) = tombstone_time {
            self.deleted_index().entry(time).or_default().push(key.to_vec());
        }
        true
    }

    fn apply(&self, key: &[u8], incoming: CacheEntry) -> bool {
        {
            let entries = self.read_entries();
            if let Some(slot) = entries.get(key) {
                return self.apply_to_slot(key, slot, incoming);
            }
        }

        let mut entries = self.write_entries();
        match entries.entry(key.to_vec()) {
            Entry::Occupied(occupied) => self.apply_to_slot(key, occupied.get(), incoming),
            Entry::Vacant(vacant) => {
                if incoming.tombstone {
                    self.deleted_index()
                        .entry(incoming.logical_commit_time)
                        .or_default()
                        .push(key.to_vec());
                }
                vacant.insert(RwLock::new(incoming));
                true
            }
        }
    }

    /// Returns the stored entry, tombstones included.
    pub fn entry(&self, key: &[u8]) -> Option<CacheEntry> {
        self.read_entries()
            .get(key)
            .map(|slot| slot.read().unwrap_or_else(PoisonError::into_inner).clone())
    }
}

impl Cache for KeyValueCache {
    fn get_key_value_pairs(&self, keys: &[&[u8]]) -> HashMap<Vec<u8>, Vec<u8>> {
        let entries = self.read_entries();
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            let Some(slot) = entries.get(*key) else {
                continue;
            };
            let entry = slot.read().unwrap_or_else(PoisonError::into_inner);
            if !entry.tombstone {
                found.insert(key.to_vec(), entry.value.clone());
            }
        }
        found
    }

    fn update_key_value(&self, key: &[u8], value: &[u8], logical_commit_time: LogicalTime) -> bool {
        self.apply(key, CacheEntry::live(value.to_vec(), logical_commit_time))
    }

    fn delete_key(&self, key: &[u8], logical_commit_time: LogicalTime) -> bool {
        self.apply(key, CacheEntry::tombstone(logical_commit_time))
    }

    fn remove_deleted_keys(&self, cutoff: LogicalTime) -> usize {
        let mut entries = self.write_entries();
        let mut index = self.deleted_index();

        let retained = match cutoff.checked_add(1) {
            Some(first_retained) => index.split_off(&first_retained),
            None => BTreeMap::new(),
        };
        let expired = std::mem::replace(&mut *index, retained);

        let mut removed = 0;
        for key in expired.into_values().flatten() {
            let expired_tombstone = entries.get(&key).is_some_and(|slot| {
                let entry = slot.read().unwrap_or_else(PoisonError::into_inner);
                entry.tombstone && entry.logical_commit_time <= cutoff
            });
            if expired_tombstone {
                entries.remove(&key);
                removed += 1;
            }
        }
        removed
    }

    fn stats(&self) -> CacheStats {
        let entries = self.read_entries();
        let tombstones = entries
            .values()
            .filter(|slot| slot.read().unwrap_or_else(PoisonError::into_inner).tombstone)
            .count();
        CacheStats {
            live_entries: entries.len() - tombstones,
            tombstones,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(cache: &KeyValueCache, key: &str) -> Option<Vec<u8>> {
        cache.get(key.as_bytes())
    }

    #[test]
    fn test_absent_keys_are_omitted() {
        let cache = KeyValueCache::new();
        cache.update_key_value(b"a", b"1", 1);

        let pairs = cache.get_key_value_pairs(&[b"a".as_slice(), b"missing".as_slice()]);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs.get(b"a".as_slice()), Some(&b"1".to_vec()));
    }

    #[test]
    fn test_newer_update_wins_older_is_ignored() {
        let cache = KeyValueCache::new();
        assert!(cache.update_key_value(b"k", b"v1", 5));
        assert!(!cache.update_key_value(b"k", b"v2", 3));
        assert_eq!(get(&cache, "k"), Some(b"v1".to_vec()));

        assert!(cache.update_key_value(b"k", b"v3", 6));
        assert_eq!(get(&cache, "k"), Some(b"v3".to_vec()));
    }

    #[test]
    fn test_equal_time_is_a_duplicate() {
        let cache = KeyValueCache::new();
        assert!(cache.update_key_value(b"k", b"first", 5));
        assert!(!cache.update_key_value(b"k", b"second", 5));
        assert_eq!(get(&cache, "k"), Some(b"first".to_vec()));
    }

    #[test]
    fn test_tombstone_blocks_stale_update() {
        let cache = KeyValueCache::new();
        cache.update_key_value(b"k", b"v", 1);
        assert!(cache.delete_key(b"k", 10));
        assert!(!cache.update_key_value(b"k", b"stale", 8));
        assert_eq!(get(&cache, "k"), None);

        let entry = cache.entry(b"k").unwrap();
        assert!(entry.tombstone);
        assert_eq!(entry.logical_commit_time, 10);
    }

    #[test]
    fn test_delete_of_unknown_key_records_tombstone() {
        let cache = KeyValueCache::new();
        assert!(cache.delete_key(b"ghost", 4));
        assert!(!cache.update_key_value(b"ghost", b"late", 2));
        assert_eq!(cache.stats(), CacheStats { live_entries: 0, tombstones: 1 });
    }

    #[test]
    fn test_newer_update_after_delete() {
        let cache = KeyValueCache::new();
        cache.delete_key(b"k", 10);
        assert!(cache.update_key_value(b"k", b"back", 12));
        assert_eq!(get(&cache, "k"), Some(b"back".to_vec()));
    }

    #[test]
    fn test_compaction_boundary() {
        let cache = KeyValueCache::new();
        cache.delete_key(b"k", 5);

        assert_eq!(cache.remove_deleted_keys(4), 0);
        assert!(cache.entry(b"k").is_some());

        assert_eq!(cache.remove_deleted_keys(5), 1);
        assert!(cache.entry(b"k").is_none());
    }

    #[test]
    fn test_compaction_never_removes_live_entries() {
        let cache = KeyValueCache::new();
        cache.update_key_value(b"live", b"v", 1);
        cache.delete_key(b"revived", 2);
        cache.update_key_value(b"revived", b"again", 3);
        cache.delete_key(b"dead", 2);

        assert_eq!(cache.remove_deleted_keys(i64::MAX), 1);
        assert_eq!(get(&cache, "live"), Some(b"v".to_vec()));
        assert_eq!(get(&cache, "revived"), Some(b"again".to_vec()));
        assert_eq!(cache.stats(), CacheStats { live_entries: 2, tombstones: 0 });
    }

    #[test]
    fn test_redelete_keeps_newest_tombstone_until_its_cutoff() {
        let cache = KeyValueCache::new();
        cache.delete_key(b"k", 5);
        cache.delete_key(b"k", 7);

        assert_eq!(cache.remove_deleted_keys(5), 0);
        assert_eq!(cache.entry(b"k").unwrap().logical_commit_time, 7);
        assert_eq!(cache.remove_deleted_keys(7), 1);
    }
}
