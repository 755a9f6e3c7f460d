//! Sharded map from transfer identifier to live session.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock};

use filexfer_protocol::TransferId;

type Shard<V> = RwLock<HashMap<TransferId, Arc<V>>>;

/// Concurrent registry of sessions keyed by [`TransferId`].
///
/// Each identifier hashes to one shard, so operations on unrelated
/// transfers never contend on the same lock.
pub struct SessionRegistry<V> {
    shards: Box<[Shard<V>]>,
}

impl<V> SessionRegistry<V> {
    pub fn new(shards: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self { shards }
    }

    fn shard(&self, id: &TransferId) -> &Shard<V> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        &self.shards[(hasher.finish() % self.shards.len() as u64) as usize]
    }

    /// Inserts the value built by `make` unless `id` is present.
    ///
    /// Returns the entry now in the registry and whether it was created.
    pub fn insert_if_absent(&self, id: TransferId, make: impl FnOnce() -> V) -> (Arc<V>, bool) {
        self.insert_or_replace_if(id, |_| false, make)
    }

    /// Inserts the value built by `make` if `id` is absent or the existing
    /// entry satisfies `replace`.
    pub fn insert_or_replace_if(
        &self,
        id: TransferId,
        replace: impl FnOnce(&V) -> bool,
        make: impl FnOnce() -> V,
    ) -> (Arc<V>, bool) {
        let mut map = self
            .shard(&id)
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = map.get(&id) {
            if !replace(existing) {
                return (Arc::clone(existing), false);
            }
        }
        let value = Arc::new(make());
        map.insert(id, Arc::clone(&value));
        (value, true)
    }

    pub fn lookup(&self, id: &TransferId) -> Option<Arc<V>> {
        self.shard(id)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn remove(&self, id: &TransferId) -> Option<Arc<V>> {
        self.shard(id)
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    /// Keeps only the entries for which `keep` returns `true`.
    pub fn retain(&self, mut keep: impl FnMut(&TransferId, &V) -> bool) -> usize {
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut map = shard.write().unwrap_or_else(PoisonError::into_inner);
            let before = map.len();
            map.retain(|id, v| keep(id, v));
            removed += before - map.len();
        }
        removed
    }

    /// Counts entries matching `pred`.
    pub fn count(&self, mut pred: impl FnMut(&V) -> bool) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .values()
                    .filter(|v| pred(v))
                    .count()
            })
            .sum()
    }

    pub fn len(&self) -> usize {
        self.count(|_| true)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every entry.
    pub fn values(&self) -> Vec<Arc<V>> {
        self.shards
            .iter()
            .flat_map(|shard| {
                shard
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .values()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}
