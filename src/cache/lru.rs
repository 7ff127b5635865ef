// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use std::collections::hash_map::RandomState;
use std::collections::{BTreeMap, HashMap};
use std::hash::{BuildHasher, Hash};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CacheStats {
    pub entries: usize,
    pub usage: usize,
    pub capacity: usize,
}

/// Charge-bounded LRU split into independently locked shards.
///
/// Each shard owns `ceil(capacity / shards)` of the budget. Values are handed
/// out as `Arc`s, so eviction never invalidates a reader's handle.
pub struct ShardedLruCache<K, V> {
    shards: Vec<Mutex<LruShard<K, V>>>,
    hasher: RandomState,
    capacity: usize,
}

impl<K, V> ShardedLruCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// `num_shards` is rounded up to a power of two.
    pub fn new(capacity: usize, num_shards: usize) -> Self {
        let num_shards = num_shards.max(1).next_power_of_two();
        let per_shard = capacity.div_ceil(num_shards);
        let shards = (0..num_shards)
            .map(|_| Mutex::new(LruShard::new(per_shard)))
            .collect();
        Self {
            shards,
            hasher: RandomState::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, key: &K) -> MutexGuard<'_, LruShard<K, V>> {
        let idx = (self.hasher.hash_one(key) as usize) & (self.shards.len() - 1);
        self.shards[idx].lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert, evicting least recently used entries of the same shard. Returns
    /// false when the charge can never fit.
    pub fn insert(&self, key: K, value: V, charge: usize) -> bool {
        self.insert_shared(key, Arc::new(value), charge)
    }

    pub fn insert_shared(&self, key: K, value: Arc<V>, charge: usize) -> bool {
        self.shard(&key).insert(key, value, charge)
    }

    pub fn lookup(&self, key: &K) -> Option<Arc<V>> {
        self.shard(key).lookup(key)
    }

    pub fn erase(&self, key: &K) -> bool {
        self.shard(key).erase(key)
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            capacity: self.capacity,
            ..CacheStats::default()
        };
        for shard in &self.shards {
            let shard = shard.lock().unwrap_or_else(|e| e.into_inner());
            stats.entries += shard.entries.len();
            stats.usage += shard.usage;
        }
        stats
    }
}

struct LruEntry<V> {
    value: Arc<V>,
    charge: usize,
    tick: u64,
}

struct LruShard<K, V> {
    entries: HashMap<K, LruEntry<V>>,
    // tick -> key, oldest first
    order: BTreeMap<u64, K>,
    next_tick: u64,
    usage: usize,
    capacity: usize,
}

impl<K, V> LruShard<K, V>
where
    K: Eq + Hash + Clone,
{
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_tick: 0,
            usage: 0,
            capacity,
        }
    }

    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn lookup(&mut self, key: &K) -> Option<Arc<V>> {
        let tick = self.bump();
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.tick);
        entry.tick = tick;
        self.order.insert(tick, key.clone());
        Some(Arc::clone(&entry.value))
    }

    fn insert(&mut self, key: K, value: Arc<V>, charge: usize) -> bool {
        if charge == 0 || charge > self.capacity {
            return false;
        }
        self.erase(&key);
        while self.usage + charge > self.capacity {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            if let Some(evicted) = self.entries.remove(&oldest) {
                self.usage -= evicted.charge;
            }
        }
        let tick = self.bump();
        self.order.insert(tick, key.clone());
        self.entries.insert(
            key,
            LruEntry {
                value,
                charge,
                tick,
            },
        );
        self.usage += charge;
        true
    }

    fn erase(&mut self, key: &K) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.order.remove(&entry.tick);
                self.usage -= entry.charge;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let cache = ShardedLruCache::new(3, 1);
        assert!(cache.insert("a", 1, 1));
        assert!(cache.insert("b", 2, 1));
        assert!(cache.insert("c", 3, 1));
        assert_eq!(cache.lookup(&"a").as_deref(), Some(&1));
        assert!(cache.insert("d", 4, 1));
        assert!(cache.lookup(&"b").is_none());
        assert!(cache.lookup(&"a").is_some());
        assert_eq!(cache.stats().entries, 3);
        assert_eq!(cache.stats().usage, 3);
    }

    #[test]
    fn oversized_charge_is_rejected() {
        let cache = ShardedLruCache::new(10, 2);
        assert_eq!(cache.num_shards(), 2);
        assert!(!cache.insert(1u32, "x", 6));
        assert!(!cache.insert(1u32, "x", 0));
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn reinsert_replaces_charge() {
        let cache = ShardedLruCache::new(8, 1);
        assert!(cache.insert(1u8, "small", 2));
        assert!(cache.insert(1u8, "large", 5));
        assert_eq!(cache.stats().usage, 5);
        assert_eq!(cache.lookup(&1).as_deref(), Some(&"large"));
        assert!(cache.erase(&1));
        assert_eq!(cache.stats().usage, 0);
    }

    #[test]
    fn evicted_values_stay_readable() {
        let cache = ShardedLruCache::new(1, 1);
        cache.insert("a", String::from("alpha"), 1);
        let held = cache.lookup(&"a").expect("present");
        cache.insert("b", String::from("beta"), 1);
        assert!(cache.lookup(&"a").is_none());
        assert_eq!(held.as_str(), "alpha");
    }
}
