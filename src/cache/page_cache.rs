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
use bytes::Bytes;

use crate::cache::lru::{CacheStats, ShardedLruCache};
use crate::common::status::{EnvError, Result};
use crate::runtime::mem_budget::is_power_of_two;
use crate::runtime::resource_scope::Subsystem;

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct PageCacheKey {
    pub fname: String,
    pub offset: u64,
}

impl PageCacheKey {
    pub fn new(fname: impl Into<String>, offset: u64) -> Self {
        Self {
            fname: fname.into(),
            offset,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PageType {
    Data,
    Index,
}

/// Process-wide cache of decoded storage pages, split into a data cache and an
/// index cache by `index_percentage`.
pub struct StoragePageCache {
    capacity: usize,
    index_percentage: u32,
    data_cache: Option<ShardedLruCache<PageCacheKey, Bytes>>,
    index_cache: Option<ShardedLruCache<PageCacheKey, Bytes>>,
}

impl StoragePageCache {
    pub fn new(capacity: i64, index_percentage: u32, num_shards: u32) -> Result<Self> {
        if capacity < 0 {
            return Err(EnvError::invalid_config(
                "storage_page_cache_limit",
                format!("negative capacity {capacity}"),
            ));
        }
        if index_percentage > 100 {
            return Err(EnvError::invalid_config(
                "index_page_cache_percentage",
                format!("must be within [0, 100]: {index_percentage}"),
            ));
        }
        if !is_power_of_two(i64::from(num_shards)) {
            return Err(EnvError::invalid_config(
                "storage_page_cache_shard_size",
                format!("must be a power-of-two: {num_shards}"),
            ));
        }
        let capacity = capacity as usize;
        let index_capacity = capacity / 100 * index_percentage as usize;
        let data_capacity = capacity - index_capacity;
        let build = |cap: usize| (cap > 0).then(|| ShardedLruCache::new(cap, num_shards as usize));
        Ok(Self {
            capacity,
            index_percentage,
            data_cache: build(data_capacity),
            index_cache: build(index_capacity),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn index_percentage(&self) -> u32 {
        self.index_percentage
    }

    fn cache(&self, page_type: PageType) -> Option<&ShardedLruCache<PageCacheKey, Bytes>> {
        match page_type {
            PageType::Data => self.data_cache.as_ref(),
            PageType::Index => self.index_cache.as_ref(),
        }
    }

    pub fn is_cache_available(&self, page_type: PageType) -> bool {
        self.cache(page_type).is_some()
    }

    pub fn lookup(&self, key: &PageCacheKey, page_type: PageType) -> Option<Bytes> {
        self.cache(page_type)?
            .lookup(key)
            .map(|page| Bytes::clone(&page))
    }

    pub fn insert(&self, key: PageCacheKey, page: Bytes, page_type: PageType) -> bool {
        let charge = page.len().max(1);
        match self.cache(page_type) {
            Some(cache) => cache.insert(key, page, charge),
            None => false,
        }
    }

    pub fn stats(&self, page_type: PageType) -> CacheStats {
        self.cache(page_type)
            .map(ShardedLruCache::stats)
            .unwrap_or_default()
    }
}

impl Subsystem for StoragePageCache {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_split_by_index_percentage() {
        let cache = StoragePageCache::new(1000, 10, 4).expect("create cache");
        assert_eq!(cache.stats(PageType::Index).capacity, 100);
        assert_eq!(cache.stats(PageType::Data).capacity, 900);
    }

    #[test]
    fn zero_index_share_disables_index_cache() {
        let cache = StoragePageCache::new(1000, 0, 1).expect("create cache");
        assert!(!cache.is_cache_available(PageType::Index));
        assert!(!cache.insert(
            PageCacheKey::new("f", 0),
            Bytes::from_static(b"x"),
            PageType::Index
        ));
        assert!(cache.insert(PageCacheKey::new("f", 0), Bytes::from_static(b"x"), PageType::Data));
        assert_eq!(
            cache.lookup(&PageCacheKey::new("f", 0), PageType::Data),
            Some(Bytes::from_static(b"x"))
        );
    }

    #[test]
    fn rejects_bad_shape() {
        assert!(StoragePageCache::new(1000, 101, 4).is_err());
        assert!(StoragePageCache::new(1000, 10, 3).is_err());
        assert!(StoragePageCache::new(-1, 10, 4).is_err());
    }
}
