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
use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::lru::{CacheStats, ShardedLruCache};
use crate::runtime::resource_scope::Subsystem;

const SEGMENT_CACHE_SHARDS: usize = 16;

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct SegmentCacheKey {
    pub rowset_id: String,
    pub segment_id: u32,
}

/// Open-segment metadata kept resident so repeated scans skip footer parsing.
#[derive(Debug)]
pub struct SegmentMeta {
    pub path: PathBuf,
    pub num_rows: u64,
}

/// Entry-counted cache of opened segments. Capacity is derived from the file
/// descriptor limit since every cached segment pins an open file.
pub struct SegmentLoader {
    cache: ShardedLruCache<SegmentCacheKey, SegmentMeta>,
}

impl SegmentLoader {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: ShardedLruCache::new(capacity, SEGMENT_CACHE_SHARDS),
        }
    }

    pub fn capacity(&self) -> usize {
        self.cache.capacity()
    }

    /// Returns the cached segment or opens it with `open`.
    pub fn load_segment<E>(
        &self,
        key: SegmentCacheKey,
        open: impl FnOnce() -> Result<SegmentMeta, E>,
    ) -> Result<Arc<SegmentMeta>, E> {
        if let Some(meta) = self.cache.lookup(&key) {
            return Ok(meta);
        }
        let meta = Arc::new(open()?);
        self.cache.insert_shared(key, Arc::clone(&meta), 1);
        Ok(meta)
    }

    pub fn erase_segment(&self, key: &SegmentCacheKey) -> bool {
        self.cache.erase(key)
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

impl Subsystem for SegmentLoader {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn key(id: u32) -> SegmentCacheKey {
        SegmentCacheKey {
            rowset_id: "rs_1".to_string(),
            segment_id: id,
        }
    }

    #[test]
    fn second_load_hits_cache() {
        let loader = SegmentLoader::new(64);
        let opens = Cell::new(0);
        let open = || -> Result<SegmentMeta, ()> {
            opens.set(opens.get() + 1);
            Ok(SegmentMeta {
                path: PathBuf::from("/data/rs_1_0.dat"),
                num_rows: 42,
            })
        };
        let first = loader.load_segment(key(0), open).expect("load");
        let second = loader.load_segment(key(0), open).expect("load");
        assert_eq!(opens.get(), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.num_rows, 42);
    }

    #[test]
    fn open_error_is_propagated() {
        let loader = SegmentLoader::new(64);
        let res = loader.load_segment(key(1), || Err::<SegmentMeta, _>("missing"));
        assert_eq!(res.err(), Some("missing"));
        assert_eq!(loader.stats().entries, 0);
    }
}
