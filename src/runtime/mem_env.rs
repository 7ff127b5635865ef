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
//! Memory environment: the Orphan tracker, the allocation hook and the global
//! caches sized by the budget planner.

use std::sync::Arc;

use crate::cache::chunk_allocator::ChunkAllocator;
use crate::cache::page_cache::StoragePageCache;
use crate::cache::segment_cache::SegmentLoader;
use crate::common::app_config::MemoryConfig;
use crate::common::mem_info::MemInfo;
use crate::common::status::Result;
use crate::exec::spill::block_spill_manager::BlockSpillManager;
use crate::novarocks_logging::info;
use crate::runtime::alloc_hook::{AllocHookCapability, AllocationHook};
use crate::runtime::mem_budget::{
    check_power_of_two, chunk_reserved_bytes_limit, log_budget, query_fd_soft_limit,
    resolve_fd_number, segment_cache_capacity, storage_page_cache_limit,
};
use crate::runtime::mem_tracker::{MemTracker, TrackerType, thread_mem_tracker};
use crate::runtime::resource_scope::{ResourceScope, Subsystem};
use crate::runtime::tmp_file_mgr::TmpFileMgr;

pub const ORPHAN_TRACKER_LABEL: &str = "Orphan";

/// Collaborators the memory environment initializes in step 6.
pub struct SpillManagers<'a> {
    pub tmp_file_mgr: &'a TmpFileMgr,
    pub block_spill_mgr: &'a BlockSpillManager,
}

pub struct MemEnv {
    orphan_tracker: Arc<MemTracker>,
    alloc_hook: Option<Arc<AllocationHook>>,
    page_cache: Arc<StoragePageCache>,
    segment_loader: Arc<SegmentLoader>,
    chunk_allocator: Arc<ChunkAllocator>,
}

/// Power-of-two checks that must pass before anything is constructed.
pub fn validate_memory_config(config: &MemoryConfig) -> Result<()> {
    check_power_of_two("min_buffer_size", config.min_buffer_size)?;
    check_power_of_two("min_chunk_reserved_bytes", config.min_chunk_reserved_bytes)
}

impl MemEnv {
    /// Build the memory environment. Every constructed component is adopted
    /// into `scope`; the first failing step aborts the rest.
    pub fn init(
        config: &MemoryConfig,
        mem_info: &MemInfo,
        capability: AllocHookCapability,
        spill: SpillManagers<'_>,
        scope: &mut ResourceScope,
    ) -> Result<Self> {
        let orphan_tracker = MemTracker::new_root(TrackerType::Global, ORPHAN_TRACKER_LABEL);
        thread_mem_tracker::attach(Arc::clone(&orphan_tracker));
        scope.adopt_arc("orphan_mem_tracker", Arc::clone(&orphan_tracker));

        let alloc_hook = AllocationHook::install(capability, Arc::clone(&orphan_tracker))
            .map(|hook| scope.adopt("alloc_hook", hook));

        check_power_of_two("min_buffer_size", config.min_buffer_size)?;

        let page_budget = storage_page_cache_limit(&config.storage_page_cache_limit, mem_info)?;
        log_budget(
            "storage page cache",
            page_budget.bytes,
            &config.storage_page_cache_limit,
        );
        let page_cache = scope.adopt(
            "storage_page_cache",
            StoragePageCache::new(
                page_budget.bytes,
                config.index_page_cache_percentage,
                config.storage_page_cache_shard_size,
            )?,
        );

        let fd_number = resolve_fd_number(query_fd_soft_limit(), config.min_file_descriptor_number);
        let segment_capacity = segment_cache_capacity(fd_number);
        info!(
            "segment cache capacity: {} (file descriptor limit {})",
            segment_capacity, fd_number
        );
        let segment_loader = scope.adopt(
            "segment_loader",
            SegmentLoader::new(usize::try_from(segment_capacity).unwrap_or(usize::MAX)),
        );

        spill.tmp_file_mgr.init()?;
        spill.block_spill_mgr.init()?;

        check_power_of_two("min_chunk_reserved_bytes", config.min_chunk_reserved_bytes)?;
        let chunk_limit = chunk_reserved_bytes_limit(
            &config.chunk_reserved_bytes_limit,
            config.min_chunk_reserved_bytes,
            mem_info,
        )?;
        log_budget("chunk allocator reserved", chunk_limit, &config.chunk_reserved_bytes_limit);
        let chunk_tracker =
            MemTracker::new_child(TrackerType::Global, "ChunkAllocator", -1, &orphan_tracker);
        let chunk_allocator = scope.adopt(
            "chunk_allocator",
            ChunkAllocator::new(chunk_limit, chunk_tracker),
        );

        Ok(Self {
            orphan_tracker,
            alloc_hook,
            page_cache,
            segment_loader,
            chunk_allocator,
        })
    }

    pub fn orphan_tracker(&self) -> &Arc<MemTracker> {
        &self.orphan_tracker
    }

    pub fn alloc_hook(&self) -> Option<&Arc<AllocationHook>> {
        self.alloc_hook.as_ref()
    }

    pub fn page_cache(&self) -> &Arc<StoragePageCache> {
        &self.page_cache
    }

    pub fn segment_loader(&self) -> &Arc<SegmentLoader> {
        &self.segment_loader
    }

    pub fn chunk_allocator(&self) -> &Arc<ChunkAllocator> {
        &self.chunk_allocator
    }
}

impl Subsystem for MemTracker {
    fn shutdown(&self) {
        // Unbind from the tearing-down thread if this tracker is its sink.
        if let Some(current) = thread_mem_tracker::current()
            && std::ptr::eq(Arc::as_ptr(&current), self)
        {
            thread_mem_tracker::detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::status::EnvError;

    const GIB: i64 = 1024 * 1024 * 1024;

    fn no_hook() -> AllocHookCapability {
        AllocHookCapability {
            sanitizer_build: false,
            alternate_allocator: false,
            user_enabled: false,
        }
    }

    fn config() -> MemoryConfig {
        MemoryConfig {
            storage_page_cache_limit: "8G".to_string(),
            chunk_reserved_bytes_limit: "1000000".to_string(),
            min_chunk_reserved_bytes: 4096,
            ..MemoryConfig::default()
        }
    }

    fn with_spill<T>(f: impl FnOnce(SpillManagers<'_>) -> T) -> T {
        let store = tempfile::tempdir().expect("tempdir");
        let paths = vec![store.path().display().to_string()];
        let tmp = TmpFileMgr::new(paths.clone());
        let spill = BlockSpillManager::new(paths);
        f(SpillManagers {
            tmp_file_mgr: &tmp,
            block_spill_mgr: &spill,
        })
    }

    #[test]
    fn builds_caches_sized_by_planner() {
        let mem_info = MemInfo::new(10 * GIB, 16 * GIB);
        let mut scope = ResourceScope::new();
        let env = with_spill(|spill| {
            MemEnv::init(&config(), &mem_info, no_hook(), spill, &mut scope)
        })
        .expect("init mem env");

        // 8G halves to 4G, below half of the 10G limit.
        assert_eq!(env.page_cache().capacity() as i64, 4 * GIB);
        assert!(env.segment_loader().capacity() > 0);
        assert_eq!(env.chunk_allocator().reserve_limit(), 999_424);
        assert!(env.alloc_hook().is_none());
        assert_eq!(
            scope.names(),
            vec![
                "orphan_mem_tracker",
                "storage_page_cache",
                "segment_loader",
                "chunk_allocator"
            ]
        );
        let bound = thread_mem_tracker::current().expect("orphan bound");
        assert!(Arc::ptr_eq(&bound, env.orphan_tracker()));

        drop(env);
        scope.release();
        assert!(thread_mem_tracker::current().is_none());
    }

    #[test]
    fn bad_min_buffer_size_stops_before_caches() {
        let mem_info = MemInfo::new(10 * GIB, 16 * GIB);
        let mut scope = ResourceScope::new();
        let cfg = MemoryConfig {
            min_buffer_size: 100,
            ..config()
        };
        assert!(validate_memory_config(&cfg).is_err());
        let err = with_spill(|spill| MemEnv::init(&cfg, &mem_info, no_hook(), spill, &mut scope))
            .err()
            .expect("must fail");
        assert!(matches!(err, EnvError::InternalError(ref msg) if msg.contains("min_buffer_size")));
        assert_eq!(scope.names(), vec!["orphan_mem_tracker"]);
    }

    #[test]
    fn bad_min_chunk_size_fails_after_spill_init() {
        let mem_info = MemInfo::new(10 * GIB, 16 * GIB);
        let mut scope = ResourceScope::new();
        let cfg = MemoryConfig {
            min_chunk_reserved_bytes: 1000,
            ..config()
        };
        let err = with_spill(|spill| MemEnv::init(&cfg, &mem_info, no_hook(), spill, &mut scope))
            .err()
            .expect("must fail");
        assert!(err.is_internal());
        assert!(!scope.names().contains(&"chunk_allocator"));
    }
}
