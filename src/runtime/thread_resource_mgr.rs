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
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::runtime::resource_scope::Subsystem;

/// CPU thread quota handed to one registered consumer (usually a query).
#[derive(Debug)]
pub struct ResourcePool {
    quota: AtomicUsize,
}

impl ResourcePool {
    pub fn quota(&self) -> usize {
        self.quota.load(Ordering::Acquire)
    }
}

/// Splits the system thread budget fairly across registered pools.
#[derive(Debug)]
pub struct ThreadResourceMgr {
    system_threads_quota: usize,
    pools: Mutex<Vec<Weak<ResourcePool>>>,
}

impl Default for ThreadResourceMgr {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(cores)
    }
}

impl ThreadResourceMgr {
    pub fn new(system_threads_quota: usize) -> Self {
        Self {
            system_threads_quota: system_threads_quota.max(1),
            pools: Mutex::new(Vec::new()),
        }
    }

    fn pools(&self) -> MutexGuard<'_, Vec<Weak<ResourcePool>>> {
        self.pools.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn system_threads_quota(&self) -> usize {
        self.system_threads_quota
    }

    pub fn register_pool(&self) -> Arc<ResourcePool> {
        let pool = Arc::new(ResourcePool {
            quota: AtomicUsize::new(0),
        });
        let mut pools = self.pools();
        pools.push(Arc::downgrade(&pool));
        self.update_fair_share(&mut pools);
        pool
    }

    /// Drop a pool; remaining pools get its share back.
    pub fn unregister_pool(&self, pool: &Arc<ResourcePool>) {
        let mut pools = self.pools();
        pools.retain(|p| !std::ptr::eq(p.as_ptr(), Arc::as_ptr(pool)));
        self.update_fair_share(&mut pools);
    }

    pub fn num_pools(&self) -> usize {
        let mut pools = self.pools();
        pools.retain(|p| p.strong_count() > 0);
        pools.len()
    }

    fn update_fair_share(&self, pools: &mut Vec<Weak<ResourcePool>>) {
        pools.retain(|p| p.strong_count() > 0);
        if pools.is_empty() {
            return;
        }
        let share = (self.system_threads_quota / pools.len()).max(1);
        for pool in pools.iter().filter_map(Weak::upgrade) {
            pool.quota.store(share, Ordering::Release);
        }
    }
}

impl Subsystem for ThreadResourceMgr {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_is_split_fairly() {
        let mgr = ThreadResourceMgr::new(8);
        let a = mgr.register_pool();
        assert_eq!(a.quota(), 8);
        let b = mgr.register_pool();
        assert_eq!(a.quota(), 4);
        assert_eq!(b.quota(), 4);
        mgr.unregister_pool(&b);
        assert_eq!(a.quota(), 8);
        assert_eq!(mgr.num_pools(), 1);
    }
}
