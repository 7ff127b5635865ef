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
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use crate::common::status::{EnvError, Result};
use crate::common::types::UniqueId;
use crate::novarocks_logging::info;
use crate::runtime::mem_tracker::{MemTracker, TrackerType};
use crate::runtime::resource_scope::Subsystem;

/// One open load (a set of tablet writers fed by a coordinator).
#[derive(Debug)]
pub struct LoadChannel {
    load_id: UniqueId,
    mem_tracker: Arc<MemTracker>,
}

impl LoadChannel {
    pub fn load_id(&self) -> UniqueId {
        self.load_id
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }
}

/// Owns open load channels. All load memory rolls up into one `Load` tracker
/// bounded by a share of the process memory limit.
#[derive(Debug)]
pub struct LoadChannelMgr {
    memory_percentage: u32,
    mem_tracker: OnceLock<Arc<MemTracker>>,
    channels: Mutex<HashMap<UniqueId, Arc<LoadChannel>>>,
}

impl LoadChannelMgr {
    pub fn new(memory_percentage: u32) -> Self {
        Self {
            memory_percentage: memory_percentage.min(100),
            mem_tracker: OnceLock::new(),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<UniqueId, Arc<LoadChannel>>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn init(&self, process_mem_limit: i64) -> Result<()> {
        if process_mem_limit <= 0 {
            return Err(EnvError::subsystem(
                "load_channel_mgr",
                format!("invalid process memory limit {process_mem_limit}"),
            ));
        }
        let limit = percent_of(process_mem_limit, self.memory_percentage);
        let load_root = MemTracker::new_root(TrackerType::Load, "Load");
        let tracker = MemTracker::new_child(TrackerType::Load, "LoadChannelMgr", limit, &load_root);
        if self.mem_tracker.set(tracker).is_err() {
            return Err(EnvError::internal("load channel manager initialized twice"));
        }
        info!("load channel memory limit: {limit} bytes ({}% of process)", self.memory_percentage);
        Ok(())
    }

    pub fn mem_tracker(&self) -> Result<&Arc<MemTracker>> {
        self.mem_tracker.get().ok_or(EnvError::NotInitialized)
    }

    pub fn open(&self, load_id: UniqueId, channel_mem_limit: i64) -> Result<Arc<LoadChannel>> {
        let parent = self.mem_tracker()?;
        let mut channels = self.channels();
        if let Some(channel) = channels.get(&load_id) {
            return Ok(Arc::clone(channel));
        }
        let channel = Arc::new(LoadChannel {
            load_id,
            mem_tracker: MemTracker::new_child(
                TrackerType::Load,
                format!("LoadChannel#{load_id}"),
                channel_mem_limit,
                parent,
            ),
        });
        channels.insert(load_id, Arc::clone(&channel));
        Ok(channel)
    }

    pub fn cancel(&self, load_id: UniqueId) -> bool {
        self.channels().remove(&load_id).is_some()
    }

    pub fn open_channels(&self) -> usize {
        self.channels().len()
    }
}

/// `pct` percent of `bytes`, multiplied before dividing.
fn percent_of(bytes: i64, pct: u32) -> i64 {
    (i128::from(bytes) * i128::from(pct) / 100) as i64
}

impl Subsystem for LoadChannelMgr {
    fn shutdown(&self) {
        self.channels().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_bounds_load_memory_by_percentage() {
        let mgr = LoadChannelMgr::new(50);
        assert!(mgr.open(UniqueId::new(1, 1), -1).is_err());
        mgr.init(1000).expect("init");
        assert_eq!(mgr.mem_tracker().expect("tracker").limit(), 500);
        assert!(mgr.init(1000).is_err());

        let channel = mgr.open(UniqueId::new(1, 1), 100).expect("open");
        channel.mem_tracker().consume(600);
        assert!(channel.mem_tracker().any_limit_exceeded());
        assert!(mgr.mem_tracker().expect("tracker").any_limit_exceeded());
        channel.mem_tracker().release(600);
        assert!(mgr.cancel(UniqueId::new(1, 1)));
        assert_eq!(mgr.open_channels(), 0);
    }

    #[test]
    fn load_limit_keeps_exact_share_of_process_limit() {
        let mgr = LoadChannelMgr::new(50);
        mgr.init(4 << 30).expect("init");
        assert_eq!(mgr.mem_tracker().expect("tracker").limit(), 2 << 30);

        let mgr = LoadChannelMgr::new(30);
        mgr.init(999).expect("init");
        assert_eq!(mgr.mem_tracker().expect("tracker").limit(), 299);

        assert_eq!(percent_of(i64::MAX, 100), i64::MAX);
    }

    #[test]
    fn rejects_non_positive_limit() {
        assert!(LoadChannelMgr::new(50).init(0).is_err());
    }
}
