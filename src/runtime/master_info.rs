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
use std::sync::{RwLock, RwLockReadGuard};

use crate::runtime::resource_scope::Subsystem;

/// Latest frontend leader seen in heartbeats.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ClusterMaster {
    pub host: String,
    pub port: u16,
    pub cluster_id: i64,
    pub epoch: i64,
    pub token: String,
    pub backend_id: Option<i64>,
}

#[derive(Debug, Default)]
pub struct MasterInfo {
    master: RwLock<Option<ClusterMaster>>,
}

impl MasterInfo {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<ClusterMaster>> {
        self.master.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Accept `master` unless it carries an older epoch than the current one.
    pub fn update(&self, master: ClusterMaster) -> bool {
        let mut current = self.master.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = current.as_ref()
            && master.epoch < existing.epoch
        {
            return false;
        }
        *current = Some(master);
        true
    }

    pub fn get(&self) -> Option<ClusterMaster> {
        self.read().clone()
    }

    pub fn epoch(&self) -> Option<i64> {
        self.read().as_ref().map(|m| m.epoch)
    }
}

impl Subsystem for MasterInfo {}

#[cfg(test)]
mod tests {
    use super::*;

    fn master(epoch: i64) -> ClusterMaster {
        ClusterMaster {
            host: "fe1".to_string(),
            port: 9020,
            epoch,
            ..ClusterMaster::default()
        }
    }

    #[test]
    fn stale_epoch_is_ignored() {
        let info = MasterInfo::new();
        assert!(info.get().is_none());
        assert!(info.update(master(3)));
        assert!(!info.update(master(2)));
        assert!(info.update(master(3)));
        assert_eq!(info.epoch(), Some(3));
    }
}
