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
use std::sync::{Arc, RwLock};

use crate::runtime::resource_scope::Subsystem;

/// Cold-data policy pushed by the frontend.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoragePolicy {
    pub name: String,
    pub version: i64,
    pub cooldown_datetime: Option<i64>,
    pub cooldown_ttl_secs: Option<i64>,
    pub resource_name: String,
}

#[derive(Debug, Default)]
pub struct StoragePolicyMgr {
    policies: RwLock<HashMap<String, Arc<StoragePolicy>>>,
}

impl StoragePolicyMgr {
    pub fn new() -> Self {
        Self::default()
    }

    /// Newer versions replace older ones; stale updates are dropped.
    pub fn periodic_put(&self, policy: StoragePolicy) -> bool {
        let mut policies = self.policies.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = policies.get(&policy.name)
            && existing.version >= policy.version
        {
            return false;
        }
        policies.insert(policy.name.clone(), Arc::new(policy));
        true
    }

    pub fn get(&self, name: &str) -> Option<Arc<StoragePolicy>> {
        let policies = self.policies.read().unwrap_or_else(|e| e.into_inner());
        policies.get(name).cloned()
    }

    pub fn del(&self, name: &str) -> bool {
        let mut policies = self.policies.write().unwrap_or_else(|e| e.into_inner());
        policies.remove(name).is_some()
    }
}

impl Subsystem for StoragePolicyMgr {}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(version: i64) -> StoragePolicy {
        StoragePolicy {
            name: "cold".to_string(),
            version,
            cooldown_datetime: None,
            cooldown_ttl_secs: Some(86400),
            resource_name: "s3_remote".to_string(),
        }
    }

    #[test]
    fn only_newer_versions_replace() {
        let mgr = StoragePolicyMgr::new();
        assert!(mgr.periodic_put(policy(2)));
        assert!(!mgr.periodic_put(policy(1)));
        assert!(!mgr.periodic_put(policy(2)));
        assert!(mgr.periodic_put(policy(3)));
        assert_eq!(mgr.get("cold").expect("policy").version, 3);
        assert!(mgr.del("cold"));
        assert!(mgr.get("cold").is_none());
    }
}
