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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::common::status::{EnvError, Result};
use crate::common::types::UniqueId;
use crate::novarocks_logging::info;
use crate::runtime::resource_scope::Subsystem;

/// Execution state of one fragment instance.
#[derive(Debug)]
pub struct FragmentExecState {
    query_id: UniqueId,
    fragment_instance_id: UniqueId,
    cancelled: AtomicBool,
    cancel_reason: Mutex<Option<String>>,
}

impl FragmentExecState {
    pub fn query_id(&self) -> UniqueId {
        self.query_id
    }

    pub fn fragment_instance_id(&self) -> UniqueId {
        self.fragment_instance_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn cancel_reason(&self) -> Option<String> {
        self.cancel_reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn cancel(&self, reason: &str) {
        *self.cancel_reason.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason.to_string());
        self.cancelled.store(true, Ordering::Release);
    }
}

/// Tracks running fragment instances so they can be cancelled by id or query.
#[derive(Debug, Default)]
pub struct FragmentMgr {
    fragments: Mutex<HashMap<UniqueId, Arc<FragmentExecState>>>,
}

impl FragmentMgr {
    pub fn new() -> Self {
        Self::default()
    }

    fn fragments(&self) -> MutexGuard<'_, HashMap<UniqueId, Arc<FragmentExecState>>> {
        self.fragments.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(
        &self,
        query_id: UniqueId,
        fragment_instance_id: UniqueId,
    ) -> Result<Arc<FragmentExecState>> {
        let mut fragments = self.fragments();
        if fragments.contains_key(&fragment_instance_id) {
            return Err(EnvError::internal(format!(
                "fragment instance {fragment_instance_id} is already running"
            )));
        }
        let state = Arc::new(FragmentExecState {
            query_id,
            fragment_instance_id,
            cancelled: AtomicBool::new(false),
            cancel_reason: Mutex::new(None),
        });
        fragments.insert(fragment_instance_id, Arc::clone(&state));
        Ok(state)
    }

    pub fn cancel(&self, fragment_instance_id: UniqueId, reason: &str) -> bool {
        match self.fragments().get(&fragment_instance_id) {
            Some(state) => {
                state.cancel(reason);
                true
            }
            None => false,
        }
    }

    pub fn cancel_query(&self, query_id: UniqueId, reason: &str) -> usize {
        let fragments = self.fragments();
        let mut cancelled = 0;
        for state in fragments.values().filter(|s| s.query_id == query_id) {
            state.cancel(reason);
            cancelled += 1;
        }
        cancelled
    }

    /// Called when an instance finishes, cancelled or not.
    pub fn remove(&self, fragment_instance_id: UniqueId) -> bool {
        self.fragments().remove(&fragment_instance_id).is_some()
    }

    pub fn running_count(&self) -> usize {
        self.fragments().len()
    }
}

impl Subsystem for FragmentMgr {
    fn shutdown(&self) {
        let fragments: Vec<_> = self.fragments().drain().map(|(_, s)| s).collect();
        if !fragments.is_empty() {
            info!("cancelling {} fragment instances on shutdown", fragments.len());
        }
        for state in fragments {
            state.cancel("backend shutting down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_by_instance_and_query() {
        let mgr = FragmentMgr::new();
        let query = UniqueId::new(1, 0);
        let a = mgr.register(query, UniqueId::new(1, 1)).expect("register");
        let b = mgr.register(query, UniqueId::new(1, 2)).expect("register");
        let other = mgr.register(UniqueId::new(2, 0), UniqueId::new(2, 1)).expect("register");
        assert!(mgr.register(query, UniqueId::new(1, 1)).is_err());

        assert!(mgr.cancel(a.fragment_instance_id(), "user cancel"));
        assert_eq!(a.cancel_reason().as_deref(), Some("user cancel"));
        assert_eq!(mgr.cancel_query(query, "timeout"), 2);
        assert!(b.is_cancelled());
        assert!(!other.is_cancelled());

        assert!(mgr.remove(a.fragment_instance_id()));
        assert_eq!(mgr.running_count(), 2);
    }
}
