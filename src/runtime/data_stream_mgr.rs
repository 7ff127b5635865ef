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
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::common::status::{EnvError, Result};
use crate::common::types::UniqueId;
use crate::novarocks_logging::debug;
use crate::runtime::resource_scope::Subsystem;

/// Receiving end of an exchange for one (fragment instance, node) pair.
#[derive(Debug)]
pub struct DataStreamRecvr {
    fragment_instance_id: UniqueId,
    dest_node_id: i32,
    num_senders: usize,
    closed_senders: AtomicUsize,
    cancelled: AtomicBool,
}

impl DataStreamRecvr {
    pub fn fragment_instance_id(&self) -> UniqueId {
        self.fragment_instance_id
    }

    pub fn dest_node_id(&self) -> i32 {
        self.dest_node_id
    }

    /// Record end-of-stream from one sender. Returns true once all are done.
    pub fn close_sender(&self) -> bool {
        self.closed_senders.fetch_add(1, Ordering::AcqRel) + 1 >= self.num_senders
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

type RecvrKey = (UniqueId, i32);

#[derive(Debug, Default)]
pub struct DataStreamMgr {
    receivers: Mutex<HashMap<RecvrKey, Arc<DataStreamRecvr>>>,
}

impl DataStreamMgr {
    pub fn new() -> Self {
        Self::default()
    }

    fn receivers(&self) -> MutexGuard<'_, HashMap<RecvrKey, Arc<DataStreamRecvr>>> {
        self.receivers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn create_recvr(
        &self,
        fragment_instance_id: UniqueId,
        dest_node_id: i32,
        num_senders: usize,
    ) -> Result<Arc<DataStreamRecvr>> {
        let mut receivers = self.receivers();
        let key = (fragment_instance_id, dest_node_id);
        if receivers.contains_key(&key) {
            return Err(EnvError::internal(format!(
                "receiver for fragment {fragment_instance_id} node {dest_node_id} already exists"
            )));
        }
        let recvr = Arc::new(DataStreamRecvr {
            fragment_instance_id,
            dest_node_id,
            num_senders,
            closed_senders: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
        });
        receivers.insert(key, Arc::clone(&recvr));
        Ok(recvr)
    }

    pub fn find_recvr(
        &self,
        fragment_instance_id: UniqueId,
        dest_node_id: i32,
    ) -> Option<Arc<DataStreamRecvr>> {
        self.receivers()
            .get(&(fragment_instance_id, dest_node_id))
            .cloned()
    }

    pub fn deregister_recvr(&self, fragment_instance_id: UniqueId, dest_node_id: i32) -> bool {
        self.receivers()
            .remove(&(fragment_instance_id, dest_node_id))
            .is_some()
    }

    /// Cancel and drop every receiver of a fragment instance.
    pub fn cancel(&self, fragment_instance_id: UniqueId) -> usize {
        let mut receivers = self.receivers();
        let before = receivers.len();
        receivers.retain(|(finst, _), recvr| {
            if *finst == fragment_instance_id {
                recvr.cancel();
                false
            } else {
                true
            }
        });
        let cancelled = before - receivers.len();
        debug!("cancelled {cancelled} receivers of fragment {fragment_instance_id}");
        cancelled
    }
}

impl Subsystem for DataStreamMgr {
    fn shutdown(&self) {
        for (_, recvr) in self.receivers().drain() {
            recvr.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_find_and_cancel() {
        let mgr = DataStreamMgr::new();
        let finst = UniqueId::new(7, 1);
        let recvr = mgr.create_recvr(finst, 3, 2).expect("create");
        assert!(mgr.create_recvr(finst, 3, 2).is_err());
        mgr.create_recvr(finst, 4, 1).expect("create");
        mgr.create_recvr(UniqueId::new(7, 2), 3, 1).expect("create");

        assert!(mgr.find_recvr(finst, 3).is_some());
        assert!(!recvr.close_sender());
        assert!(recvr.close_sender());

        assert_eq!(mgr.cancel(finst), 2);
        assert!(recvr.is_cancelled());
        assert!(mgr.find_recvr(finst, 4).is_none());
        assert!(mgr.deregister_recvr(UniqueId::new(7, 2), 3));
    }
}
