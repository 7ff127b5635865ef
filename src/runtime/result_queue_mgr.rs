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
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;

use crate::common::status::{EnvError, Result};
use crate::common::types::UniqueId;
use crate::runtime::resource_scope::Subsystem;

const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Bytes>,
    shutdown: bool,
}

/// Bounded blocking queue of serialized result batches.
#[derive(Debug)]
pub struct ResultQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    cv: Condvar,
}

impl ResultQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState::default()),
            cv: Condvar::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns false when the queue is shut down or stays full for `timeout`.
    pub fn blocking_put(&self, item: Bytes, timeout: Duration) -> bool {
        let state = self.state();
        let (mut state, _) = self
            .cv
            .wait_timeout_while(state, timeout, |s| s.items.len() >= self.capacity && !s.shutdown)
            .unwrap_or_else(|e| e.into_inner());
        if state.shutdown || state.items.len() >= self.capacity {
            return false;
        }
        state.items.push_back(item);
        self.cv.notify_all();
        true
    }

    pub fn blocking_get(&self, timeout: Duration) -> Option<Bytes> {
        let state = self.state();
        let (mut state, _) = self
            .cv
            .wait_timeout_while(state, timeout, |s| s.items.is_empty() && !s.shutdown)
            .unwrap_or_else(|e| e.into_inner());
        let item = state.items.pop_front();
        if item.is_some() {
            self.cv.notify_all();
        }
        item
    }

    pub fn shutdown(&self) {
        self.state().shutdown = true;
        self.cv.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result queues of fragment instances that stream results to an in-process
/// consumer instead of the frontend.
#[derive(Debug, Default)]
pub struct ResultQueueMgr {
    queues: Mutex<HashMap<UniqueId, Arc<ResultQueue>>>,
}

impl ResultQueueMgr {
    pub fn new() -> Self {
        Self::default()
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<UniqueId, Arc<ResultQueue>>> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn create_queue(&self, fragment_instance_id: UniqueId) -> Arc<ResultQueue> {
        Arc::clone(
            self.queues()
                .entry(fragment_instance_id)
                .or_insert_with(|| Arc::new(ResultQueue::new(DEFAULT_QUEUE_CAPACITY))),
        )
    }

    pub fn fetch_result(
        &self,
        fragment_instance_id: UniqueId,
        timeout: Duration,
    ) -> Result<Option<Bytes>> {
        let queue = self
            .queues()
            .get(&fragment_instance_id)
            .cloned()
            .ok_or_else(|| {
                EnvError::internal(format!("no result queue for {fragment_instance_id}"))
            })?;
        Ok(queue.blocking_get(timeout))
    }

    pub fn cancel(&self, fragment_instance_id: UniqueId) -> bool {
        match self.queues().remove(&fragment_instance_id) {
            Some(queue) => {
                queue.shutdown();
                true
            }
            None => false,
        }
    }
}

impl Subsystem for ResultQueueMgr {
    fn shutdown(&self) {
        for (_, queue) in self.queues().drain() {
            queue.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_and_cancel() {
        let mgr = ResultQueueMgr::new();
        let id = UniqueId::new(5, 5);
        let queue = mgr.create_queue(id);
        assert!(Arc::ptr_eq(&queue, &mgr.create_queue(id)));
        assert!(queue.blocking_put(Bytes::from_static(b"row"), Duration::from_millis(10)));
        assert_eq!(
            mgr.fetch_result(id, Duration::from_millis(10)).expect("fetch"),
            Some(Bytes::from_static(b"row"))
        );
        assert_eq!(mgr.fetch_result(id, Duration::from_millis(5)).expect("fetch"), None);
        assert!(mgr.cancel(id));
        assert!(!queue.blocking_put(Bytes::from_static(b"late"), Duration::from_millis(5)));
        assert!(mgr.fetch_result(id, Duration::from_millis(5)).is_err());
    }
}
