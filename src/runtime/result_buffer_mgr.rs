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
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::common::status::{EnvError, Result};
use crate::common::types::UniqueId;
use crate::novarocks_logging::{debug, info};
use crate::runtime::resource_scope::Subsystem;

const EXPIRY_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct BufferState {
    batches: VecDeque<Bytes>,
    eos: bool,
    cancelled: bool,
    next_packet_seq: i64,
}

/// One fetched packet. `batch` is `None` on end of stream.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FetchedPacket {
    pub packet_seq: i64,
    pub batch: Option<Bytes>,
}

/// Bounded result queue between a query's result sink and its fetcher.
#[derive(Debug)]
pub struct BufferControlBlock {
    query_id: UniqueId,
    capacity: usize,
    state: Mutex<BufferState>,
    cv: Condvar,
}

impl BufferControlBlock {
    fn new(query_id: UniqueId, capacity: usize) -> Self {
        Self {
            query_id,
            capacity: capacity.max(1),
            state: Mutex::new(BufferState::default()),
            cv: Condvar::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn query_id(&self) -> UniqueId {
        self.query_id
    }

    /// Blocks while the buffer is full.
    pub fn add_batch(&self, batch: Bytes) -> Result<()> {
        let mut state = self.state();
        while state.batches.len() >= self.capacity && !state.cancelled {
            state = self.cv.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        if state.cancelled {
            return Err(EnvError::internal(format!("query {} cancelled", self.query_id)));
        }
        state.batches.push_back(batch);
        self.cv.notify_all();
        Ok(())
    }

    pub fn close(&self) {
        self.state().eos = true;
        self.cv.notify_all();
    }

    pub fn cancel(&self) {
        let mut state = self.state();
        state.cancelled = true;
        state.batches.clear();
        self.cv.notify_all();
    }

    fn fetch(&self, timeout: Duration) -> Result<Option<FetchedPacket>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state();
        loop {
            if state.cancelled {
                return Err(EnvError::internal(format!("query {} cancelled", self.query_id)));
            }
            if let Some(batch) = state.batches.pop_front() {
                let packet_seq = state.next_packet_seq;
                state.next_packet_seq += 1;
                self.cv.notify_all();
                return Ok(Some(FetchedPacket {
                    packet_seq,
                    batch: Some(batch),
                }));
            }
            if state.eos {
                let packet_seq = state.next_packet_seq;
                state.next_packet_seq += 1;
                return Ok(Some(FetchedPacket {
                    packet_seq,
                    batch: None,
                }));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            state = self
                .cv
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }
}

#[derive(Default)]
struct MgrState {
    buffers: HashMap<UniqueId, Arc<BufferControlBlock>>,
    // deadline -> queries to cancel then
    deadlines: BTreeMap<Instant, Vec<UniqueId>>,
}

struct MgrShared {
    state: Mutex<MgrState>,
    stop: AtomicBool,
    wake: Condvar,
}

/// Owns result buffers of running queries and cancels those whose fetch
/// deadline passed.
pub struct ResultBufferMgr {
    shared: Arc<MgrShared>,
    cancel_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Default for ResultBufferMgr {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultBufferMgr {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(MgrShared {
                state: Mutex::new(MgrState::default()),
                stop: AtomicBool::new(false),
                wake: Condvar::new(),
            }),
            cancel_thread: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, MgrState> {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start the expiry thread.
    pub fn init(&self) -> Result<()> {
        let mut slot = self.cancel_thread.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("result_buffer_cancel".to_string())
            .spawn(move || cancel_expired_loop(shared))
            .map_err(|e| EnvError::io("spawn result buffer cancel thread", e))?;
        *slot = Some(handle);
        info!("result buffer manager started");
        Ok(())
    }

    pub fn create_sender(
        &self,
        query_id: UniqueId,
        buffer_size: usize,
        timeout: Duration,
    ) -> Arc<BufferControlBlock> {
        let mut state = self.state();
        if let Some(existing) = state.buffers.get(&query_id) {
            return Arc::clone(existing);
        }
        let block = Arc::new(BufferControlBlock::new(query_id, buffer_size));
        state.buffers.insert(query_id, Arc::clone(&block));
        state
            .deadlines
            .entry(Instant::now() + timeout)
            .or_default()
            .push(query_id);
        block
    }

    /// Next packet of `query_id`, or `None` if nothing arrived within `timeout`.
    pub fn fetch_data(
        &self,
        query_id: UniqueId,
        timeout: Duration,
    ) -> Result<Option<FetchedPacket>> {
        let block = self
            .state()
            .buffers
            .get(&query_id)
            .cloned()
            .ok_or_else(|| EnvError::internal(format!("no result buffer for query {query_id}")))?;
        block.fetch(timeout)
    }

    pub fn cancel(&self, query_id: UniqueId) -> bool {
        let block = self.state().buffers.remove(&query_id);
        match block {
            Some(block) => {
                block.cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.state().buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn expire_now(&self) -> usize {
        cancel_expired(&self.shared, Instant::now() + Duration::from_secs(3600))
    }
}

fn cancel_expired(shared: &MgrShared, now: Instant) -> usize {
    let expired: Vec<Arc<BufferControlBlock>> = {
        let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
        let live = state.deadlines.split_off(&now);
        let due = std::mem::replace(&mut state.deadlines, live);
        due.into_values()
            .flatten()
            .filter_map(|id| state.buffers.remove(&id))
            .collect()
    };
    for block in &expired {
        debug!("cancel expired result buffer of query {}", block.query_id());
        block.cancel();
    }
    expired.len()
}

fn cancel_expired_loop(shared: Arc<MgrShared>) {
    while !shared.stop.load(Ordering::Acquire) {
        cancel_expired(&shared, Instant::now());
        let guard = shared.state.lock().unwrap_or_else(|e| e.into_inner());
        let _ = shared
            .wake
            .wait_timeout(guard, EXPIRY_CHECK_INTERVAL)
            .unwrap_or_else(|e| e.into_inner());
    }
}

impl Subsystem for ResultBufferMgr {
    fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.wake.notify_all();
        let handle = self.cancel_thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        let blocks: Vec<_> = self.state().buffers.drain().map(|(_, b)| b).collect();
        for block in blocks {
            block.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_in_order_then_eos() {
        let mgr = ResultBufferMgr::new();
        let qid = UniqueId::new(1, 1);
        let sender = mgr.create_sender(qid, 4, Duration::from_secs(300));
        sender.add_batch(Bytes::from_static(b"a")).expect("add");
        sender.add_batch(Bytes::from_static(b"b")).expect("add");
        sender.close();

        let first = mgr.fetch_data(qid, Duration::from_millis(10)).expect("fetch").expect("packet");
        assert_eq!(first.packet_seq, 0);
        assert_eq!(first.batch, Some(Bytes::from_static(b"a")));
        let second = mgr
            .fetch_data(qid, Duration::from_millis(10))
            .expect("fetch")
            .expect("packet");
        assert_eq!(second.packet_seq, 1);
        let eos = mgr.fetch_data(qid, Duration::from_millis(10)).expect("fetch").expect("packet");
        assert_eq!(eos.batch, None);
    }

    #[test]
    fn empty_buffer_times_out() {
        let mgr = ResultBufferMgr::new();
        let qid = UniqueId::new(2, 1);
        mgr.create_sender(qid, 1, Duration::from_secs(300));
        assert_eq!(mgr.fetch_data(qid, Duration::from_millis(5)).expect("fetch"), None);
        assert!(mgr.fetch_data(UniqueId::new(9, 9), Duration::from_millis(5)).is_err());
    }

    #[test]
    fn expired_buffers_are_cancelled() {
        let mgr = ResultBufferMgr::new();
        let sender = mgr.create_sender(UniqueId::new(3, 1), 1, Duration::from_secs(1));
        assert_eq!(mgr.expire_now(), 1);
        assert!(mgr.is_empty());
        assert!(sender.add_batch(Bytes::from_static(b"late")).is_err());
    }

    #[test]
    fn init_starts_and_shutdown_joins_expiry_thread() {
        let mgr = ResultBufferMgr::new();
        mgr.init().expect("init");
        mgr.init().expect("init is idempotent");
        mgr.create_sender(UniqueId::new(4, 1), 1, Duration::from_secs(300));
        Subsystem::shutdown(&mgr);
        assert!(mgr.is_empty());
        assert!(mgr.cancel_thread.lock().unwrap().is_none());
    }
}
