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
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use crate::common::status::{EnvError, Result};
use crate::runtime::mem_tracker::{MemTracker, TrackedBytes};
use crate::runtime::resource_scope::Subsystem;

const MAX_SIZE_CLASSES: usize = 48;

/// Power-of-two sized buffer handed out by [`ChunkAllocator`].
pub struct Chunk {
    data: Box<[u8]>,
    _accounted: TrackedBytes,
}

impl Chunk {
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Recycles freed chunks in per-size free lists, keeping at most
/// `reserve_limit` bytes parked. Every live or parked chunk is charged to the
/// allocator's tracker.
pub struct ChunkAllocator {
    reserve_limit: i64,
    reserved_bytes: AtomicI64,
    free_lists: Vec<Mutex<Vec<Chunk>>>,
    tracker: Arc<MemTracker>,
}

impl ChunkAllocator {
    pub fn new(reserve_limit: i64, tracker: Arc<MemTracker>) -> Self {
        Self {
            reserve_limit: reserve_limit.max(0),
            reserved_bytes: AtomicI64::new(0),
            free_lists: (0..MAX_SIZE_CLASSES).map(|_| Mutex::new(Vec::new())).collect(),
            tracker,
        }
    }

    pub fn reserve_limit(&self) -> i64 {
        self.reserve_limit
    }

    pub fn reserved_bytes(&self) -> i64 {
        self.reserved_bytes.load(Ordering::Relaxed)
    }

    pub fn tracker(&self) -> &Arc<MemTracker> {
        &self.tracker
    }

    /// `size` is rounded up to the next power of two.
    pub fn allocate(&self, size: usize) -> Result<Chunk> {
        let too_large = || EnvError::internal(format!("chunk size {size} is too large"));
        let size = size.max(1).checked_next_power_of_two().ok_or_else(too_large)?;
        let class = size.trailing_zeros() as usize;
        let Some(free_list) = self.free_lists.get(class) else {
            return Err(too_large());
        };
        if let Some(chunk) = free_list.lock().unwrap_or_else(|e| e.into_inner()).pop() {
            self.reserved_bytes.fetch_sub(size as i64, Ordering::Relaxed);
            return Ok(chunk);
        }
        Ok(Chunk {
            data: vec![0u8; size].into_boxed_slice(),
            _accounted: TrackedBytes::new(size, Arc::clone(&self.tracker)),
        })
    }

    /// Parks the chunk for reuse, or drops it when the reserve is full.
    pub fn free(&self, chunk: Chunk) {
        let size = chunk.size() as i64;
        let class = chunk.size().trailing_zeros() as usize;
        let reserved = self.reserved_bytes.fetch_add(size, Ordering::Relaxed);
        if reserved + size > self.reserve_limit {
            self.reserved_bytes.fetch_sub(size, Ordering::Relaxed);
            return;
        }
        self.free_lists[class]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(chunk);
    }

    /// Drops every parked chunk.
    pub fn release_reserved(&self) {
        for list in &self.free_lists {
            let drained: Vec<Chunk> =
                std::mem::take(&mut *list.lock().unwrap_or_else(|e| e.into_inner()));
            let bytes: i64 = drained.iter().map(|c| c.size() as i64).sum();
            self.reserved_bytes.fetch_sub(bytes, Ordering::Relaxed);
        }
    }
}

impl Subsystem for ChunkAllocator {
    fn shutdown(&self) {
        self.release_reserved();
    }
}
