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
//! Multi-level task queue for pipeline executors.
//!
//! Each executor owns a sub-queue; an idle executor steals from the tail of
//! its peers before parking.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

const PARK_TIMEOUT_MS: u64 = 10;

/// Result of running a task for one time slice.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskState {
    Finished,
    Yield,
    Blocked,
}

/// A unit of pipeline work driven by the executors.
pub trait PipelineTask: Send {
    fn name(&self) -> &str;

    fn execute(&mut self) -> TaskState;

    /// Polled while the task is parked as blocked.
    fn is_ready(&self) -> bool {
        true
    }
}

pub type BoxedTask = Box<dyn PipelineTask>;

pub struct TaskQueue {
    sub_queues: Vec<Mutex<VecDeque<BoxedTask>>>,
    pending: AtomicUsize,
    next_queue: AtomicUsize,
    closed: AtomicBool,
    park: Mutex<()>,
    cv: Condvar,
}

impl TaskQueue {
    pub fn new(num_queues: usize) -> Self {
        let num_queues = num_queues.max(1);
        Self {
            sub_queues: (0..num_queues).map(|_| Mutex::new(VecDeque::new())).collect(),
            pending: AtomicUsize::new(0),
            next_queue: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            park: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    pub fn num_queues(&self) -> usize {
        self.sub_queues.len()
    }

    pub fn len(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn sub_queue(&self, idx: usize) -> MutexGuard<'_, VecDeque<BoxedTask>> {
        self.sub_queues[idx % self.sub_queues.len()]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, task: BoxedTask) {
        let idx = self.next_queue.fetch_add(1, Ordering::AcqRel);
        self.push_to(idx, task);
    }

    pub fn push_to(&self, idx: usize, task: BoxedTask) {
        self.sub_queue(idx).push_back(task);
        self.pending.fetch_add(1, Ordering::AcqRel);
        let _guard = self.park.lock().unwrap_or_else(|e| e.into_inner());
        self.cv.notify_one();
    }

    fn try_take(&self, idx: usize) -> Option<BoxedTask> {
        if let Some(task) = self.sub_queue(idx).pop_front() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Some(task);
        }
        let n = self.sub_queues.len();
        for offset in 1..n {
            if let Some(task) = self.sub_queue(idx + offset).pop_back() {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                return Some(task);
            }
        }
        None
    }

    /// Blocks until a task is available for executor `idx`; `None` once closed.
    pub fn take(&self, idx: usize) -> Option<BoxedTask> {
        loop {
            if self.is_closed() {
                return None;
            }
            if let Some(task) = self.try_take(idx) {
                return Some(task);
            }
            let guard = self.park.lock().unwrap_or_else(|e| e.into_inner());
            if self.is_empty() && !self.is_closed() {
                let _ = self
                    .cv
                    .wait_timeout(guard, Duration::from_millis(PARK_TIMEOUT_MS))
                    .unwrap_or_else(|e| e.into_inner());
            }
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _guard = self.park.lock().unwrap_or_else(|e| e.into_inner());
        self.cv.notify_all();
    }
}
