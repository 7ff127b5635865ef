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
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use super::task_queue::{BoxedTask, TaskQueue};
use crate::common::status::{EnvError, Result};
use crate::novarocks_logging::debug;

const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

struct BlockedState {
    queue: Arc<TaskQueue>,
    poll_interval: Duration,
    blocked: Mutex<VecDeque<BoxedTask>>,
    cv: Condvar,
    cv_mutex: Mutex<()>,
    shutdown: AtomicBool,
}

/// Parks blocked pipeline tasks and moves them back to the task queue once
/// they report ready.
pub struct BlockedTaskScheduler {
    state: Arc<BlockedState>,
    poller: Mutex<Option<thread::JoinHandle<()>>>,
}

impl BlockedTaskScheduler {
    pub fn new(queue: Arc<TaskQueue>) -> Self {
        Self {
            state: Arc::new(BlockedState {
                queue,
                poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
                blocked: Mutex::new(VecDeque::new()),
                cv: Condvar::new(),
                cv_mutex: Mutex::new(()),
                shutdown: AtomicBool::new(false),
            }),
            poller: Mutex::new(None),
        }
    }

    pub(crate) fn start(&self) -> Result<()> {
        let mut poller = self.poller.lock().unwrap_or_else(|e| e.into_inner());
        if poller.is_some() {
            return Err(EnvError::internal("blocked task scheduler already started"));
        }
        let state = Arc::clone(&self.state);
        let handle = thread::Builder::new()
            .name("blocked_task_poller".to_string())
            .spawn(move || run_poller(state))
            .map_err(|e| EnvError::io("spawn blocked task poller", e))?;
        *poller = Some(handle);
        Ok(())
    }

    pub fn add_blocked(&self, task: BoxedTask) {
        let mut blocked = self.state.blocked.lock().unwrap_or_else(|e| e.into_inner());
        blocked.push_back(task);
        self.state.cv.notify_one();
    }

    pub fn blocked_count(&self) -> usize {
        self.state.blocked.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub(crate) fn shutdown(&self) {
        self.state.shutdown.store(true, Ordering::Release);
        self.state.cv.notify_all();
        let handle = self.poller.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn run_poller(state: Arc<BlockedState>) {
    debug!(
        "BlockedTaskScheduler started with poll_interval={:?}",
        state.poll_interval
    );
    while !state.shutdown.load(Ordering::Acquire) {
        let ready = {
            let mut blocked = state.blocked.lock().unwrap_or_else(|e| e.into_inner());
            let (ready, pending): (VecDeque<_>, VecDeque<_>) =
                std::mem::take(&mut *blocked).into_iter().partition(|task| task.is_ready());
            *blocked = pending;
            ready
        };
        for task in ready {
            state.queue.push(task);
        }
        let guard = state.cv_mutex.lock().unwrap_or_else(|e| e.into_inner());
        let _ = state
            .cv
            .wait_timeout(guard, state.poll_interval)
            .unwrap_or_else(|e| e.into_inner());
    }
}
