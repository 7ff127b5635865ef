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
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use threadpool::ThreadPool;

use crate::common::status::{EnvError, Result};
use crate::common::types::UniqueId;
use crate::novarocks_logging::{debug, warn};
use crate::runtime::resource_scope::Subsystem;

/// Executes routine load tasks (periodic consumption from a message queue).
/// At most `capacity` tasks are accepted at once and a task id can only run
/// once at a time.
pub struct RoutineLoadTaskExecutor {
    capacity: usize,
    pool: Mutex<ThreadPool>,
    running: Arc<Mutex<HashSet<UniqueId>>>,
}

impl RoutineLoadTaskExecutor {
    pub fn new(num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        Self {
            // Queued tasks count against the limit too.
            capacity: num_threads * 2,
            pool: Mutex::new(ThreadPool::with_name(
                "routine_load".to_string(),
                num_threads,
            )),
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn submit_task<F>(&self, task_id: UniqueId, task: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        {
            let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            if running.contains(&task_id) {
                debug!("routine load task {task_id} is already running");
                return Ok(());
            }
            if running.len() >= self.capacity {
                return Err(EnvError::ServiceUnavailable(format!(
                    "routine load executor is full ({} tasks)",
                    self.capacity
                )));
            }
            running.insert(task_id);
        }
        let running = Arc::clone(&self.running);
        let pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        pool.execute(move || {
            if let Err(e) = task() {
                warn!("routine load task {task_id} failed: {e}");
            }
            running.lock().unwrap_or_else(|e| e.into_inner()).remove(&task_id);
        });
        Ok(())
    }

    pub fn running_tasks(&self) -> usize {
        self.running.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn join(&self) {
        self.pool.lock().unwrap_or_else(|e| e.into_inner()).join();
    }
}

impl Subsystem for RoutineLoadTaskExecutor {
    fn shutdown(&self) {
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn rejects_when_full_and_clears_on_completion() {
        let executor = RoutineLoadTaskExecutor::new(1);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));
        for lo in 0..2 {
            let rx = Arc::clone(&release_rx);
            executor
                .submit_task(UniqueId::new(0, lo), move || {
                    let _ = rx.lock().unwrap().recv_timeout(Duration::from_secs(5));
                    Ok(())
                })
                .expect("submit");
        }
        assert!(executor.submit_task(UniqueId::new(0, 9), || Ok(())).is_err());
        // A duplicate id is accepted as a no-op.
        executor.submit_task(UniqueId::new(0, 0), || Ok(())).expect("duplicate");

        release_tx.send(()).expect("send");
        release_tx.send(()).expect("send");
        executor.join();
        assert_eq!(executor.running_tasks(), 0);
    }
}
