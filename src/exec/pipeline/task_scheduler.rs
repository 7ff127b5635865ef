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
//! Pipeline task scheduler.
//!
//! Responsibilities:
//! - Runs pipeline tasks on a fixed set of named executor threads.
//! - Hands blocked tasks to the blocked task scheduler and requeues yielded ones.
//!
//! Key exported interfaces:
//! - Types: `TaskScheduler`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use super::blocked_task_scheduler::BlockedTaskScheduler;
use super::task_queue::{BoxedTask, TaskQueue, TaskState};
use crate::common::status::{EnvError, Result};
use crate::novarocks_logging::{error, info};
use crate::runtime::resource_scope::Subsystem;

pub struct TaskScheduler {
    queue: Arc<TaskQueue>,
    blocked: Arc<BlockedTaskScheduler>,
    started: AtomicBool,
    finished_tasks: Arc<AtomicU64>,
    executors: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl TaskScheduler {
    pub fn new(queue: Arc<TaskQueue>, blocked: Arc<BlockedTaskScheduler>) -> Self {
        Self {
            queue,
            blocked,
            started: AtomicBool::new(false),
            finished_tasks: Arc::new(AtomicU64::new(0)),
            executors: Mutex::new(Vec::new()),
        }
    }

    pub fn num_executors(&self) -> usize {
        self.queue.num_queues()
    }

    /// Starts the blocked task poller and one thread per sub-queue.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(EnvError::internal("pipeline task scheduler already started"));
        }
        self.blocked.start()?;
        let mut executors = self.executors.lock().unwrap_or_else(|e| e.into_inner());
        for idx in 0..self.queue.num_queues() {
            let queue = Arc::clone(&self.queue);
            let blocked = Arc::clone(&self.blocked);
            let finished = Arc::clone(&self.finished_tasks);
            let handle = thread::Builder::new()
                .name(format!("pip_exec_{idx}"))
                .spawn(move || executor_loop(idx, queue, blocked, finished))
                .map_err(|e| EnvError::io("spawn pipeline executor", e))?;
            executors.push(handle);
        }
        info!("pipeline task scheduler started with {} executors", executors.len());
        Ok(())
    }

    pub fn submit(&self, task: BoxedTask) -> Result<()> {
        if self.queue.is_closed() {
            return Err(EnvError::ServiceUnavailable(
                "pipeline task scheduler is shut down".to_string(),
            ));
        }
        self.queue.push(task);
        Ok(())
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn blocked_scheduler(&self) -> &Arc<BlockedTaskScheduler> {
        &self.blocked
    }

    pub fn finished_tasks(&self) -> u64 {
        self.finished_tasks.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        self.queue.close();
        self.blocked.shutdown();
        let handles = std::mem::take(
            &mut *self.executors.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Subsystem for TaskScheduler {
    fn shutdown(&self) {
        TaskScheduler::shutdown(self);
    }
}

fn executor_loop(
    idx: usize,
    queue: Arc<TaskQueue>,
    blocked: Arc<BlockedTaskScheduler>,
    finished: Arc<AtomicU64>,
) {
    while let Some(mut task) = queue.take(idx) {
        let state = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task.execute()))
            .unwrap_or_else(|_| {
                error!("pipeline task {} panicked", task.name());
                TaskState::Finished
            });
        match state {
            TaskState::Finished => {
                finished.fetch_add(1, Ordering::AcqRel);
            }
            TaskState::Yield => queue.push_to(idx, task),
            TaskState::Blocked => blocked.add_blocked(task),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::pipeline::task_queue::PipelineTask;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    struct CountdownTask {
        slices: usize,
        blocked_once: bool,
        gate: Arc<AtomicBool>,
    }

    impl PipelineTask for CountdownTask {
        fn name(&self) -> &str {
            "countdown"
        }

        fn execute(&mut self) -> TaskState {
            if !self.blocked_once {
                self.blocked_once = true;
                return TaskState::Blocked;
            }
            if self.slices == 0 {
                return TaskState::Finished;
            }
            self.slices -= 1;
            TaskState::Yield
        }

        fn is_ready(&self) -> bool {
            self.gate.load(Ordering::Acquire)
        }
    }

    fn scheduler(executors: usize) -> TaskScheduler {
        let queue = Arc::new(TaskQueue::new(executors));
        let blocked = Arc::new(BlockedTaskScheduler::new(Arc::clone(&queue)));
        TaskScheduler::new(queue, blocked)
    }

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn starting_twice_fails() {
        let sched = scheduler(1);
        sched.start().expect("start");
        assert!(sched.start().is_err());
        sched.shutdown();
    }

    #[test]
    fn blocked_tasks_resume_when_ready() {
        let sched = scheduler(2);
        sched.start().expect("start");
        let gate = Arc::new(AtomicBool::new(false));
        for _ in 0..4 {
            sched
                .submit(Box::new(CountdownTask {
                    slices: 3,
                    blocked_once: false,
                    gate: Arc::clone(&gate),
                }))
                .expect("submit");
        }
        assert!(wait_for(|| sched.blocked_scheduler().blocked_count() == 4));
        assert_eq!(sched.finished_tasks(), 0);

        gate.store(true, Ordering::Release);
        assert!(wait_for(|| sched.finished_tasks() == 4));
        sched.shutdown();
        assert!(sched.submit(Box::new(CountdownTask {
            slices: 0,
            blocked_once: true,
            gate,
        }))
        .is_err());
    }

    #[test]
    fn panicking_task_does_not_kill_executor() {
        struct Panicky(Arc<AtomicUsize>);
        impl PipelineTask for Panicky {
            fn name(&self) -> &str {
                "panicky"
            }
            fn execute(&mut self) -> TaskState {
                if self.0.fetch_add(1, Ordering::AcqRel) == 0 {
                    panic!("boom");
                }
                TaskState::Finished
            }
        }
        let sched = scheduler(1);
        sched.start().expect("start");
        let runs = Arc::new(AtomicUsize::new(0));
        sched.submit(Box::new(Panicky(Arc::clone(&runs)))).expect("submit");
        sched.submit(Box::new(Panicky(Arc::clone(&runs)))).expect("submit");
        assert!(wait_for(|| sched.finished_tasks() == 2));
        sched.shutdown();
    }
}
