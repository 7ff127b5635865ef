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
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::common::status::{EnvError, Result};
use crate::novarocks_logging::{debug, error, warn};
use crate::runtime::resource_scope::Subsystem;

type Task = Box<dyn FnOnce() + Send + 'static>;

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(500);

static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

/// Builds a bounded worker pool. Workers scale between `min_threads` and
/// `max_threads`; `max_queue_size` bounds tasks waiting for a worker.
#[derive(Clone, Debug)]
pub struct ThreadPoolBuilder {
    name: String,
    min_threads: usize,
    max_threads: usize,
    max_queue_size: usize,
    idle_timeout: Duration,
}

impl ThreadPoolBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            min_threads: 0,
            max_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            max_queue_size: usize::MAX,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn set_min_threads(mut self, min_threads: usize) -> Self {
        self.min_threads = min_threads;
        self
    }

    pub fn set_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    pub fn set_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    pub fn set_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn build(self) -> Result<Arc<ThreadPool>> {
        if self.max_threads == 0 {
            return Err(EnvError::invalid_config(
                "max_threads",
                format!("thread pool {} needs at least one thread", self.name),
            ));
        }
        if self.min_threads > self.max_threads {
            return Err(EnvError::invalid_config(
                "min_threads",
                format!(
                    "thread pool {}: min_threads {} > max_threads {}",
                    self.name, self.min_threads, self.max_threads
                ),
            ));
        }

        let inner = Arc::new(PoolInner {
            name: self.name,
            min_threads: self.min_threads,
            max_threads: self.max_threads,
            max_queue_size: self.max_queue_size,
            idle_timeout: self.idle_timeout,
            state: Mutex::new(PoolState::default()),
            cv: Condvar::new(),
            workers: Mutex::new(Vec::new()),
            next_worker_id: AtomicUsize::new(0),
        });
        for _ in 0..inner.min_threads {
            inner.lock_state().num_threads += 1;
            if let Err(e) = PoolInner::spawn_worker(&inner) {
                inner.lock_state().num_threads -= 1;
                inner.shutdown();
                return Err(e);
            }
        }
        debug!(
            pool = %inner.name,
            min_threads = inner.min_threads,
            max_threads = inner.max_threads,
            max_queue_size = inner.max_queue_size,
            "thread pool built"
        );
        Ok(Arc::new(ThreadPool { inner }))
    }
}

#[derive(Default)]
struct PoolState {
    queue: VecDeque<Task>,
    num_threads: usize,
    idle_threads: usize,
    shutdown: bool,
}

struct PoolInner {
    name: String,
    min_threads: usize,
    max_threads: usize,
    max_queue_size: usize,
    idle_timeout: Duration,
    state: Mutex<PoolState>,
    cv: Condvar,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    next_worker_id: AtomicUsize,
}

impl PoolInner {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // Caller has already counted the new worker in `num_threads`.
    fn spawn_worker(this: &Arc<PoolInner>) -> Result<()> {
        let id = this.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(this);
        let handle = thread::Builder::new()
            .name(format!("{}-{}", this.name, id))
            .spawn(move || worker_loop(inner))
            .map_err(|e| EnvError::io(format!("spawn worker for thread pool {}", this.name), e))?;
        let mut workers = this.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.retain(|h| !h.is_finished());
        workers.push(handle);
        Ok(())
    }

    fn submit(this: &Arc<PoolInner>, task: Task) -> Result<()> {
        let mut state = this.lock_state();
        if state.shutdown {
            return Err(EnvError::ServiceUnavailable(format!(
                "thread pool {} is shut down",
                this.name
            )));
        }
        if state.queue.len() >= this.max_queue_size {
            return Err(EnvError::ServiceUnavailable(format!(
                "thread pool {} queue is full ({})",
                this.name, this.max_queue_size
            )));
        }
        state.queue.push_back(task);
        let need_worker =
            state.queue.len() > state.idle_threads && state.num_threads < this.max_threads;
        if need_worker {
            state.num_threads += 1;
        }
        drop(state);
        this.cv.notify_one();

        if need_worker && let Err(e) = PoolInner::spawn_worker(this) {
            let mut state = this.lock_state();
            state.num_threads -= 1;
            if state.num_threads == 0 {
                state.queue.pop_back();
                return Err(e);
            }
            warn!(pool = %this.name, error = %e, "failed to grow thread pool");
        }
        Ok(())
    }

    fn shutdown(&self) {
        {
            let mut state = self.lock_state();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.queue.clear();
        }
        self.cv.notify_all();

        let handles = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!(pool = %self.name, "thread pool worker panicked");
            }
        }
    }
}

fn worker_loop(inner: Arc<PoolInner>) {
    let mut state = inner.lock_state();
    loop {
        if state.shutdown {
            break;
        }
        if let Some(task) = state.queue.pop_front() {
            drop(state);
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                error!(pool = %inner.name, "task panicked in thread pool");
            }
            state = inner.lock_state();
            continue;
        }

        state.idle_threads += 1;
        let (guard, wait) = inner
            .cv
            .wait_timeout(state, inner.idle_timeout)
            .unwrap_or_else(|e| e.into_inner());
        state = guard;
        state.idle_threads -= 1;
        if wait.timed_out() && state.queue.is_empty() && state.num_threads > inner.min_threads {
            break;
        }
    }
    state.num_threads -= 1;
}

/// Worker pool with live observability reads.
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl ThreadPool {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn min_threads(&self) -> usize {
        self.inner.min_threads
    }

    pub fn max_threads(&self) -> usize {
        self.inner.max_threads
    }

    pub fn max_queue_size(&self) -> usize {
        self.inner.max_queue_size
    }

    /// Submit a task, or fail with `ServiceUnavailable` when the queue is full.
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        PoolInner::submit(&self.inner, Box::new(task))
    }

    /// Live worker threads, idle ones included.
    pub fn thread_count(&self) -> usize {
        self.inner.lock_state().num_threads
    }

    /// Tasks waiting for a worker.
    pub fn queue_depth(&self) -> usize {
        self.inner.lock_state().queue.len()
    }

    pub fn new_token(&self, mode: ExecutionMode) -> ThreadPoolToken {
        ThreadPoolToken {
            id: TokenId(NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed)),
            mode,
            pool: Arc::clone(&self.inner),
            state: Arc::new(Mutex::new(TokenState::default())),
        }
    }

    /// Drop queued tasks, stop and join every worker. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl Subsystem for ThreadPool {
    fn shutdown(&self) {
        ThreadPool::shutdown(self);
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExecutionMode {
    Serial,
    Concurrent,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct TokenId(u64);

#[derive(Default)]
struct TokenState {
    pending: VecDeque<Task>,
    running: bool,
    shutdown: bool,
}

/// Submission handle onto a pool. Serial tokens run their tasks one at a time
/// in submission order.
pub struct ThreadPoolToken {
    id: TokenId,
    mode: ExecutionMode,
    pool: Arc<PoolInner>,
    state: Arc<Mutex<TokenState>>,
}

impl ThreadPoolToken {
    pub fn id(&self) -> TokenId {
        self.id
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.mode == ExecutionMode::Concurrent {
            return PoolInner::submit(&self.pool, Box::new(task));
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.shutdown {
            return Err(EnvError::ServiceUnavailable(format!(
                "token {:?} of thread pool {} is shut down",
                self.id, self.pool.name
            )));
        }
        if state.pending.len() >= self.pool.max_queue_size {
            return Err(EnvError::ServiceUnavailable(format!(
                "token {:?} of thread pool {} queue is full",
                self.id, self.pool.name
            )));
        }
        state.pending.push_back(Box::new(task));
        if state.running {
            return Ok(());
        }
        state.running = true;
        drop(state);

        let token_state = Arc::clone(&self.state);
        let drain = Box::new(move || drain_serial(token_state));
        if let Err(e) = PoolInner::submit(&self.pool, drain) {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.running = false;
            state.pending.pop_back();
            return Err(e);
        }
        Ok(())
    }

    /// Number of tasks accepted by this token but not yet started.
    pub fn pending(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).pending.len()
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.shutdown = true;
        state.pending.clear();
    }
}

fn drain_serial(state: Arc<Mutex<TokenState>>) {
    loop {
        let task = {
            let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());
            match guard.pending.pop_front() {
                Some(task) => task,
                None => {
                    guard.running = false;
                    return;
                }
            }
        };
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!("serial token task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;
    use std::time::Instant;

    fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn builder_rejects_inverted_bounds() {
        let err = ThreadPoolBuilder::new("bad")
            .set_min_threads(4)
            .set_max_threads(2)
            .build()
            .err()
            .expect("min > max must fail");
        assert!(matches!(err, EnvError::InvalidConfig { name: "min_threads", .. }));

        let err = ThreadPoolBuilder::new("empty")
            .set_max_threads(0)
            .build()
            .err()
            .expect("zero threads must fail");
        assert!(matches!(err, EnvError::InvalidConfig { name: "max_threads", .. }));
    }

    #[test]
    fn fixed_pool_starts_min_threads() {
        let pool = ThreadPoolBuilder::new("fixed")
            .set_min_threads(3)
            .set_max_threads(3)
            .set_max_queue_size(8)
            .build()
            .expect("build pool");
        assert_eq!(pool.thread_count(), 3);
        assert_eq!(pool.queue_depth(), 0);
    }

    #[test]
    fn queue_depth_is_bounded() {
        let pool = ThreadPoolBuilder::new("bounded")
            .set_min_threads(1)
            .set_max_threads(1)
            .set_max_queue_size(1)
            .build()
            .expect("build pool");
        let (release_tx, release_rx) = mpsc::channel::<()>();
        pool.submit(move || {
            let _ = release_rx.recv();
        })
        .expect("first task");
        assert!(wait_for(|| pool.queue_depth() == 0, Duration::from_secs(2)));

        pool.submit(|| {}).expect("second task queues");
        assert_eq!(pool.queue_depth(), 1);
        let err = pool.submit(|| {}).expect_err("third task rejected");
        assert!(matches!(err, EnvError::ServiceUnavailable(_)));

        release_tx.send(()).expect("release worker");
        assert!(wait_for(|| pool.queue_depth() == 0, Duration::from_secs(2)));
    }

    #[test]
    fn elastic_pool_scales_to_max_and_retires_idle_workers() {
        let pool = ThreadPoolBuilder::new("elastic")
            .set_min_threads(1)
            .set_max_threads(3)
            .set_max_queue_size(16)
            .set_idle_timeout(Duration::from_millis(50))
            .build()
            .expect("build pool");
        assert_eq!(pool.thread_count(), 1);

        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));
        for _ in 0..5 {
            let rx = Arc::clone(&release_rx);
            pool.submit(move || {
                let _ = rx.lock().unwrap().recv();
            })
            .expect("submit");
        }
        assert!(wait_for(|| pool.thread_count() == 3, Duration::from_secs(2)));
        assert!(pool.thread_count() <= 3);

        for _ in 0..5 {
            release_tx.send(()).expect("release");
        }
        assert!(wait_for(
            || pool.thread_count() == 1 && pool.queue_depth() == 0,
            Duration::from_secs(5)
        ));
    }

    #[test]
    fn serial_token_runs_in_order_without_overlap() {
        let pool = ThreadPoolBuilder::new("serial")
            .set_min_threads(1)
            .set_max_threads(4)
            .set_max_queue_size(128)
            .build()
            .expect("build pool");
        let token = pool.new_token(ExecutionMode::Serial);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let busy = Arc::new(AtomicBool::new(false));
        for i in 0..50 {
            let seen = Arc::clone(&seen);
            let busy = Arc::clone(&busy);
            token
                .submit(move || {
                    assert!(!busy.swap(true, Ordering::AcqRel));
                    seen.lock().unwrap().push(i);
                    busy.store(false, Ordering::Release);
                })
                .expect("submit to token");
        }
        assert!(wait_for(
            || seen.lock().unwrap().len() == 50,
            Duration::from_secs(5)
        ));
        let seen = seen.lock().unwrap();
        assert_eq!(*seen, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn tokens_have_distinct_ids() {
        let pool = ThreadPoolBuilder::new("ids")
            .set_max_threads(1)
            .build()
            .expect("build pool");
        let a = pool.new_token(ExecutionMode::Serial);
        let b = pool.new_token(ExecutionMode::Concurrent);
        assert_ne!(a.id(), b.id());
        assert_eq!(b.mode(), ExecutionMode::Concurrent);
    }

    #[test]
    fn shutdown_rejects_new_work_and_joins_workers() {
        let pool = ThreadPoolBuilder::new("closing")
            .set_min_threads(2)
            .set_max_threads(2)
            .build()
            .expect("build pool");
        pool.shutdown();
        assert_eq!(pool.thread_count(), 0);
        assert!(matches!(
            pool.submit(|| {}),
            Err(EnvError::ServiceUnavailable(_))
        ));
        pool.shutdown();
    }
}
