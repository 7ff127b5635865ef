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
use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::novarocks_logging::{debug, warn};
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::resource_scope::Subsystem;

static HOOK_ACTIVE: AtomicBool = AtomicBool::new(false);
static HOOKED_ALLOCATED: AtomicI64 = AtomicI64::new(0);
static HOOKED_FREED: AtomicI64 = AtomicI64::new(0);

/// Whether the allocation hook may be installed in this process.
///
/// Build facts come from `build.rs`; only `user_enabled` varies at runtime.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AllocHookCapability {
    pub sanitizer_build: bool,
    pub alternate_allocator: bool,
    pub user_enabled: bool,
}

impl AllocHookCapability {
    pub fn detect(user_enabled: bool) -> Self {
        Self {
            sanitizer_build: !env!("NOVAROCKS_BUILD_SANITIZE").is_empty(),
            alternate_allocator: env!("NOVAROCKS_BUILD_JEMALLOC") == "true",
            user_enabled,
        }
    }

    pub fn should_install(&self) -> bool {
        self.user_enabled && !self.sanitizer_build && !self.alternate_allocator
    }
}

/// `GlobalAlloc` wrapper that counts bytes while a hook is installed.
pub struct TrackingAllocator<A = System> {
    inner: A,
}

impl<A> TrackingAllocator<A> {
    pub const fn new(inner: A) -> Self {
        Self { inner }
    }
}

#[inline]
fn record_alloc(size: usize) {
    if HOOK_ACTIVE.load(Ordering::Relaxed) {
        HOOKED_ALLOCATED.fetch_add(size as i64, Ordering::Relaxed);
    }
}

#[inline]
fn record_free(size: usize) {
    if HOOK_ACTIVE.load(Ordering::Relaxed) {
        HOOKED_FREED.fetch_add(size as i64, Ordering::Relaxed);
    }
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for TrackingAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.inner.alloc(layout) };
        if !ptr.is_null() {
            record_alloc(layout.size());
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.inner.alloc_zeroed(layout) };
        if !ptr.is_null() {
            record_alloc(layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { self.inner.dealloc(ptr, layout) };
        record_free(layout.size());
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = unsafe { self.inner.realloc(ptr, layout, new_size) };
        if !new_ptr.is_null() {
            record_free(layout.size());
            record_alloc(new_size);
        }
        new_ptr
    }
}

fn net_hooked_bytes() -> i64 {
    HOOKED_ALLOCATED.load(Ordering::Relaxed) - HOOKED_FREED.load(Ordering::Relaxed)
}

const SYNC_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct HookState {
    tracker: Arc<MemTracker>,
    // Held across the counter read so syncs apply in order.
    synced: Mutex<i64>,
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl HookState {
    fn sync(&self) {
        let mut synced = self.synced.lock().unwrap_or_else(|e| e.into_inner());
        let net = net_hooked_bytes();
        let delta = net - std::mem::replace(&mut *synced, net);
        if delta > 0 {
            self.tracker.consume(delta);
        } else if delta < 0 {
            self.tracker.release(-delta);
        }
    }

    fn run_sync_loop(&self) {
        let mut stopped = self.stopped.lock().unwrap_or_else(|e| e.into_inner());
        while !*stopped {
            let (guard, _) = self
                .wake
                .wait_timeout(stopped, SYNC_INTERVAL)
                .unwrap_or_else(|e| e.into_inner());
            stopped = guard;
            if !*stopped {
                self.sync();
            }
        }
    }
}

/// Installed allocation hook. An `alloc_hook_sync` thread folds counted bytes
/// into the tracker every [`SYNC_INTERVAL`]; dropping the hook uninstalls it.
#[derive(Debug)]
pub struct AllocationHook {
    state: Arc<HookState>,
    active: AtomicBool,
    sync_thread: Mutex<Option<JoinHandle<()>>>,
}

impl AllocationHook {
    /// Returns `None` when a gate is closed, another hook is already active,
    /// or the sync thread cannot be spawned.
    pub fn install(capability: AllocHookCapability, tracker: Arc<MemTracker>) -> Option<Self> {
        if !capability.should_install() {
            debug!("allocation hook not installed: {:?}", capability);
            return None;
        }
        if HOOK_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("allocation hook already installed by another environment");
            return None;
        }
        HOOKED_ALLOCATED.store(0, Ordering::Relaxed);
        HOOKED_FREED.store(0, Ordering::Relaxed);

        let state = Arc::new(HookState {
            tracker,
            synced: Mutex::new(0),
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });
        let loop_state = Arc::clone(&state);
        let sync_thread = match thread::Builder::new()
            .name("alloc_hook_sync".to_string())
            .spawn(move || loop_state.run_sync_loop())
        {
            Ok(handle) => handle,
            Err(e) => {
                HOOK_ACTIVE.store(false, Ordering::Release);
                warn!("allocation hook not installed: spawn sync thread failed: {e}");
                return None;
            }
        };
        debug!(
            "allocation hook installed, accounting into {}",
            state.tracker.label()
        );
        Some(Self {
            state,
            active: AtomicBool::new(true),
            sync_thread: Mutex::new(Some(sync_thread)),
        })
    }

    pub fn is_installed() -> bool {
        HOOK_ACTIVE.load(Ordering::Acquire)
    }

    /// Net bytes seen by the allocator since installation.
    pub fn net_bytes(&self) -> i64 {
        net_hooked_bytes()
    }

    /// Push the change since the previous sync into the tracker now.
    pub fn sync(&self) {
        self.state.sync();
    }

    pub fn tracker(&self) -> &Arc<MemTracker> {
        &self.state.tracker
    }

    /// Stop counting. Bytes seen so far stay charged to the tracker.
    pub fn uninstall(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        *self.state.stopped.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.state.wake.notify_all();
        let handle = self
            .sync_thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            warn!("alloc_hook_sync thread panicked");
        }
        self.state.sync();
        HOOK_ACTIVE.store(false, Ordering::Release);
        debug!("allocation hook uninstalled");
    }
}

impl Subsystem for AllocationHook {
    fn shutdown(&self) {
        self.uninstall();
    }
}

impl Drop for AllocationHook {
    fn drop(&mut self) {
        self.uninstall();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mem_tracker::TrackerType;
    use std::time::Instant;

    // Only one hook can be installed per process.
    static INSTALL_LOCK: Mutex<()> = Mutex::new(());

    fn capability(
        sanitizer_build: bool,
        alternate_allocator: bool,
        user_enabled: bool,
    ) -> AllocHookCapability {
        AllocHookCapability {
            sanitizer_build,
            alternate_allocator,
            user_enabled,
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    #[test]
    fn every_gate_must_be_open() {
        assert!(capability(false, false, true).should_install());
        assert!(!capability(true, false, true).should_install());
        assert!(!capability(false, true, true).should_install());
        assert!(!capability(false, false, false).should_install());
    }

    #[test]
    fn disabled_flag_skips_installation() {
        let tracker = MemTracker::new_root(TrackerType::Global, "orphan");
        let hook = AllocationHook::install(AllocHookCapability::detect(false), tracker);
        assert!(hook.is_none());
    }

    #[test]
    fn detect_reflects_build_facts() {
        let cap = AllocHookCapability::detect(true);
        assert!(cap.user_enabled);
        assert_eq!(cap.alternate_allocator, cfg!(feature = "jemalloc"));
    }

    #[test]
    fn sync_moves_counted_bytes_into_tracker() {
        let _guard = INSTALL_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        // The test binary does not use TrackingAllocator, so drive the
        // counters directly.
        let tracker = MemTracker::new_root(TrackerType::Global, "orphan");
        let hook = AllocationHook::install(capability(false, false, true), Arc::clone(&tracker))
            .expect("install");
        assert!(AllocationHook::install(capability(false, false, true), Arc::clone(&tracker))
            .is_none());
        record_alloc(4096);
        record_free(1024);
        hook.sync();
        assert_eq!(tracker.current(), 3072);
        hook.uninstall();
        assert!(!AllocationHook::is_installed());
        record_alloc(4096);
        drop(hook);
        assert_eq!(tracker.current(), 3072);
    }

    #[test]
    fn tracker_follows_hooked_bytes_while_installed() {
        let _guard = INSTALL_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let tracker = MemTracker::new_root(TrackerType::Global, "orphan");
        let hook = AllocationHook::install(capability(false, false, true), Arc::clone(&tracker))
            .expect("install");

        record_alloc(1 << 20);
        assert!(wait_for(
            || tracker.current() == 1 << 20,
            Duration::from_secs(5)
        ));
        assert_eq!(tracker.current(), hook.net_bytes());

        record_free(1 << 19);
        assert!(wait_for(
            || tracker.current() == 1 << 19,
            Duration::from_secs(5)
        ));
        assert!(AllocationHook::is_installed());

        hook.uninstall();
        assert_eq!(tracker.current(), 1 << 19);
    }
}
