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
use std::cell::RefCell;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// What a tracker accounts for. `Global` trackers live for the whole process.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TrackerType {
    Global,
    Query,
    Load,
    Compaction,
    Other,
}

/// Holds bytes against a tracker until dropped.
#[derive(Debug)]
pub struct TrackedBytes {
    bytes: i64,
    tracker: Arc<MemTracker>,
}

impl TrackedBytes {
    pub fn new(bytes: usize, tracker: Arc<MemTracker>) -> Self {
        let bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
        tracker.consume(bytes);
        Self { bytes, tracker }
    }

    pub fn bytes(&self) -> i64 {
        self.bytes
    }
}

impl Drop for TrackedBytes {
    fn drop(&mut self) {
        self.tracker.release(self.bytes);
    }
}

/// Logical memory accounting for a component and its ancestors.
///
/// Only bytes explicitly reported by callers are recorded. A negative limit
/// means unlimited.
#[derive(Debug)]
pub struct MemTracker {
    tracker_type: TrackerType,
    label: String,
    limit: i64,
    parent: Option<Arc<MemTracker>>,
    current: AtomicI64,
    peak: AtomicI64,
    allocated: AtomicI64,
    deallocated: AtomicI64,
    children: Mutex<Vec<Weak<MemTracker>>>,
}

impl MemTracker {
    pub fn new_root(tracker_type: TrackerType, label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::build(tracker_type, label.into(), -1, None))
    }

    pub fn new_child(
        tracker_type: TrackerType,
        label: impl Into<String>,
        limit: i64,
        parent: &Arc<MemTracker>,
    ) -> Arc<Self> {
        let child = Arc::new(Self::build(
            tracker_type,
            label.into(),
            limit,
            Some(Arc::clone(parent)),
        ));
        parent
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::downgrade(&child));
        child
    }

    fn build(
        tracker_type: TrackerType,
        label: String,
        limit: i64,
        parent: Option<Arc<MemTracker>>,
    ) -> Self {
        Self {
            tracker_type,
            label,
            limit,
            parent,
            current: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            allocated: AtomicI64::new(0),
            deallocated: AtomicI64::new(0),
            children: Mutex::new(Vec::new()),
        }
    }

    pub fn tracker_type(&self) -> TrackerType {
        self.tracker_type
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    pub fn has_limit(&self) -> bool {
        self.limit >= 0
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }

    pub fn allocated(&self) -> i64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn deallocated(&self) -> i64 {
        self.deallocated.load(Ordering::Relaxed)
    }

    pub fn children(&self) -> Vec<Arc<MemTracker>> {
        let guard = self.children.lock().unwrap_or_else(|e| e.into_inner());
        guard.iter().filter_map(Weak::upgrade).collect()
    }

    /// True when this tracker or any ancestor is above its limit.
    pub fn any_limit_exceeded(&self) -> bool {
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            if current.has_limit() && current.current() > current.limit {
                return true;
            }
            tracker = current.parent.as_deref();
        }
        false
    }

    /// Increase consumption for this tracker and all ancestors.
    pub fn consume(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            let new_value = current.current.fetch_add(bytes, Ordering::AcqRel) + bytes;
            current.allocated.fetch_add(bytes, Ordering::AcqRel);
            current.update_peak(new_value);
            tracker = current.parent.as_deref();
        }
    }

    /// Decrease consumption for this tracker and all ancestors.
    pub fn release(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            current.current.fetch_sub(bytes, Ordering::AcqRel);
            current.deallocated.fetch_add(bytes, Ordering::AcqRel);
            tracker = current.parent.as_deref();
        }
    }

    fn update_peak(&self, value: i64) {
        let mut prev = self.peak.load(Ordering::Relaxed);
        while value > prev {
            match self
                .peak
                .compare_exchange(prev, value, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }
    }
}

thread_local! {
    static THREAD_MEM_TRACKER: RefCell<Option<Arc<MemTracker>>> = const { RefCell::new(None) };
}

/// Per-thread attribution of untracked allocations.
pub mod thread_mem_tracker {
    use super::*;

    /// Bind `tracker` to the calling thread, returning the previous binding.
    pub fn attach(tracker: Arc<MemTracker>) -> Option<Arc<MemTracker>> {
        THREAD_MEM_TRACKER.with(|slot| slot.borrow_mut().replace(tracker))
    }

    pub fn detach() -> Option<Arc<MemTracker>> {
        THREAD_MEM_TRACKER.with(|slot| slot.borrow_mut().take())
    }

    pub fn current() -> Option<Arc<MemTracker>> {
        THREAD_MEM_TRACKER.with(|slot| slot.borrow().clone())
    }

    /// Charge bytes to the thread's tracker. Returns false when none is bound.
    pub fn consume(bytes: i64) -> bool {
        THREAD_MEM_TRACKER.with(|slot| match slot.borrow().as_ref() {
            Some(tracker) => {
                tracker.consume(bytes);
                true
            }
            None => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumption_propagates_to_ancestors() {
        let root = MemTracker::new_root(TrackerType::Global, "Orphan");
        let child = MemTracker::new_child(TrackerType::Load, "load", 100, &root);
        child.consume(60);
        assert_eq!(root.current(), 60);
        assert!(!child.any_limit_exceeded());
        child.consume(50);
        assert!(child.any_limit_exceeded());
        child.release(110);
        assert_eq!(root.current(), 0);
        assert_eq!(root.peak(), 110);
        assert_eq!(root.allocated(), 110);
        assert_eq!(root.deallocated(), 110);
    }

    #[test]
    fn tracked_bytes_release_on_drop() {
        let root = MemTracker::new_root(TrackerType::Global, "root");
        {
            let _held = TrackedBytes::new(4096, Arc::clone(&root));
            assert_eq!(root.current(), 4096);
        }
        assert_eq!(root.current(), 0);
    }

    #[test]
    fn children_are_weak() {
        let root = MemTracker::new_root(TrackerType::Global, "root");
        let child = MemTracker::new_child(TrackerType::Query, "q", -1, &root);
        assert_eq!(root.children().len(), 1);
        drop(child);
        assert!(root.children().is_empty());
    }

    #[test]
    fn thread_binding_is_per_thread() {
        let orphan = MemTracker::new_root(TrackerType::Global, "Orphan");
        let previous = thread_mem_tracker::attach(Arc::clone(&orphan));
        assert!(thread_mem_tracker::consume(10));
        assert_eq!(orphan.current(), 10);

        let other = std::thread::spawn(|| thread_mem_tracker::current().is_none())
            .join()
            .expect("join");
        assert!(other);

        let detached = thread_mem_tracker::detach().expect("bound tracker");
        assert!(Arc::ptr_eq(&detached, &orphan));
        if let Some(previous) = previous {
            thread_mem_tracker::attach(previous);
        }
    }
}
