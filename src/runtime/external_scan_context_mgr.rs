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
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::common::types::UniqueId;
use crate::runtime::resource_scope::Subsystem;

/// State for one external (connector-driven) scan session.
#[derive(Debug)]
pub struct ScanContext {
    context_id: String,
    created_at: Instant,
    last_access_ms: AtomicU64,
    fragment_instance_id: Mutex<Option<UniqueId>>,
}

impl ScanContext {
    fn new(context_id: String) -> Self {
        Self {
            context_id,
            created_at: Instant::now(),
            last_access_ms: AtomicU64::new(0),
            fragment_instance_id: Mutex::new(None),
        }
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn touch(&self) {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.last_access_ms.store(elapsed, Ordering::Relaxed);
    }

    pub fn bind_fragment(&self, id: UniqueId) {
        *self.fragment_instance_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(id);
    }

    pub fn fragment_instance_id(&self) -> Option<UniqueId> {
        *self.fragment_instance_id.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Registry of external scan contexts keyed by context id.
#[derive(Debug, Default)]
pub struct ExternalScanContextMgr {
    contexts: Mutex<HashMap<String, Arc<ScanContext>>>,
}

impl ExternalScanContextMgr {
    pub fn new() -> Self {
        Self::default()
    }

    fn contexts(&self) -> MutexGuard<'_, HashMap<String, Arc<ScanContext>>> {
        self.contexts.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn create_scan_context(&self) -> Arc<ScanContext> {
        let context = Arc::new(ScanContext::new(UniqueId::generate().to_string()));
        self.contexts()
            .insert(context.context_id().to_string(), Arc::clone(&context));
        context
    }

    pub fn get_scan_context(&self, context_id: &str) -> Option<Arc<ScanContext>> {
        let context = self.contexts().get(context_id).cloned()?;
        context.touch();
        Some(context)
    }

    pub fn clear_scan_context(&self, context_id: &str) -> bool {
        self.contexts().remove(context_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.contexts().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Subsystem for ExternalScanContextMgr {
    fn shutdown(&self) {
        self.contexts().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_get_clear() {
        let mgr = ExternalScanContextMgr::new();
        let ctx = mgr.create_scan_context();
        ctx.bind_fragment(UniqueId::new(1, 2));
        let found = mgr.get_scan_context(ctx.context_id()).expect("registered");
        assert_eq!(found.fragment_instance_id(), Some(UniqueId::new(1, 2)));
        assert!(mgr.clear_scan_context(ctx.context_id()));
        assert!(!mgr.clear_scan_context(ctx.context_id()));
        assert!(mgr.is_empty());
    }
}
