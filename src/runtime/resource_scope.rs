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
use std::sync::Arc;

use crate::novarocks_logging::{debug, warn};

/// A component owned by the execution environment.
///
/// `shutdown` stops background work; memory is reclaimed when the last
/// handle drops.
pub trait Subsystem: Send + Sync + 'static {
    fn shutdown(&self) {}
}

struct ScopeEntry {
    name: &'static str,
    handle: Arc<dyn Subsystem>,
}

/// Ownership record of everything the environment constructs.
///
/// Subsystems are adopted as they are built and released in reverse order,
/// so the release list can never drift from the construction list. Dropping a
/// scope releases whatever it still holds, which also covers an `init` that
/// failed halfway.
#[derive(Default)]
pub struct ResourceScope {
    entries: Vec<ScopeEntry>,
}

impl ResourceScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn adopt<T: Subsystem>(&mut self, name: &'static str, subsystem: T) -> Arc<T> {
        self.adopt_arc(name, Arc::new(subsystem))
    }

    pub fn adopt_arc<T: Subsystem>(&mut self, name: &'static str, subsystem: Arc<T>) -> Arc<T> {
        debug!("adopt subsystem {name}");
        self.entries.push(ScopeEntry {
            name,
            handle: subsystem.clone(),
        });
        subsystem
    }

    /// Names in construction order.
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|entry| entry.name).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Shut down and drop every subsystem, last adopted first.
    pub fn release(&mut self) {
        while let Some(entry) = self.entries.pop() {
            entry.handle.shutdown();
            let refs = Arc::strong_count(&entry.handle);
            if refs > 1 {
                warn!(
                    "subsystem {} still has {} outstanding handles at release",
                    entry.name,
                    refs - 1
                );
            }
            debug!("released subsystem {}", entry.name);
        }
    }
}

impl Drop for ResourceScope {
    fn drop(&mut self) {
        self.release();
    }
}
