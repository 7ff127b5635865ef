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
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use bytes::Bytes;

use crate::runtime::resource_scope::Subsystem;

const MB: usize = 1024 * 1024;

struct ResultNode {
    value: Bytes,
    tick: u64,
}

#[derive(Default)]
struct ResultCacheInner {
    nodes: HashMap<String, ResultNode>,
    order: BTreeMap<u64, String>,
    next_tick: u64,
    total_size: usize,
}

/// Query result cache keyed by normalized SQL.
///
/// The cache may overshoot `max_size` by up to `elasticity_size`; once it does
/// it is pruned back down to `max_size` in LRU order.
pub struct ResultCache {
    max_size: usize,
    elasticity_size: usize,
    inner: Mutex<ResultCacheInner>,
}

impl ResultCache {
    pub fn new(max_size_mb: usize, elasticity_size_mb: usize) -> Self {
        Self {
            max_size: max_size_mb.saturating_mul(MB),
            elasticity_size: elasticity_size_mb.saturating_mul(MB),
            inner: Mutex::new(ResultCacheInner::default()),
        }
    }

    #[cfg(test)]
    fn with_bytes(max_size: usize, elasticity_size: usize) -> Self {
        Self {
            max_size,
            elasticity_size,
            inner: Mutex::new(ResultCacheInner::default()),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn elasticity_size(&self) -> usize {
        self.elasticity_size
    }

    pub fn update(&self, key: impl Into<String>, value: Bytes) {
        let key = key.into();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = inner.nodes.remove(&key) {
            inner.order.remove(&old.tick);
            inner.total_size -= old.value.len();
        }
        inner.next_tick += 1;
        let tick = inner.next_tick;
        inner.total_size += value.len();
        inner.order.insert(tick, key.clone());
        inner.nodes.insert(key, ResultNode { value, tick });
        if inner.total_size > self.max_size + self.elasticity_size {
            self.prune(&mut inner);
        }
    }

    pub fn fetch(&self, key: &str) -> Option<Bytes> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.next_tick += 1;
        let tick = inner.next_tick;
        let old_tick = {
            let node = inner.nodes.get_mut(key)?;
            std::mem::replace(&mut node.tick, tick)
        };
        inner.order.remove(&old_tick);
        inner.order.insert(tick, key.to_string());
        inner.nodes.get(key).map(|node| node.value.clone())
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *inner = ResultCacheInner::default();
    }

    pub fn total_size(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).total_size
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn prune(&self, inner: &mut ResultCacheInner) {
        while inner.total_size > self.max_size {
            let Some((_, key)) = inner.order.pop_first() else {
                break;
            };
            if let Some(node) = inner.nodes.remove(&key) {
                inner.total_size -= node.value.len();
            }
        }
    }
}

impl Subsystem for ResultCache {
    fn shutdown(&self) {
        self.clear();
    }
}
