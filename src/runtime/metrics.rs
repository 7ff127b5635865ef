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
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

use crate::common::status::{EnvError, Result};
use crate::novarocks_logging::debug;

type ReadFn = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Gauge whose value is read from a closure at scrape time.
#[derive(Clone)]
struct HookGauge {
    gauge: IntGauge,
    read: ReadFn,
}

impl Collector for HookGauge {
    fn desc(&self) -> Vec<&Desc> {
        self.gauge.desc()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.gauge.set((self.read)());
        self.gauge.collect()
    }
}

/// Environment-owned metric registry. Every hook is tracked by name so
/// teardown can deregister all of them before the backing pools go away.
pub struct MetricsRegistry {
    registry: Registry,
    registered: Mutex<BTreeMap<String, Box<dyn Collector>>>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            registered: Mutex::new(BTreeMap::new()),
        }
    }

    fn track(
        &self,
        name: &str,
        collector: Box<dyn Collector>,
        tracked: Box<dyn Collector>,
    ) -> Result<()> {
        let mut registered = self.registered.lock().unwrap_or_else(|e| e.into_inner());
        if registered.contains_key(name) {
            return Err(EnvError::internal(format!("metric {name} already registered")));
        }
        self.registry
            .register(collector)
            .map_err(|e| EnvError::internal(format!("register metric {name}: {e}")))?;
        registered.insert(name.to_string(), tracked);
        Ok(())
    }

    /// Register a gauge that reports `read()` on every scrape.
    pub fn register_hook<F>(&self, name: &str, help: &str, read: F) -> Result<()>
    where
        F: Fn() -> i64 + Send + Sync + 'static,
    {
        let gauge = IntGauge::new(name, help)
            .map_err(|e| EnvError::internal(format!("create metric {name}: {e}")))?;
        let hook = HookGauge {
            gauge,
            read: Arc::new(read),
        };
        self.track(name, Box::new(hook.clone()), Box::new(hook))
    }

    pub fn register_counter(&self, name: &str, help: &str) -> Result<IntCounter> {
        let counter = IntCounter::new(name, help)
            .map_err(|e| EnvError::internal(format!("create metric {name}: {e}")))?;
        self.track(name, Box::new(counter.clone()), Box::new(counter.clone()))?;
        Ok(counter)
    }

    pub fn deregister(&self, name: &str) -> bool {
        let mut registered = self.registered.lock().unwrap_or_else(|e| e.into_inner());
        match registered.remove(name) {
            Some(collector) => self.registry.unregister(collector).is_ok(),
            None => false,
        }
    }

    pub fn deregister_all(&self) {
        let mut registered = self.registered.lock().unwrap_or_else(|e| e.into_inner());
        let count = registered.len();
        for (name, collector) in std::mem::take(&mut *registered) {
            if let Err(e) = self.registry.unregister(collector) {
                debug!("deregister metric {name}: {e}");
            }
        }
        if count > 0 {
            debug!("deregistered {count} metrics");
        }
    }

    pub fn registered_names(&self) -> Vec<String> {
        let registered = self.registered.lock().unwrap_or_else(|e| e.into_inner());
        registered.keys().cloned().collect()
    }

    /// Prometheus text exposition of every registered metric.
    pub fn gather_text(&self) -> Result<String> {
        let families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&families, &mut buf)
            .map_err(|e| EnvError::internal(format!("encode metrics: {e}")))?;
        String::from_utf8(buf).map_err(|e| EnvError::internal(format!("encode metrics: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    #[test]
    fn hook_reads_live_value() {
        let metrics = MetricsRegistry::new();
        let depth = Arc::new(AtomicI64::new(3));
        let read = Arc::clone(&depth);
        metrics
            .register_hook("queue_depth", "queued tasks", move || read.load(Ordering::Relaxed))
            .expect("register");
        assert!(metrics.gather_text().expect("gather").contains("queue_depth 3"));
        depth.store(9, Ordering::Relaxed);
        assert!(metrics.gather_text().expect("gather").contains("queue_depth 9"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let metrics = MetricsRegistry::new();
        metrics.register_hook("dup", "first", || 1).expect("register");
        assert!(metrics.register_hook("dup", "second", || 2).is_err());
    }

    #[test]
    fn deregister_all_empties_exposition() {
        let metrics = MetricsRegistry::new();
        metrics.register_hook("a_gauge", "a", || 1).expect("register");
        let counter = metrics.register_counter("b_total", "b").expect("register");
        counter.inc();
        assert_eq!(metrics.registered_names(), vec!["a_gauge", "b_total"]);

        metrics.deregister_all();
        assert!(metrics.registered_names().is_empty());
        let text = metrics.gather_text().expect("gather");
        assert!(!text.contains("a_gauge"));
        assert!(!text.contains("b_total"));
        // Re-registration after teardown is allowed.
        metrics.register_hook("a_gauge", "a", || 2).expect("register again");
    }

    #[test]
    fn single_deregister() {
        let metrics = MetricsRegistry::new();
        metrics.register_hook("one", "one", || 1).expect("register");
        assert!(metrics.deregister("one"));
        assert!(!metrics.deregister("one"));
    }
}
