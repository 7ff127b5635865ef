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
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::common::app_config::ThreadPoolConfig;
use crate::common::status::{EnvError, Result};
use crate::novarocks_logging::info;
use crate::runtime::resource_scope::Subsystem;
use crate::runtime::thread_pool::{ThreadPool, ThreadPoolBuilder};

/// Which pool a scan task belongs on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScanKind {
    Local,
    Remote,
}

struct ScanPools {
    local: Arc<ThreadPool>,
    remote: Arc<ThreadPool>,
}

/// Runs scanner tasks. Local scans and remote (external table) scans use
/// separate pools so slow remote reads cannot starve local ones.
pub struct ScannerScheduler {
    config: ThreadPoolConfig,
    pools: OnceLock<ScanPools>,
}

impl ScannerScheduler {
    pub fn new(config: ThreadPoolConfig) -> Self {
        Self {
            config,
            pools: OnceLock::new(),
        }
    }

    pub fn init(&self) -> Result<()> {
        if self.pools.get().is_some() {
            return Ok(());
        }
        let idle = Duration::from_millis(self.config.idle_timeout_ms);
        let local = ThreadPoolBuilder::new("local_scan")
            .set_min_threads(self.config.scanner_thread_pool_thread_num)
            .set_max_threads(self.config.scanner_thread_pool_thread_num)
            .set_max_queue_size(self.config.scanner_thread_pool_queue_size)
            .set_idle_timeout(idle)
            .build()?;
        let remote = ThreadPoolBuilder::new("remote_scan")
            .set_min_threads(1)
            .set_max_threads(self.config.remote_scanner_thread_pool_thread_num)
            .set_max_queue_size(self.config.scanner_thread_pool_queue_size)
            .set_idle_timeout(idle)
            .build()?;
        info!(
            "scanner scheduler initialized: local_threads={} remote_threads={} queue={}",
            local.max_threads(),
            remote.max_threads(),
            self.config.scanner_thread_pool_queue_size
        );
        let _ = self.pools.set(ScanPools { local, remote });
        Ok(())
    }

    fn pools(&self) -> Result<&ScanPools> {
        self.pools.get().ok_or(EnvError::NotInitialized)
    }

    pub fn submit<F>(&self, kind: ScanKind, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let pools = self.pools()?;
        match kind {
            ScanKind::Local => pools.local.submit(task),
            ScanKind::Remote => pools.remote.submit(task),
        }
    }

    /// Pending local scan tasks; 0 before `init`.
    pub fn queue_depth(&self) -> usize {
        self.pools.get().map_or(0, |pools| pools.local.queue_depth())
    }

    pub fn remote_queue_depth(&self) -> usize {
        self.pools.get().map_or(0, |pools| pools.remote.queue_depth())
    }
}

impl Subsystem for ScannerScheduler {
    fn shutdown(&self) {
        if let Some(pools) = self.pools.get() {
            pools.local.shutdown();
            pools.remote.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn config() -> ThreadPoolConfig {
        ThreadPoolConfig {
            scanner_thread_pool_thread_num: 2,
            scanner_thread_pool_queue_size: 8,
            remote_scanner_thread_pool_thread_num: 2,
            ..ThreadPoolConfig::default()
        }
    }

    #[test]
    fn submit_requires_init() {
        let sched = ScannerScheduler::new(config());
        assert!(matches!(
            sched.submit(ScanKind::Local, || {}),
            Err(EnvError::NotInitialized)
        ));
        assert_eq!(sched.queue_depth(), 0);
    }

    #[test]
    fn runs_local_and_remote_scans() {
        let sched = ScannerScheduler::new(config());
        sched.init().expect("init");
        let (tx, rx) = mpsc::channel();
        for kind in [ScanKind::Local, ScanKind::Remote] {
            let tx = tx.clone();
            sched.submit(kind, move || tx.send(kind).expect("send")).expect("submit");
        }
        let mut seen = vec![
            rx.recv_timeout(Duration::from_secs(5)).expect("recv"),
            rx.recv_timeout(Duration::from_secs(5)).expect("recv"),
        ];
        seen.sort_by_key(|k| *k == ScanKind::Remote);
        assert_eq!(seen, vec![ScanKind::Local, ScanKind::Remote]);
        Subsystem::shutdown(&sched);
    }
}
