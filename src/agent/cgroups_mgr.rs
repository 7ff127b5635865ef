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
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::common::status::{EnvError, Result};
use crate::novarocks_logging::{info, warn};
use crate::runtime::resource_scope::Subsystem;

const CPU_SHARES_FILE: &str = "cpu.shares";
const TASKS_FILE: &str = "tasks";

/// Resource isolation through a pre-created cgroup hierarchy.
#[derive(Debug)]
pub struct CgroupsMgr {
    root_path: String,
    active_path: OnceLock<PathBuf>,
}

impl CgroupsMgr {
    pub fn new(root_path: impl Into<String>) -> Self {
        Self {
            root_path: root_path.into(),
            active_path: OnceLock::new(),
        }
    }

    /// Probe the configured cgroup. An empty or missing path disables cgroups
    /// without failing startup.
    pub fn init_cgroups(&self) -> Result<()> {
        if self.root_path.trim().is_empty() {
            info!("cgroups disabled: no cgroup path configured");
            return Ok(());
        }
        let root = Path::new(&self.root_path);
        if !root.is_dir() {
            warn!("cgroup path {} does not exist, cgroups disabled", root.display());
            return Ok(());
        }
        if !root.join(TASKS_FILE).exists() {
            warn!("{} is not a cgroup directory, cgroups disabled", root.display());
            return Ok(());
        }
        let _ = self.active_path.set(root.to_path_buf());
        info!("cgroups enabled at {}", root.display());
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.active_path.get().is_some()
    }

    /// Move a thread into the backend cgroup.
    pub fn assign_thread(&self, tid: i64) -> Result<()> {
        let Some(root) = self.active_path.get() else {
            return Ok(());
        };
        let tasks = root.join(TASKS_FILE);
        std::fs::write(&tasks, format!("{tid}\n"))
            .map_err(|e| EnvError::io(format!("write {}", tasks.display()), e))
    }

    pub fn cpu_shares(&self) -> Option<u64> {
        let root = self.active_path.get()?;
        std::fs::read_to_string(root.join(CPU_SHARES_FILE))
            .ok()?
            .trim()
            .parse()
            .ok()
    }
}

impl Subsystem for CgroupsMgr {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_path_is_a_no_op() {
        let mgr = CgroupsMgr::new("/definitely/not/a/cgroup");
        mgr.init_cgroups().expect("init");
        assert!(!mgr.is_enabled());
        mgr.assign_thread(1).expect("no-op");
        assert!(!CgroupsMgr::new("").is_enabled());
    }

    #[test]
    fn probes_fake_hierarchy() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("tasks"), "").expect("write");
        std::fs::write(dir.path().join("cpu.shares"), "1024\n").expect("write");
        let mgr = CgroupsMgr::new(dir.path().display().to_string());
        mgr.init_cgroups().expect("init");
        assert!(mgr.is_enabled());
        assert_eq!(mgr.cpu_shares(), Some(1024));
        mgr.assign_thread(42).expect("assign");
        assert_eq!(std::fs::read_to_string(dir.path().join("tasks")).expect("read"), "42\n");
    }
}
