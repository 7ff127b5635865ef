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
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::common::status::{EnvError, Result};
use crate::novarocks_logging::info;
use crate::runtime::resource_scope::Subsystem;

const MINI_DOWNLOAD_DIR: &str = "mini_download";
const ERROR_LOG_DIR: &str = "error_log";

/// Load scratch space: `mini_download` under every store path plus one
/// `error_log` dir on the first store.
#[derive(Debug)]
pub struct LoadPathMgr {
    store_paths: Vec<String>,
    next_path: AtomicUsize,
}

impl LoadPathMgr {
    pub fn new(store_paths: Vec<String>) -> Self {
        Self {
            store_paths,
            next_path: AtomicUsize::new(0),
        }
    }

    pub fn init(&self) -> Result<()> {
        for store in &self.store_paths {
            create_dir(&Path::new(store).join(MINI_DOWNLOAD_DIR))?;
        }
        if let Some(dir) = self.error_log_dir() {
            create_dir(&dir)?;
        }
        info!("load path manager prepared {} store paths", self.store_paths.len());
        Ok(())
    }

    pub fn load_root_paths(&self) -> Vec<PathBuf> {
        self.store_paths
            .iter()
            .map(|store| Path::new(store).join(MINI_DOWNLOAD_DIR))
            .collect()
    }

    pub fn error_log_dir(&self) -> Option<PathBuf> {
        self.store_paths
            .first()
            .map(|store| Path::new(store).join(ERROR_LOG_DIR))
    }

    /// Create a per-label download dir, rotating over store paths.
    pub fn allocate_dir(&self, db: &str, label: &str) -> Result<PathBuf> {
        if self.store_paths.is_empty() {
            return Err(EnvError::subsystem("load_path_mgr", "no store paths configured"));
        }
        let idx = self.next_path.fetch_add(1, Ordering::AcqRel) % self.store_paths.len();
        let dir = Path::new(&self.store_paths[idx])
            .join(MINI_DOWNLOAD_DIR)
            .join(db)
            .join(label);
        create_dir(&dir)?;
        Ok(dir)
    }
}

impl Subsystem for LoadPathMgr {}

fn create_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .map_err(|e| EnvError::io(format!("create load dir {}", dir.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_mini_download_dirs() {
        let a = tempfile::tempdir().expect("tempdir");
        let b = tempfile::tempdir().expect("tempdir");
        let mgr = LoadPathMgr::new(vec![
            a.path().display().to_string(),
            b.path().display().to_string(),
        ]);
        mgr.init().expect("init");
        assert!(a.path().join("mini_download").is_dir());
        assert!(b.path().join("mini_download").is_dir());
        assert!(a.path().join("error_log").is_dir());

        let dir = mgr.allocate_dir("db1", "label_1").expect("allocate");
        assert!(dir.ends_with("mini_download/db1/label_1"));
        assert!(dir.is_dir());
    }

    #[test]
    fn unwritable_store_fails_init() {
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        let mgr = LoadPathMgr::new(vec![file.path().display().to_string()]);
        assert!(matches!(mgr.init(), Err(EnvError::Io { .. })));
    }
}
