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
use std::sync::{Mutex, MutexGuard};

use crate::common::status::{EnvError, Result};
use crate::novarocks_logging::{info, warn};
use crate::runtime::resource_scope::Subsystem;

const TMP_SUB_DIR: &str = "tmp";

/// Scratch directories (`<store>/tmp`) for operators that write temporary files.
#[derive(Debug)]
pub struct TmpFileMgr {
    store_paths: Vec<String>,
    tmp_dirs: Mutex<Vec<PathBuf>>,
    next_dir: AtomicUsize,
}

impl TmpFileMgr {
    pub fn new(store_paths: Vec<String>) -> Self {
        Self {
            store_paths,
            tmp_dirs: Mutex::new(Vec::new()),
            next_dir: AtomicUsize::new(0),
        }
    }

    fn dirs(&self) -> MutexGuard<'_, Vec<PathBuf>> {
        self.tmp_dirs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Recreate every tmp dir. Unusable store paths are skipped; at least one
    /// dir must survive.
    pub fn init(&self) -> Result<()> {
        let mut usable = Vec::with_capacity(self.store_paths.len());
        for store in &self.store_paths {
            let dir = Path::new(store).join(TMP_SUB_DIR);
            match reset_dir(&dir) {
                Ok(()) => usable.push(dir),
                Err(e) => warn!("skip tmp dir {}: {e}", dir.display()),
            }
        }
        if usable.is_empty() {
            return Err(EnvError::subsystem("tmp_file_mgr", "no usable tmp directories"));
        }
        info!("using {} tmp directories", usable.len());
        *self.dirs() = usable;
        Ok(())
    }

    pub fn tmp_dirs(&self) -> Vec<PathBuf> {
        self.dirs().clone()
    }

    /// Round-robin pick of a tmp dir, then a file name unique to `owner`.
    pub fn new_file_path(&self, owner: &str) -> Result<PathBuf> {
        let dirs = self.dirs();
        if dirs.is_empty() {
            return Err(EnvError::NotInitialized);
        }
        let idx = self.next_dir.fetch_add(1, Ordering::AcqRel);
        Ok(dirs[idx % dirs.len()].join(format!("{owner}_{idx}")))
    }
}

impl Subsystem for TmpFileMgr {}

fn reset_dir(dir: &Path) -> std::io::Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)?;
    }
    std::fs::create_dir_all(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_recreates_tmp_dirs() {
        let store = tempfile::tempdir().expect("tempdir");
        let stale = store.path().join("tmp").join("stale");
        std::fs::create_dir_all(&stale).expect("create stale");

        let mgr = TmpFileMgr::new(vec![store.path().display().to_string()]);
        mgr.init().expect("init");
        assert!(!stale.exists());
        assert_eq!(mgr.tmp_dirs(), vec![store.path().join("tmp")]);
        let first = mgr.new_file_path("q1").expect("path");
        let second = mgr.new_file_path("q1").expect("path");
        assert_ne!(first, second);
    }

    #[test]
    fn init_fails_without_usable_dirs() {
        let mgr = TmpFileMgr::new(Vec::new());
        assert!(mgr.init().is_err());
        assert!(matches!(mgr.new_file_path("q"), Err(EnvError::NotInitialized)));
    }
}
