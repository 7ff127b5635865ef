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
use crate::novarocks_logging::{info, warn};
use crate::runtime::resource_scope::Subsystem;

const SPILL_DIR: &str = "spill";
const SPILL_GC_DIR: &str = "spill_gc";

/// Spill placement across store paths. Each store gets `<store>/spill` for live
/// blocks and `<store>/spill_gc` for data left over by a previous process.
#[derive(Debug)]
pub struct BlockSpillManager {
    store_paths: Vec<String>,
    next_dir: AtomicUsize,
}

impl BlockSpillManager {
    pub fn new(store_paths: Vec<String>) -> Self {
        Self {
            store_paths,
            next_dir: AtomicUsize::new(0),
        }
    }

    pub fn init(&self) -> Result<()> {
        let mut moved = 0usize;
        for store in &self.store_paths {
            let store = Path::new(store);
            let spill = store.join(SPILL_DIR);
            let gc = store.join(SPILL_GC_DIR);
            ensure_dir(&gc)?;
            if spill.exists() {
                moved += move_children(&spill, &gc)?;
            }
            ensure_dir(&spill)?;
        }
        if moved > 0 {
            info!("moved {moved} stale spill entries to gc");
        }
        self.gc();
        Ok(())
    }

    /// Remove everything parked under the gc dirs.
    pub fn gc(&self) -> usize {
        let mut removed = 0usize;
        for store in &self.store_paths {
            let gc = Path::new(store).join(SPILL_GC_DIR);
            let Ok(entries) = std::fs::read_dir(&gc) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let res = if path.is_dir() {
                    std::fs::remove_dir_all(&path)
                } else {
                    std::fs::remove_file(&path)
                };
                match res {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("failed to remove spill gc entry {}: {e}", path.display()),
                }
            }
        }
        removed
    }

    pub fn spill_dirs(&self) -> Vec<PathBuf> {
        self.store_paths
            .iter()
            .map(|store| Path::new(store).join(SPILL_DIR))
            .collect()
    }

    /// Round-robin spill dir for a query's blocks.
    pub fn next_spill_dir(&self, query_id: &str) -> Result<PathBuf> {
        if self.store_paths.is_empty() {
            return Err(EnvError::subsystem("block_spill_mgr", "no store paths"));
        }
        let idx = self.next_dir.fetch_add(1, Ordering::AcqRel) % self.store_paths.len();
        Ok(Path::new(&self.store_paths[idx]).join(SPILL_DIR).join(query_id))
    }
}

impl Subsystem for BlockSpillManager {}

fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .map_err(|e| EnvError::io(format!("create spill directory {}", path.display()), e))
}

fn move_children(from: &Path, to: &Path) -> Result<usize> {
    let entries = std::fs::read_dir(from)
        .map_err(|e| EnvError::io(format!("read spill directory {}", from.display()), e))?;
    let mut moved = 0usize;
    for entry in entries.flatten() {
        let target = to.join(entry.file_name());
        std::fs::rename(entry.path(), &target)
            .map_err(|e| EnvError::io(format!("move {} to gc", entry.path().display()), e))?;
        moved += 1;
    }
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_dirs_and_collects_stale_spill() {
        let store = tempfile::tempdir().expect("tempdir");
        let stale = store.path().join("spill").join("query_a");
        std::fs::create_dir_all(&stale).expect("create stale");
        std::fs::write(stale.join("block_0"), b"x").expect("write");

        let mgr = BlockSpillManager::new(vec![store.path().display().to_string()]);
        mgr.init().expect("init");
        assert!(store.path().join("spill").is_dir());
        assert!(store.path().join("spill_gc").is_dir());
        assert!(!stale.exists());
        assert_eq!(std::fs::read_dir(store.path().join("spill_gc")).expect("read").count(), 0);
    }

    #[test]
    fn spill_dirs_rotate_over_stores() {
        let a = tempfile::tempdir().expect("tempdir");
        let b = tempfile::tempdir().expect("tempdir");
        let mgr = BlockSpillManager::new(vec![
            a.path().display().to_string(),
            b.path().display().to_string(),
        ]);
        let first = mgr.next_spill_dir("q").expect("dir");
        let second = mgr.next_spill_dir("q").expect("dir");
        assert!(first.starts_with(a.path()));
        assert!(second.starts_with(b.path()));
        assert_eq!(mgr.spill_dirs().len(), 2);
    }
}
