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
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use md5::{Digest, Md5};

use crate::common::status::{EnvError, Result};
use crate::novarocks_logging::{info, warn};
use crate::runtime::resource_scope::Subsystem;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SmallFileEntry {
    pub path: PathBuf,
    pub md5: String,
}

/// Local copies of small files (certificates, keytabs) distributed by the
/// frontend, stored as `<dir>/<file_id>.<md5>`.
#[derive(Debug)]
pub struct SmallFileMgr {
    dir: PathBuf,
    files: Mutex<HashMap<i64, SmallFileEntry>>,
}

pub fn md5_hex(content: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

impl SmallFileMgr {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            files: Mutex::new(HashMap::new()),
        }
    }

    fn files(&self) -> MutexGuard<'_, HashMap<i64, SmallFileEntry>> {
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the directory and index existing files. Files whose name is
    /// malformed or whose content does not match the md5 in the name are
    /// removed.
    pub fn init(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| EnvError::io(format!("create small file dir {}", self.dir.display()), e))?;
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| EnvError::io(format!("read small file dir {}", self.dir.display()), e))?;
        let mut files = self.files();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match load_single_file(&path) {
                Some((file_id, md5)) => {
                    files.insert(file_id, SmallFileEntry { path, md5 });
                }
                None => {
                    warn!("remove invalid small file {}", path.display());
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
        info!("small file manager loaded {} files from {}", files.len(), self.dir.display());
        Ok(())
    }

    pub fn get_file(&self, file_id: i64, md5: &str) -> Option<SmallFileEntry> {
        self.files()
            .get(&file_id)
            .filter(|entry| entry.md5.eq_ignore_ascii_case(md5))
            .cloned()
    }

    /// Store `content` under `file_id`, replacing an older version.
    pub fn put_file(&self, file_id: i64, content: &[u8]) -> Result<SmallFileEntry> {
        let md5 = md5_hex(content);
        let path = self.dir.join(format!("{file_id}.{md5}"));
        std::fs::write(&path, content)
            .map_err(|e| EnvError::io(format!("write small file {}", path.display()), e))?;
        let entry = SmallFileEntry { path, md5 };
        if let Some(old) = self.files().insert(file_id, entry.clone())
            && old.path != entry.path
        {
            let _ = std::fs::remove_file(&old.path);
        }
        Ok(entry)
    }

    pub fn len(&self) -> usize {
        self.files().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn load_single_file(path: &Path) -> Option<(i64, String)> {
    let name = path.file_name()?.to_str()?;
    let (id, md5) = name.split_once('.')?;
    let file_id = id.parse::<i64>().ok()?;
    let content = std::fs::read(path).ok()?;
    if !md5_hex(&content).eq_ignore_ascii_case(md5) {
        return None;
    }
    Some((file_id, md5.to_ascii_lowercase()))
}

impl Subsystem for SmallFileMgr {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_indexes_valid_files_and_drops_bad_ones() {
        let dir = tempfile::tempdir().expect("tempdir");
        let small = dir.path().join("small_file");
        std::fs::create_dir_all(&small).expect("mkdir");
        let good = b"-----BEGIN CERTIFICATE-----";
        std::fs::write(small.join(format!("12.{}", md5_hex(good))), good).expect("write");
        std::fs::write(small.join("13.0123456789abcdef0123456789abcdef"), b"tampered")
            .expect("write");
        std::fs::write(small.join("garbage"), b"x").expect("write");

        let mgr = SmallFileMgr::new(&small);
        mgr.init().expect("init");
        assert_eq!(mgr.len(), 1);
        assert!(mgr.get_file(12, &md5_hex(good)).is_some());
        assert!(mgr.get_file(12, "ffff").is_none());
        assert!(!small.join("garbage").exists());
    }

    #[test]
    fn init_creates_missing_dir_and_put_replaces() {
        let dir = tempfile::tempdir().expect("tempdir");
        let small = dir.path().join("nested").join("small_file");
        let mgr = SmallFileMgr::new(&small);
        mgr.init().expect("init");
        assert!(small.is_dir());
        assert!(mgr.is_empty());

        let v1 = mgr.put_file(1, b"v1").expect("put");
        let v2 = mgr.put_file(1, b"v2").expect("put");
        assert!(!v1.path.exists());
        assert!(v2.path.exists());
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
    }
}
