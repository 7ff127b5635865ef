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
//! Common utilities and helpers for integration tests.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use novarocks_env::ExecEnv;
use novarocks_env::common::mem_info::MemInfo;
use novarocks_env::novarocks_config::EnvConfig;
use novarocks_env::novarocks_logging;

pub const GB: i64 = 1 << 30;

/// Temporary store directories plus a small config that keeps thread counts
/// low and leaves the allocation hook off.
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub store_paths: Vec<String>,
    pub config: EnvConfig,
}

impl TestEnv {
    pub fn new(num_stores: usize) -> anyhow::Result<Self> {
        novarocks_logging::init_with_filter("info");
        let temp_dir = tempfile::tempdir()?;
        let mut store_paths = Vec::with_capacity(num_stores);
        for i in 0..num_stores {
            let dir = temp_dir.path().join(format!("store{i}"));
            std::fs::create_dir_all(&dir)?;
            store_paths.push(dir.display().to_string());
        }

        let config_text = format!(
            r#"
log_level = "info"

[memory]
mem_limit = "4G"
storage_page_cache_limit = "256M"
chunk_reserved_bytes_limit = "64M"
enable_alloc_hook = false
min_file_descriptor_number = 1024

[thread_pool]
send_batch_thread_pool_thread_num = 2
send_batch_thread_pool_queue_size = 64
download_cache_thread_pool_thread_num = 2
download_cache_thread_pool_queue_size = 64
download_cache_buffer_size = 4096
pipeline_executor_size = 2
scanner_thread_pool_thread_num = 2
scanner_thread_pool_queue_size = 64
remote_scanner_thread_pool_thread_num = 2

[load]
small_file_dir = "{}"
routine_load_thread_pool_size = 2
stream_load_thread_pool_size = 2
"#,
            temp_dir.path().join("small_files").display()
        );
        let config = EnvConfig::from_toml_str(&config_text)?;

        Ok(Self {
            temp_dir,
            store_paths,
            config,
        })
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn store(&self, idx: usize) -> PathBuf {
        PathBuf::from(&self.store_paths[idx])
    }

    pub fn mem_info(&self) -> MemInfo {
        MemInfo::new(4 * GB, 8 * GB)
    }

    pub fn exec_env(&self) -> ExecEnv {
        ExecEnv::new(Arc::new(self.config.clone()), self.mem_info())
    }
}

/// Wait for a condition to become true, with timeout.
pub fn wait_for<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Assert that a result is Ok and return the value.
#[macro_export]
macro_rules! assert_ok {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("Expected Ok, got Err: {:?}", e),
        }
    };
    ($result:expr, $message:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("{}: {:?}", $message, e),
        }
    };
}
