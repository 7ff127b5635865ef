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
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolve the config path from an explicit argument, `$NOVAROCKS_ENV_CONFIG`,
/// or `./novarocks_env.toml`, in that order.
pub fn resolve_config_path(explicit: Option<&str>) -> Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(PathBuf::from(p));
    }
    if let Ok(p) = std::env::var("NOVAROCKS_ENV_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    let candidates = [PathBuf::from("novarocks_env.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: pass --config, set $NOVAROCKS_ENV_CONFIG \
         or create ./novarocks_env.toml"
    ))
}

#[derive(Clone, Debug, Deserialize)]
pub struct EnvConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub thread_pool: ThreadPoolConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub cache: ResultCacheConfig,

    #[serde(default)]
    pub load: LoadConfig,
}

impl EnvConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        Self::from_toml_str(&s).with_context(|| format!("parse toml: {}", path.display()))
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: EnvConfig = toml::from_str(s)?;
        Ok(cfg)
    }

    /// Logging filter derived from `log_filter`, or from `log_level` applied to
    /// this crate only for the verbose levels.
    pub fn tracing_filter(&self) -> String {
        if let Some(ref f) = self.log_filter {
            return f.clone();
        }
        match self.log_level.as_str() {
            "debug" => "info,novarocks_env=debug".to_string(),
            "trace" => "info,novarocks_env=trace".to_string(),
            other => other.to_string(),
        }
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            storage: StorageConfig::default(),
            memory: MemoryConfig::default(),
            thread_pool: ThreadPoolConfig::default(),
            client: ClientConfig::default(),
            cache: ResultCacheConfig::default(),
            load: LoadConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct StorageConfig {
    /// Store paths handed to `ExecEnv::init` by the binary.
    #[serde(default)]
    pub paths: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_mem_limit")]
    pub mem_limit: String,
    #[serde(default = "default_storage_page_cache_limit")]
    pub storage_page_cache_limit: String,
    #[serde(default = "default_index_page_cache_percentage")]
    pub index_page_cache_percentage: u32,
    #[serde(default = "default_storage_page_cache_shard_size")]
    pub storage_page_cache_shard_size: u32,
    #[serde(default = "default_min_buffer_size")]
    pub min_buffer_size: i64,
    #[serde(default = "default_chunk_reserved_bytes_limit")]
    pub chunk_reserved_bytes_limit: String,
    #[serde(default = "default_min_chunk_reserved_bytes")]
    pub min_chunk_reserved_bytes: i64,
    #[serde(default = "default_enable_alloc_hook")]
    pub enable_alloc_hook: bool,
    #[serde(default = "default_min_file_descriptor_number")]
    pub min_file_descriptor_number: u64,
}

fn default_mem_limit() -> String {
    "90%".to_string()
}

fn default_storage_page_cache_limit() -> String {
    "20%".to_string()
}

fn default_index_page_cache_percentage() -> u32 {
    10
}

fn default_storage_page_cache_shard_size() -> u32 {
    16
}

fn default_min_buffer_size() -> i64 {
    1024 // 1KB, must be a power of two
}

fn default_chunk_reserved_bytes_limit() -> String {
    "2147483648".to_string() // 2GB
}

fn default_min_chunk_reserved_bytes() -> i64 {
    1024 // must be a power of two
}

fn default_enable_alloc_hook() -> bool {
    true
}

fn default_min_file_descriptor_number() -> u64 {
    60_000
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            mem_limit: default_mem_limit(),
            storage_page_cache_limit: default_storage_page_cache_limit(),
            index_page_cache_percentage: default_index_page_cache_percentage(),
            storage_page_cache_shard_size: default_storage_page_cache_shard_size(),
            min_buffer_size: default_min_buffer_size(),
            chunk_reserved_bytes_limit: default_chunk_reserved_bytes_limit(),
            min_chunk_reserved_bytes: default_min_chunk_reserved_bytes(),
            enable_alloc_hook: default_enable_alloc_hook(),
            min_file_descriptor_number: default_min_file_descriptor_number(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ThreadPoolConfig {
    #[serde(default = "default_send_batch_thread_pool_thread_num")]
    pub send_batch_thread_pool_thread_num: usize,
    #[serde(default = "default_send_batch_thread_pool_queue_size")]
    pub send_batch_thread_pool_queue_size: usize,
    #[serde(default = "default_download_cache_thread_pool_thread_num")]
    pub download_cache_thread_pool_thread_num: usize,
    #[serde(default = "default_download_cache_thread_pool_queue_size")]
    pub download_cache_thread_pool_queue_size: usize,
    #[serde(default = "default_download_cache_buffer_size")]
    pub download_cache_buffer_size: usize,
    /// Pipeline executor count. Values <= 0 mean "use CPU cores".
    #[serde(default)]
    pub pipeline_executor_size: i32,
    #[serde(default = "default_scanner_thread_pool_thread_num")]
    pub scanner_thread_pool_thread_num: usize,
    #[serde(default = "default_scanner_thread_pool_queue_size")]
    pub scanner_thread_pool_queue_size: usize,
    #[serde(default = "default_remote_scanner_thread_pool_thread_num")]
    pub remote_scanner_thread_pool_thread_num: usize,
    #[serde(default = "default_thread_pool_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

fn default_send_batch_thread_pool_thread_num() -> usize {
    64
}

fn default_send_batch_thread_pool_queue_size() -> usize {
    102_400
}

fn default_download_cache_thread_pool_thread_num() -> usize {
    48
}

fn default_download_cache_thread_pool_queue_size() -> usize {
    102_400
}

fn default_download_cache_buffer_size() -> usize {
    10 * 1024 * 1024
}

fn default_scanner_thread_pool_thread_num() -> usize {
    48
}

fn default_scanner_thread_pool_queue_size() -> usize {
    102_400
}

fn default_remote_scanner_thread_pool_thread_num() -> usize {
    48
}

fn default_thread_pool_idle_timeout_ms() -> u64 {
    60_000
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            send_batch_thread_pool_thread_num: default_send_batch_thread_pool_thread_num(),
            send_batch_thread_pool_queue_size: default_send_batch_thread_pool_queue_size(),
            download_cache_thread_pool_thread_num: default_download_cache_thread_pool_thread_num(
            ),
            download_cache_thread_pool_queue_size: default_download_cache_thread_pool_queue_size(
            ),
            download_cache_buffer_size: default_download_cache_buffer_size(),
            pipeline_executor_size: 0,
            scanner_thread_pool_thread_num: default_scanner_thread_pool_thread_num(),
            scanner_thread_pool_queue_size: default_scanner_thread_pool_queue_size(),
            remote_scanner_thread_pool_thread_num: default_remote_scanner_thread_pool_thread_num(),
            idle_timeout_ms: default_thread_pool_idle_timeout_ms(),
        }
    }
}

impl ThreadPoolConfig {
    /// Actual pipeline executor count: CPU cores when configured as <= 0.
    pub fn actual_pipeline_executors(&self) -> usize {
        if self.pipeline_executor_size > 0 {
            self.pipeline_executor_size as usize
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_max_client_cache_size_per_host")]
    pub max_client_cache_size_per_host: usize,
}

fn default_max_client_cache_size_per_host() -> usize {
    10
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_client_cache_size_per_host: default_max_client_cache_size_per_host(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ResultCacheConfig {
    #[serde(default = "default_query_cache_max_size_mb")]
    pub query_cache_max_size_mb: usize,
    #[serde(default = "default_query_cache_elasticity_size_mb")]
    pub query_cache_elasticity_size_mb: usize,
}

fn default_query_cache_max_size_mb() -> usize {
    256
}

fn default_query_cache_elasticity_size_mb() -> usize {
    128
}

impl Default for ResultCacheConfig {
    fn default() -> Self {
        Self {
            query_cache_max_size_mb: default_query_cache_max_size_mb(),
            query_cache_elasticity_size_mb: default_query_cache_elasticity_size_mb(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct LoadConfig {
    #[serde(default = "default_small_file_dir")]
    pub small_file_dir: String,
    /// Cgroup directory applied by the cgroups manager. Empty disables it.
    #[serde(default)]
    pub cgroups_path: String,
    #[serde(default = "default_load_channel_memory_percentage")]
    pub load_channel_memory_percentage: u32,
    #[serde(default = "default_routine_load_thread_pool_size")]
    pub routine_load_thread_pool_size: usize,
    #[serde(default = "default_stream_load_thread_pool_size")]
    pub stream_load_thread_pool_size: usize,
}

fn default_small_file_dir() -> String {
    "lib/small_file".to_string()
}

fn default_load_channel_memory_percentage() -> u32 {
    50
}

fn default_routine_load_thread_pool_size() -> usize {
    10
}

fn default_stream_load_thread_pool_size() -> usize {
    4
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            small_file_dir: default_small_file_dir(),
            cgroups_path: String::new(),
            load_channel_memory_percentage: default_load_channel_memory_percentage(),
            routine_load_thread_pool_size: default_routine_load_thread_pool_size(),
            stream_load_thread_pool_size: default_stream_load_thread_pool_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::EnvConfig;

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg = EnvConfig::from_toml_str("").expect("parse config");
        assert_eq!(cfg.memory.storage_page_cache_limit, "20%");
        assert_eq!(cfg.memory.min_buffer_size, 1024);
        assert_eq!(cfg.memory.min_file_descriptor_number, 60_000);
        assert_eq!(cfg.thread_pool.send_batch_thread_pool_thread_num, 64);
        assert_eq!(cfg.thread_pool.download_cache_buffer_size, 10_485_760);
        assert_eq!(cfg.client.max_client_cache_size_per_host, 10);
        assert!(cfg.storage.paths.is_empty());
    }

    #[test]
    fn test_memory_section_can_be_overridden() {
        let cfg = EnvConfig::from_toml_str(
            r#"
[memory]
storage_page_cache_limit = "8G"
min_buffer_size = 4096
enable_alloc_hook = false
"#,
        )
        .expect("parse config");
        assert_eq!(cfg.memory.storage_page_cache_limit, "8G");
        assert_eq!(cfg.memory.min_buffer_size, 4096);
        assert!(!cfg.memory.enable_alloc_hook);
        assert_eq!(cfg.memory.chunk_reserved_bytes_limit, "2147483648");
    }

    #[test]
    fn test_pipeline_executors_fall_back_to_cores() {
        let cfg = EnvConfig::from_toml_str(
            r#"
[thread_pool]
pipeline_executor_size = -1
"#,
        )
        .expect("parse config");
        assert!(cfg.thread_pool.actual_pipeline_executors() >= 1);

        let cfg = EnvConfig::from_toml_str(
            r#"
[thread_pool]
pipeline_executor_size = 3
"#,
        )
        .expect("parse config");
        assert_eq!(cfg.thread_pool.actual_pipeline_executors(), 3);
    }

    #[test]
    fn test_tracing_filter_scopes_debug_to_crate() {
        let cfg = EnvConfig::from_toml_str("log_level = \"debug\"").expect("parse config");
        assert_eq!(cfg.tracing_filter(), "info,novarocks_env=debug");
        let cfg = EnvConfig::from_toml_str("log_filter = \"warn\"").expect("parse config");
        assert_eq!(cfg.tracing_filter(), "warn");
    }
}
