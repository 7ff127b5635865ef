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
//! Process execution environment.
//!
//! Responsibilities:
//! - Builds every shared runtime subsystem once, in a fixed order, and hands
//!   out typed handles to them.
//! - Tears everything down in reverse construction order.
//!
//! Key exported interfaces:
//! - Types: `ExecEnv`, `EnvResources`, `EnvState`.
//!
//! The environment is an explicit context: the entry point owns it and passes
//! `&ExecEnv` (or an `Arc`) to consumers. `init`/`destroy` need `&mut self`,
//! so they cannot race with readers.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::agent::cgroups_mgr::CgroupsMgr;
use crate::cache::result_cache::ResultCache;
use crate::common::app_config::EnvConfig;
use crate::common::mem_info::MemInfo;
use crate::common::status::{EnvError, Result};
use crate::exec::pipeline::blocked_task_scheduler::BlockedTaskScheduler;
use crate::exec::pipeline::task_queue::TaskQueue;
use crate::exec::pipeline::task_scheduler::TaskScheduler;
use crate::exec::scan::scanner_scheduler::ScannerScheduler;
use crate::exec::spill::block_spill_manager::BlockSpillManager;
use crate::load::load_channel_mgr::LoadChannelMgr;
use crate::load::load_path_mgr::LoadPathMgr;
use crate::load::load_stream_mgr::{LoadStreamMgr, NewLoadStreamMgr};
use crate::load::routine_load_executor::RoutineLoadTaskExecutor;
use crate::load::stream_load_executor::StreamLoadExecutor;
use crate::novarocks_logging::{error, info};
use crate::runtime::alloc_hook::AllocHookCapability;
use crate::runtime::broker_mgr::BrokerMgr;
use crate::runtime::data_stream_mgr::DataStreamMgr;
use crate::runtime::download_cache::DownloadCache;
use crate::runtime::external_scan_context_mgr::ExternalScanContextMgr;
use crate::runtime::fragment_mgr::FragmentMgr;
use crate::runtime::heartbeat_flags::HeartbeatFlags;
use crate::runtime::master_info::MasterInfo;
use crate::runtime::mem_env::{MemEnv, SpillManagers, validate_memory_config};
use crate::runtime::metrics::MetricsRegistry;
use crate::runtime::resource_scope::ResourceScope;
use crate::runtime::result_buffer_mgr::ResultBufferMgr;
use crate::runtime::result_queue_mgr::ResultQueueMgr;
use crate::runtime::small_file_mgr::SmallFileMgr;
use crate::runtime::storage_policy_mgr::StoragePolicyMgr;
use crate::runtime::thread_pool::{ThreadPool, ThreadPoolBuilder};
use crate::runtime::thread_resource_mgr::ThreadResourceMgr;
use crate::runtime::tmp_file_mgr::TmpFileMgr;
use crate::util::bfd_parser::BfdParser;
use crate::util::brpc_client_cache::{FunctionClientCache, InternalClientCache};
use crate::util::client_cache::{
    BackendServiceClientCache, BrokerServiceClientCache, FrontendServiceClientCache,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnvState {
    Uninitialized,
    Initialized,
    Destroyed,
}

macro_rules! env_resources {
    ($($field:ident: $ty:ty),* $(,)?) => {
        /// Typed handles to every subsystem. Valid from a successful `init`
        /// until `destroy`; no handle is ever replaced.
        pub struct EnvResources {
            $($field: Arc<$ty>,)*
            mem_env: MemEnv,
        }

        impl EnvResources {
            $(
                pub fn $field(&self) -> &Arc<$ty> {
                    &self.$field
                }
            )*

            pub fn mem_env(&self) -> &MemEnv {
                &self.mem_env
            }
        }
    };
}

env_resources! {
    external_scan_context_mgr: ExternalScanContextMgr,
    data_stream_mgr: DataStreamMgr,
    result_buffer_mgr: ResultBufferMgr,
    result_queue_mgr: ResultQueueMgr,
    backend_client_cache: BackendServiceClientCache,
    frontend_client_cache: FrontendServiceClientCache,
    broker_client_cache: BrokerServiceClientCache,
    thread_resource_mgr: ThreadResourceMgr,
    send_batch_thread_pool: ThreadPool,
    download_cache_thread_pool: ThreadPool,
    download_cache: DownloadCache,
    pipeline_task_scheduler: TaskScheduler,
    scanner_scheduler: ScannerScheduler,
    cgroups_mgr: CgroupsMgr,
    fragment_mgr: FragmentMgr,
    result_cache: ResultCache,
    master_info: MasterInfo,
    load_path_mgr: LoadPathMgr,
    tmp_file_mgr: TmpFileMgr,
    bfd_parser: BfdParser,
    broker_mgr: BrokerMgr,
    load_channel_mgr: LoadChannelMgr,
    load_stream_mgr: LoadStreamMgr,
    new_load_stream_mgr: NewLoadStreamMgr,
    internal_client_cache: InternalClientCache,
    function_client_cache: FunctionClientCache,
    stream_load_executor: StreamLoadExecutor,
    routine_load_task_executor: RoutineLoadTaskExecutor,
    small_file_mgr: SmallFileMgr,
    storage_policy_mgr: StoragePolicyMgr,
    block_spill_mgr: BlockSpillManager,
    heartbeat_flags: HeartbeatFlags,
}

pub struct ExecEnv {
    config: Arc<EnvConfig>,
    mem_info: MemInfo,
    alloc_hook_capability: AllocHookCapability,
    state: EnvState,
    store_paths: Vec<String>,
    store_path_map: HashMap<String, usize>,
    metrics: Arc<MetricsRegistry>,
    // Declared before `scope`: typed handles go first on drop.
    resources: Option<EnvResources>,
    scope: ResourceScope,
}

/// Path -> position; a repeated path keeps its last position.
pub fn build_store_path_map(store_paths: &[String]) -> HashMap<String, usize> {
    store_paths
        .iter()
        .enumerate()
        .map(|(idx, path)| (path.clone(), idx))
        .collect()
}

impl ExecEnv {
    pub fn new(config: Arc<EnvConfig>, mem_info: MemInfo) -> Self {
        let alloc_hook_capability = AllocHookCapability::detect(config.memory.enable_alloc_hook);
        Self {
            config,
            mem_info,
            alloc_hook_capability,
            state: EnvState::Uninitialized,
            store_paths: Vec::new(),
            store_path_map: HashMap::new(),
            metrics: Arc::new(MetricsRegistry::new()),
            resources: None,
            scope: ResourceScope::new(),
        }
    }

    pub fn with_alloc_hook_capability(mut self, capability: AllocHookCapability) -> Self {
        self.alloc_hook_capability = capability;
        self
    }

    pub fn state(&self) -> EnvState {
        self.state
    }

    pub fn is_initialized(&self) -> bool {
        self.state == EnvState::Initialized
    }

    pub fn config(&self) -> &Arc<EnvConfig> {
        &self.config
    }

    pub fn mem_info(&self) -> &MemInfo {
        &self.mem_info
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn store_paths(&self) -> &[String] {
        &self.store_paths
    }

    pub fn store_path_index(&self, path: &str) -> Option<usize> {
        self.store_path_map.get(path).copied()
    }

    /// Subsystem names in construction order.
    pub fn subsystem_names(&self) -> Vec<&'static str> {
        self.scope.names()
    }

    pub fn resources(&self) -> Result<&EnvResources> {
        match self.state {
            EnvState::Initialized => self.resources.as_ref().ok_or(EnvError::NotInitialized),
            EnvState::Uninitialized => Err(EnvError::NotInitialized),
            EnvState::Destroyed => Err(EnvError::AlreadyDestroyed),
        }
    }

    /// Build every subsystem. A second call on an initialized environment is
    /// a no-op; a destroyed environment cannot be revived.
    ///
    /// On error everything constructed so far is released again. A result
    /// with [`EnvError::is_fatal`] set means the process must exit.
    pub fn init(&mut self, store_paths: &[String]) -> Result<()> {
        match self.state {
            EnvState::Initialized => return Ok(()),
            EnvState::Destroyed => return Err(EnvError::AlreadyDestroyed),
            EnvState::Uninitialized => {}
        }
        validate_memory_config(&self.config.memory)?;

        self.store_paths = store_paths.to_vec();
        self.store_path_map = build_store_path_map(store_paths);

        let mut scope = ResourceScope::new();
        match self.build(&mut scope) {
            Ok(resources) => {
                self.resources = Some(resources);
                self.scope = scope;
                self.state = EnvState::Initialized;
                info!(
                    "exec env initialized: {} subsystems over {} store paths",
                    self.scope.len(),
                    self.store_paths.len()
                );
                Ok(())
            }
            Err(e) => {
                error!("exec env init failed: {e}");
                self.metrics.deregister_all();
                self.store_paths.clear();
                self.store_path_map.clear();
                Err(e)
            }
        }
    }

    fn build(&self, scope: &mut ResourceScope) -> Result<EnvResources> {
        let cfg = &self.config;
        let pools = &cfg.thread_pool;
        let idle_timeout = Duration::from_millis(pools.idle_timeout_ms);
        let per_host = cfg.client.max_client_cache_size_per_host;

        let external_scan_context_mgr =
            scope.adopt("external_scan_context_mgr", ExternalScanContextMgr::new());
        let data_stream_mgr = scope.adopt("data_stream_mgr", DataStreamMgr::new());
        let result_buffer_mgr = scope.adopt("result_buffer_mgr", ResultBufferMgr::new());
        let result_queue_mgr = scope.adopt("result_queue_mgr", ResultQueueMgr::new());
        let backend_client_cache = scope.adopt(
            "backend_client_cache",
            BackendServiceClientCache::new(per_host),
        );
        let frontend_client_cache = scope.adopt(
            "frontend_client_cache",
            FrontendServiceClientCache::new(per_host),
        );
        let broker_client_cache = scope.adopt(
            "broker_client_cache",
            BrokerServiceClientCache::new(per_host),
        );
        let thread_resource_mgr = scope.adopt("thread_resource_mgr", ThreadResourceMgr::default());
        let send_batch_thread_pool = scope.adopt_arc(
            "send_batch_thread_pool",
            ThreadPoolBuilder::new("send_batch_thread_pool")
                .set_min_threads(pools.send_batch_thread_pool_thread_num)
                .set_max_threads(pools.send_batch_thread_pool_thread_num)
                .set_max_queue_size(pools.send_batch_thread_pool_queue_size)
                .set_idle_timeout(idle_timeout)
                .build()?,
        );

        let download_cache_thread_pool = scope.adopt_arc(
            "download_cache_thread_pool",
            ThreadPoolBuilder::new("download_cache_thread_pool")
                .set_min_threads(1)
                .set_max_threads(pools.download_cache_thread_pool_thread_num)
                .set_max_queue_size(pools.download_cache_thread_pool_queue_size)
                .set_idle_timeout(idle_timeout)
                .build()?,
        );
        let download_cache = scope.adopt(
            "download_cache",
            DownloadCache::new(
                Arc::clone(&download_cache_thread_pool),
                pools.download_cache_buffer_size,
            ),
        );

        let task_queue = Arc::new(TaskQueue::new(pools.actual_pipeline_executors()));
        let blocked_scheduler = Arc::new(BlockedTaskScheduler::new(Arc::clone(&task_queue)));
        let pipeline_task_scheduler = scope.adopt(
            "pipeline_task_scheduler",
            TaskScheduler::new(task_queue, blocked_scheduler),
        );
        pipeline_task_scheduler.start()?;

        let scanner_scheduler =
            scope.adopt("scanner_scheduler", ScannerScheduler::new(pools.clone()));
        let cgroups_mgr = scope.adopt(
            "cgroups_mgr",
            CgroupsMgr::new(cfg.load.cgroups_path.clone()),
        );
        let fragment_mgr = scope.adopt("fragment_mgr", FragmentMgr::new());
        let result_cache = scope.adopt(
            "result_cache",
            ResultCache::new(
                cfg.cache.query_cache_max_size_mb,
                cfg.cache.query_cache_elasticity_size_mb,
            ),
        );
        let master_info = scope.adopt("master_info", MasterInfo::new());
        let load_path_mgr = scope.adopt(
            "load_path_mgr",
            LoadPathMgr::new(self.store_paths.clone()),
        );
        let tmp_file_mgr = scope.adopt("tmp_file_mgr", TmpFileMgr::new(self.store_paths.clone()));
        let bfd_parser = scope.adopt("bfd_parser", BfdParser::create()?);
        let broker_mgr = scope.adopt("broker_mgr", BrokerMgr::new());
        let load_channel_mgr = scope.adopt(
            "load_channel_mgr",
            LoadChannelMgr::new(cfg.load.load_channel_memory_percentage),
        );
        let load_stream_mgr = scope.adopt("load_stream_mgr", LoadStreamMgr::new());
        let new_load_stream_mgr = scope.adopt("new_load_stream_mgr", NewLoadStreamMgr::new());
        let internal_client_cache =
            scope.adopt("internal_client_cache", InternalClientCache::new());
        let function_client_cache =
            scope.adopt("function_client_cache", FunctionClientCache::new());
        let stream_load_executor = scope.adopt(
            "stream_load_executor",
            StreamLoadExecutor::new(cfg.load.stream_load_thread_pool_size),
        );
        let routine_load_task_executor = scope.adopt(
            "routine_load_task_executor",
            RoutineLoadTaskExecutor::new(cfg.load.routine_load_thread_pool_size),
        );
        let small_file_mgr = scope.adopt(
            "small_file_mgr",
            SmallFileMgr::new(cfg.load.small_file_dir.as_str()),
        );
        let storage_policy_mgr = scope.adopt("storage_policy_mgr", StoragePolicyMgr::new());
        let block_spill_mgr = scope.adopt(
            "block_spill_mgr",
            BlockSpillManager::new(self.store_paths.clone()),
        );

        backend_client_cache.init_metrics(&self.metrics, "backend")?;
        frontend_client_cache.init_metrics(&self.metrics, "frontend")?;
        broker_client_cache.init_metrics(&self.metrics, "broker")?;
        result_buffer_mgr.init()?;
        cgroups_mgr.init_cgroups()?;
        if let Err(e) = load_path_mgr.init() {
            error!("load path mgr init failed: {e}");
            return Err(e.into_fatal());
        }
        broker_mgr.init()?;
        small_file_mgr.init()?;
        scanner_scheduler.init()?;

        let mem_env = MemEnv::init(
            &cfg.memory,
            &self.mem_info,
            self.alloc_hook_capability,
            SpillManagers {
                tmp_file_mgr: &tmp_file_mgr,
                block_spill_mgr: &block_spill_mgr,
            },
            scope,
        )?;

        load_channel_mgr.init(self.mem_info.mem_limit())?;

        let heartbeat_flags = scope.adopt("heartbeat_flags", HeartbeatFlags::new());
        self.register_metric_hooks(
            &send_batch_thread_pool,
            &download_cache_thread_pool,
            &scanner_scheduler,
            &mem_env,
        )?;

        Ok(EnvResources {
            external_scan_context_mgr,
            data_stream_mgr,
            result_buffer_mgr,
            result_queue_mgr,
            backend_client_cache,
            frontend_client_cache,
            broker_client_cache,
            thread_resource_mgr,
            send_batch_thread_pool,
            download_cache_thread_pool,
            download_cache,
            pipeline_task_scheduler,
            scanner_scheduler,
            cgroups_mgr,
            fragment_mgr,
            result_cache,
            master_info,
            load_path_mgr,
            tmp_file_mgr,
            bfd_parser,
            broker_mgr,
            load_channel_mgr,
            load_stream_mgr,
            new_load_stream_mgr,
            internal_client_cache,
            function_client_cache,
            stream_load_executor,
            routine_load_task_executor,
            small_file_mgr,
            storage_policy_mgr,
            block_spill_mgr,
            heartbeat_flags,
            mem_env,
        })
    }

    fn register_metric_hooks(
        &self,
        send_batch: &Arc<ThreadPool>,
        download_cache: &Arc<ThreadPool>,
        scanner: &Arc<ScannerScheduler>,
        mem_env: &MemEnv,
    ) -> Result<()> {
        // Hooks hold weak handles so a scrape never keeps a pool alive.
        let pool_hooks = [
            ("send_batch_thread_pool", send_batch),
            ("download_cache_thread_pool", download_cache),
        ];
        for (prefix, pool) in pool_hooks {
            let weak: Weak<ThreadPool> = Arc::downgrade(pool);
            self.metrics.register_hook(
                &format!("{prefix}_thread_num"),
                &format!("{prefix} worker threads"),
                move || weak.upgrade().map_or(0, |p| p.thread_count() as i64),
            )?;
            let weak: Weak<ThreadPool> = Arc::downgrade(pool);
            self.metrics.register_hook(
                &format!("{prefix}_queue_size"),
                &format!("{prefix} queued tasks"),
                move || weak.upgrade().map_or(0, |p| p.queue_depth() as i64),
            )?;
        }
        let weak = Arc::downgrade(scanner);
        self.metrics.register_hook(
            "scanner_thread_pool_queue_size",
            "scanner thread pool queued tasks",
            move || weak.upgrade().map_or(0, |s| s.queue_depth() as i64),
        )?;

        let orphan = Arc::downgrade(mem_env.orphan_tracker());
        let hook = mem_env.alloc_hook().map(Arc::downgrade);
        self.metrics.register_hook(
            "orphan_mem_tracker_consumption",
            "bytes charged to the Orphan mem tracker",
            move || {
                if let Some(hook) = hook.as_ref().and_then(Weak::upgrade) {
                    hook.sync();
                }
                orphan.upgrade().map_or(0, |t| t.current())
            },
        )?;
        Ok(())
    }

    /// Release everything `init` built, last constructed first. Metric hooks
    /// go before any subsystem. No-op unless initialized.
    pub fn destroy(&mut self) {
        if self.state != EnvState::Initialized {
            return;
        }
        self.metrics.deregister_all();
        self.resources = None;
        let released = self.scope.len();
        self.scope.release();
        self.state = EnvState::Destroyed;
        info!("exec env destroyed: released {released} subsystems");
    }
}

impl Drop for ExecEnv {
    fn drop(&mut self) {
        self.destroy();
    }
}
