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
use std::env;
use std::fs;
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use novarocks_env::common::mem_info::MemInfo;
use novarocks_env::novarocks_config::{self, EnvConfig};
use novarocks_env::novarocks_logging::{self, error, info};
use novarocks_env::{EnvError, ExecEnv};

#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[cfg(not(all(feature = "jemalloc", not(target_env = "msvc"))))]
#[global_allocator]
static GLOBAL: novarocks_env::runtime::alloc_hook::TrackingAllocator =
    novarocks_env::runtime::alloc_hook::TrackingAllocator::new(std::alloc::System);

const PID_FILE: &str = "novarocks_env.pid";

fn load_config(explicit: Option<&str>) -> anyhow::Result<EnvConfig> {
    match novarocks_config::resolve_config_path(explicit) {
        Ok(path) => EnvConfig::load_from_file(&path),
        Err(_) if explicit.is_none() => {
            eprintln!("no config file found, using built-in defaults");
            Ok(EnvConfig::default())
        }
        Err(e) => Err(e),
    }
}

fn exit_code(err: &EnvError) -> i32 {
    if err.is_fatal() { 255 } else { 1 }
}

fn run(config_path: Option<&str>) -> i32 {
    let cfg = match load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("load config failed: {e:#}");
            return 1;
        }
    };
    novarocks_logging::init_with_filter(&cfg.tracing_filter());

    let mem_info = match MemInfo::detect(&cfg.memory.mem_limit) {
        Ok(m) => m,
        Err(e) => {
            error!("detect memory failed: {e}");
            return exit_code(&e);
        }
    };
    info!(
        "memory: limit={} physical={}",
        mem_info.mem_limit(),
        mem_info.physical_mem()
    );

    let store_paths = cfg.storage.paths.clone();
    let mut exec_env = ExecEnv::new(Arc::new(cfg), mem_info);
    if let Err(e) = exec_env.init(&store_paths) {
        error!("exec env init failed: {e}");
        return exit_code(&e);
    }

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        running_clone.store(false, Ordering::SeqCst);
    }) {
        error!("set Ctrl-C handler failed: {e}");
        exec_env.destroy();
        return 1;
    }

    if let Err(e) = fs::write(PID_FILE, process::id().to_string()) {
        error!("write pid file failed: {e}");
    }
    info!(
        "novarocks-env started with {} subsystems, press Ctrl-C to stop",
        exec_env.subsystem_names().len()
    );
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    info!("received interrupt signal, shutting down");
    exec_env.destroy();
    if Path::new(PID_FILE).exists() {
        let _ = fs::remove_file(PID_FILE);
    }
    0
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let mut idx = 1usize;
    let mode = if args.get(idx).is_some_and(|s| !s.starts_with('-')) {
        let m = args[idx].as_str();
        idx += 1;
        m
    } else {
        "run"
    };

    let mut config_path: Option<String> = None;
    while let Some(arg) = args.get(idx) {
        match arg.as_str() {
            "--config" | "-c" => {
                idx += 1;
                config_path = args.get(idx).cloned();
                if config_path.is_none() {
                    eprintln!("missing value for --config/-c");
                    process::exit(1);
                }
                idx += 1;
            }
            "--help" | "-h" => {
                eprintln!("Usage: novarocks-env [run] [--config <path>]");
                eprintln!("  run      - Initialize the exec env and run in foreground (default)");
                process::exit(0);
            }
            other => {
                eprintln!("unknown arg: {other} (try --help)");
                process::exit(1);
            }
        }
    }

    match mode {
        "run" => process::exit(run(config_path.as_deref())),
        _ => {
            eprintln!("Usage: novarocks-env [run] [--config <path>]");
            process::exit(1);
        }
    }
}
