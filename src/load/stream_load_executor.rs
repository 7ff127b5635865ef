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
use std::sync::{Arc, Mutex};

use threadpool::ThreadPool;

use crate::common::status::{EnvError, Result};
use crate::load::load_stream_mgr::{LoadStatus, StreamLoadContext};
use crate::novarocks_logging::{info, warn};
use crate::runtime::resource_scope::Subsystem;

/// Runs the plan fragment behind each stream load.
pub struct StreamLoadExecutor {
    pool: Mutex<ThreadPool>,
}

impl StreamLoadExecutor {
    pub fn new(num_threads: usize) -> Self {
        Self {
            pool: Mutex::new(ThreadPool::with_name(
                "stream_load".to_string(),
                num_threads.max(1),
            )),
        }
    }

    /// Marks the load running, runs `plan`, then commits or aborts it.
    pub fn execute_plan_fragment<F>(&self, ctx: Arc<StreamLoadContext>, plan: F) -> Result<()>
    where
        F: FnOnce(&StreamLoadContext) -> Result<()> + Send + 'static,
    {
        if ctx.status() != LoadStatus::Pending {
            return Err(EnvError::internal(format!(
                "stream load {} is not pending: {:?}",
                ctx.label,
                ctx.status()
            )));
        }
        ctx.set_status(LoadStatus::Running);
        let pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        pool.execute(move || match plan(&ctx) {
            Ok(()) => {
                ctx.set_status(LoadStatus::Committed);
                info!("stream load {} committed", ctx.label);
            }
            Err(e) => {
                ctx.body_sink.cancel(&e.to_string());
                ctx.set_status(LoadStatus::Aborted);
                warn!("stream load {} aborted: {e}", ctx.label);
            }
        });
        Ok(())
    }

    pub fn active_count(&self) -> usize {
        self.pool.lock().unwrap_or_else(|e| e.into_inner()).active_count()
    }

    pub fn join(&self) {
        self.pool.lock().unwrap_or_else(|e| e.into_inner()).join();
    }
}

impl Subsystem for StreamLoadExecutor {
    fn shutdown(&self) {
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successful_plan_commits() {
        let executor = StreamLoadExecutor::new(2);
        let ok = Arc::new(StreamLoadContext::new("db", "t", "ok", 64));
        let bad = Arc::new(StreamLoadContext::new("db", "t", "bad", 64));
        executor.execute_plan_fragment(Arc::clone(&ok), |_| Ok(())).expect("submit");
        executor
            .execute_plan_fragment(Arc::clone(&bad), |_| Err(EnvError::internal("bad row")))
            .expect("submit");
        executor.join();
        assert_eq!(ok.status(), LoadStatus::Committed);
        assert_eq!(bad.status(), LoadStatus::Aborted);
        assert!(executor.execute_plan_fragment(ok, |_| Ok(())).is_err());
    }
}
