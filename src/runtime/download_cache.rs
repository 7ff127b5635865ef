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
use std::sync::{Arc, Mutex};

use crate::common::status::Result;
use crate::runtime::resource_scope::Subsystem;
use crate::runtime::thread_pool::{ExecutionMode, ThreadPool, ThreadPoolToken, TokenId};

/// Download-cache front end: a serial token onto the download-cache pool plus
/// one pre-zeroed scratch buffer per token.
pub struct DownloadCache {
    pool: Arc<ThreadPool>,
    token: ThreadPoolToken,
    buffer_size: usize,
    buffers: Arc<Mutex<HashMap<TokenId, Box<[u8]>>>>,
}

impl DownloadCache {
    /// The scratch buffer exists before this returns, so no task can observe
    /// the token without its buffer.
    pub fn new(pool: Arc<ThreadPool>, buffer_size: usize) -> Self {
        let token = pool.new_token(ExecutionMode::Serial);
        let mut buffers = HashMap::new();
        buffers.insert(token.id(), vec![0u8; buffer_size].into_boxed_slice());
        Self {
            pool,
            token,
            buffer_size,
            buffers: Arc::new(Mutex::new(buffers)),
        }
    }

    pub fn pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    pub fn token_id(&self) -> TokenId {
        self.token.id()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn has_buffer(&self, token: TokenId) -> bool {
        self.buffers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&token)
    }

    /// Run `work` on the serial token with exclusive use of its scratch buffer.
    pub fn submit<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce(&mut [u8]) + Send + 'static,
    {
        let buffers = Arc::clone(&self.buffers);
        let token_id = self.token.id();
        self.token.submit(move || {
            let mut buffers = buffers.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(buf) = buffers.get_mut(&token_id) {
                work(buf);
            }
        })
    }

    pub fn pending(&self) -> usize {
        self.token.pending()
    }
}

impl Subsystem for DownloadCache {
    fn shutdown(&self) {
        self.token.shutdown();
        self.buffers.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
