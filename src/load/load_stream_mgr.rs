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
//! Stream load plumbing: the legacy pipe registry and its replacement keyed by
//! load context.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;

use crate::common::status::{EnvError, Result};
use crate::common::types::UniqueId;
use crate::runtime::resource_scope::Subsystem;

#[derive(Debug, Default)]
struct PipeState {
    chunks: VecDeque<Bytes>,
    buffered: usize,
    finished: bool,
    cancelled: Option<String>,
}

/// Byte pipe between an HTTP stream load and the fragment consuming it.
#[derive(Debug)]
pub struct StreamLoadPipe {
    max_buffered_bytes: usize,
    state: Mutex<PipeState>,
    cv: Condvar,
}

impl StreamLoadPipe {
    pub fn new(max_buffered_bytes: usize) -> Self {
        Self {
            max_buffered_bytes: max_buffered_bytes.max(1),
            state: Mutex::new(PipeState::default()),
            cv: Condvar::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Blocks while the pipe holds more than its buffer limit.
    pub fn append(&self, chunk: Bytes) -> Result<()> {
        let mut state = self.state();
        while state.buffered >= self.max_buffered_bytes && state.cancelled.is_none() {
            state = self.cv.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        if let Some(reason) = &state.cancelled {
            return Err(EnvError::internal(format!("stream load pipe cancelled: {reason}")));
        }
        if state.finished {
            return Err(EnvError::internal("append to finished stream load pipe"));
        }
        state.buffered += chunk.len();
        state.chunks.push_back(chunk);
        self.cv.notify_all();
        Ok(())
    }

    /// Next chunk; `Ok(None)` at end of stream or when `timeout` elapses
    /// with nothing buffered.
    pub fn read(&self, timeout: Duration) -> Result<Option<Bytes>> {
        let state = self.state();
        let (mut state, _) = self
            .cv
            .wait_timeout_while(state, timeout, |s| {
                s.chunks.is_empty() && !s.finished && s.cancelled.is_none()
            })
            .unwrap_or_else(|e| e.into_inner());
        if let Some(reason) = &state.cancelled {
            return Err(EnvError::internal(format!("stream load pipe cancelled: {reason}")));
        }
        let chunk = state.chunks.pop_front();
        if let Some(chunk) = &chunk {
            state.buffered -= chunk.len();
            self.cv.notify_all();
        }
        Ok(chunk)
    }

    pub fn finish(&self) {
        self.state().finished = true;
        self.cv.notify_all();
    }

    pub fn cancel(&self, reason: &str) {
        let mut state = self.state();
        state.cancelled = Some(reason.to_string());
        state.chunks.clear();
        state.buffered = 0;
        self.cv.notify_all();
    }
}

/// Legacy registry of pipes keyed by fragment instance id.
#[derive(Debug, Default)]
pub struct LoadStreamMgr {
    pipes: Mutex<HashMap<UniqueId, Arc<StreamLoadPipe>>>,
}

impl LoadStreamMgr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, id: UniqueId, pipe: Arc<StreamLoadPipe>) -> Result<()> {
        let mut pipes = self.pipes.lock().unwrap_or_else(|e| e.into_inner());
        if pipes.contains_key(&id) {
            return Err(EnvError::internal(format!("stream load pipe {id} already exists")));
        }
        pipes.insert(id, pipe);
        Ok(())
    }

    /// Take the pipe out of the registry.
    pub fn get(&self, id: UniqueId) -> Option<Arc<StreamLoadPipe>> {
        self.pipes.lock().unwrap_or_else(|e| e.into_inner()).remove(&id)
    }

    pub fn remove(&self, id: UniqueId) -> bool {
        self.get(id).is_some()
    }
}

impl Subsystem for LoadStreamMgr {
    fn shutdown(&self) {
        let pipes: Vec<_> = self
            .pipes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, p)| p)
            .collect();
        for pipe in pipes {
            pipe.cancel("backend shutting down");
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoadStatus {
    Pending,
    Running,
    Committed,
    Aborted,
}

/// Everything known about one stream load.
#[derive(Debug)]
pub struct StreamLoadContext {
    pub id: UniqueId,
    pub db: String,
    pub table: String,
    pub label: String,
    pub body_sink: Arc<StreamLoadPipe>,
    status: Mutex<LoadStatus>,
}

impl StreamLoadContext {
    pub fn new(db: &str, table: &str, label: &str, max_buffered_bytes: usize) -> Self {
        Self {
            id: UniqueId::generate(),
            db: db.to_string(),
            table: table.to_string(),
            label: label.to_string(),
            body_sink: Arc::new(StreamLoadPipe::new(max_buffered_bytes)),
            status: Mutex::new(LoadStatus::Pending),
        }
    }

    pub fn status(&self) -> LoadStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_status(&self, status: LoadStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }
}

/// Replacement registry keyed by load id and holding the whole context.
#[derive(Debug, Default)]
pub struct NewLoadStreamMgr {
    contexts: Mutex<HashMap<UniqueId, Arc<StreamLoadContext>>>,
}

impl NewLoadStreamMgr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, ctx: Arc<StreamLoadContext>) -> Result<()> {
        let mut contexts = self.contexts.lock().unwrap_or_else(|e| e.into_inner());
        if contexts.contains_key(&ctx.id) {
            return Err(EnvError::internal(format!(
                "stream load context {} already exists",
                ctx.id
            )));
        }
        contexts.insert(ctx.id, ctx);
        Ok(())
    }

    pub fn get(&self, id: UniqueId) -> Option<Arc<StreamLoadContext>> {
        self.contexts.lock().unwrap_or_else(|e| e.into_inner()).get(&id).cloned()
    }

    pub fn remove(&self, id: UniqueId) -> Option<Arc<StreamLoadContext>> {
        self.contexts.lock().unwrap_or_else(|e| e.into_inner()).remove(&id)
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Subsystem for NewLoadStreamMgr {
    fn shutdown(&self) {
        let contexts: Vec<_> = self
            .contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, c)| c)
            .collect();
        for ctx in contexts {
            ctx.body_sink.cancel("backend shutting down");
            ctx.set_status(LoadStatus::Aborted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_streams_until_finish() {
        let pipe = StreamLoadPipe::new(1024);
        pipe.append(Bytes::from_static(b"1,a\n")).expect("append");
        pipe.finish();
        assert!(pipe.append(Bytes::from_static(b"x")).is_err());
        assert_eq!(
            pipe.read(Duration::from_millis(5)).expect("read"),
            Some(Bytes::from_static(b"1,a\n"))
        );
        assert_eq!(pipe.read(Duration::from_millis(5)).expect("read"), None);
    }

    #[test]
    fn cancelled_pipe_fails_readers() {
        let pipe = StreamLoadPipe::new(8);
        pipe.cancel("timeout");
        assert!(pipe.read(Duration::from_millis(5)).is_err());
    }

    #[test]
    fn legacy_get_takes_pipe() {
        let mgr = LoadStreamMgr::new();
        let id = UniqueId::new(1, 2);
        mgr.put(id, Arc::new(StreamLoadPipe::new(8))).expect("put");
        assert!(mgr.put(id, Arc::new(StreamLoadPipe::new(8))).is_err());
        assert!(mgr.get(id).is_some());
        assert!(mgr.get(id).is_none());
    }

    #[test]
    fn shutdown_aborts_registered_contexts() {
        let mgr = NewLoadStreamMgr::new();
        let ctx = Arc::new(StreamLoadContext::new("db", "tbl", "label_1", 64));
        mgr.put(Arc::clone(&ctx)).expect("put");
        assert!(mgr.get(ctx.id).is_some());
        Subsystem::shutdown(&mgr);
        assert!(mgr.is_empty());
        assert_eq!(ctx.status(), LoadStatus::Aborted);
    }
}
