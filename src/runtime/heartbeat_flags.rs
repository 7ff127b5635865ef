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
use std::sync::atomic::{AtomicU64, Ordering};

use crate::runtime::resource_scope::Subsystem;

pub const DEFAULT_ROWSET_TYPE_BETA: u64 = 1 << 0;

/// Feature flags pushed by the frontend with every heartbeat.
#[derive(Debug, Default)]
pub struct HeartbeatFlags {
    flags: AtomicU64,
}

impl HeartbeatFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, flags: u64) {
        self.flags.store(flags, Ordering::Release);
    }

    pub fn flags(&self) -> u64 {
        self.flags.load(Ordering::Acquire)
    }

    pub fn is_set_default_rowset_type_to_beta(&self) -> bool {
        self.flags() & DEFAULT_ROWSET_TYPE_BETA != 0
    }
}

impl Subsystem for HeartbeatFlags {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_round_trip() {
        let flags = HeartbeatFlags::new();
        assert!(!flags.is_set_default_rowset_type_to_beta());
        flags.update(DEFAULT_ROWSET_TYPE_BETA);
        assert!(flags.is_set_default_rowset_type_to_beta());
    }
}
