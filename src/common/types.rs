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
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// 128-bit id for queries and fragment instances.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct UniqueId {
    pub hi: i64,
    pub lo: i64,
}

static ID_SEQUENCE: AtomicU64 = AtomicU64::new(0);

impl UniqueId {
    pub const fn new(hi: i64, lo: i64) -> Self {
        Self { hi, lo }
    }

    /// Process-unique id: wall clock nanos in `hi`, a sequence number in `lo`.
    pub fn generate() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or_default();
        let seq = ID_SEQUENCE.fetch_add(1, Ordering::Relaxed) as i64;
        Self { hi: nanos, lo: seq }
    }
}

impl fmt::Display for UniqueId {
    /// Java `UUID` layout, e.g. `019c98a9-3390-7576-977b-33d188ad1f06`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hi = self.hi as u64;
        let lo = self.lo as u64;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
            (hi >> 32) as u32,
            (hi >> 16) as u16,
            hi as u16,
            (lo >> 48) as u16,
            lo & 0x0000_FFFF_FFFF_FFFF
        )
    }
}

#[cfg(test)]
mod tests {
    use super::UniqueId;

    #[test]
    fn display_matches_java_uuid_layout() {
        let id = UniqueId::new(116135542886790518, -7531368976812794106);
        assert_eq!(id.to_string(), "019c98a9-3390-7576-977b-33d188ad1f06");
        assert_eq!(UniqueId::new(0, 1).to_string(), "00000000-0000-0000-0000-000000000001");
    }

    #[test]
    fn generated_ids_are_distinct() {
        assert_ne!(UniqueId::generate(), UniqueId::generate());
    }
}
