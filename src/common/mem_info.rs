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
use crate::common::status::{EnvError, Result};
use crate::runtime::mem_budget::resolve_memory_spec;

const PROC_MEMINFO: &str = "/proc/meminfo";

/// Point-in-time view of process and machine memory, in bytes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemInfo {
    mem_limit: i64,
    physical_mem: i64,
}

impl MemInfo {
    pub fn new(mem_limit: i64, physical_mem: i64) -> Self {
        Self {
            mem_limit,
            physical_mem,
        }
    }

    /// Read physical memory from the OS and resolve `mem_limit_spec` against it.
    /// A resolved limit of 0 (unlimited) or above physical memory is capped to
    /// physical memory.
    pub fn detect(mem_limit_spec: &str) -> Result<Self> {
        let meminfo = std::fs::read_to_string(PROC_MEMINFO)
            .map_err(|e| EnvError::io(format!("read {PROC_MEMINFO}"), e))?;
        let physical_mem = parse_mem_total(&meminfo)
            .ok_or_else(|| EnvError::internal(format!("MemTotal not found in {PROC_MEMINFO}")))?;
        let probe = MemInfo::new(physical_mem, physical_mem);
        let budget = resolve_memory_spec("mem_limit", mem_limit_spec, &probe)?;
        let mem_limit = if budget.bytes <= 0 || budget.bytes > physical_mem {
            physical_mem
        } else {
            budget.bytes
        };
        Ok(Self::new(mem_limit, physical_mem))
    }

    pub fn mem_limit(&self) -> i64 {
        self.mem_limit
    }

    pub fn physical_mem(&self) -> i64 {
        self.physical_mem
    }
}

/// Parse the `MemTotal:  16384 kB` line of `/proc/meminfo` into bytes.
fn parse_mem_total(meminfo: &str) -> Option<i64> {
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let mut parts = line["MemTotal:".len()..].split_whitespace();
    let value = parts.next()?.parse::<i64>().ok()?;
    let multiplier = match parts.next() {
        Some("kB") | Some("KB") => 1024,
        None => 1,
        Some(_) => return None,
    };
    value.checked_mul(multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mem_total_reads_kb() {
        let text = "MemTotal:       16316412 kB\nMemFree:         1234 kB\n";
        assert_eq!(parse_mem_total(text), Some(16_316_412 * 1024));
    }

    #[test]
    fn parse_mem_total_missing_line() {
        assert_eq!(parse_mem_total("MemFree: 12 kB\n"), None);
        assert_eq!(parse_mem_total("MemTotal: 12 MB\n"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn detect_caps_limit_to_physical_memory() {
        let info = MemInfo::detect("200%").expect("detect mem info");
        assert!(info.physical_mem() > 0);
        assert_eq!(info.mem_limit(), info.physical_mem());

        let info = MemInfo::detect("50%").expect("detect mem info");
        assert!(info.mem_limit() <= info.physical_mem() / 2 + 1);
    }
}
