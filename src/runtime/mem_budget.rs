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
//! Resource budget planning: pure sizing logic for process-wide caches.
//!
//! Everything here runs on the initializing thread during `ExecEnv::init` and
//! holds no state. Percentage specs resolve against physical memory; the
//! process memory limit only caps absolute storage-cache requests.

use std::io;

use crate::common::mem_info::MemInfo;
use crate::common::status::{EnvError, Result};
use crate::novarocks_logging::{info, warn};

const KB: f64 = 1024.0;
const MB: f64 = KB * 1024.0;
const GB: f64 = MB * 1024.0;
const TB: f64 = GB * 1024.0;

/// A resolved byte budget and whether it came from a percentage spec.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemoryBudget {
    pub bytes: i64,
    pub is_percent: bool,
}

pub fn is_power_of_two(value: i64) -> bool {
    value > 0 && (value & (value - 1)) == 0
}

/// Fail with `InternalError` unless `value` is a positive power of two.
pub fn check_power_of_two(name: &str, value: i64) -> Result<()> {
    if is_power_of_two(value) {
        Ok(())
    } else {
        Err(EnvError::internal(format!(
            "Config {name} must be a power-of-two: {value}"
        )))
    }
}

/// Largest multiple of `factor` that is <= `value`. `factor` must be a power of two.
pub fn round_down(value: i64, factor: i64) -> i64 {
    debug_assert!(is_power_of_two(factor));
    value & !(factor - 1)
}

/// Resolve a memory spec such as `"20%"`, `"8G"`, `"512m"`, `"1024"` or `"-1"`.
///
/// Unit suffixes are binary multiples and accept fractional values. `%` is a
/// share of physical memory. `-1` (unlimited) and the empty string resolve to 0.
pub fn resolve_memory_spec(
    name: &'static str,
    spec: &str,
    mem_info: &MemInfo,
) -> Result<MemoryBudget> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Ok(MemoryBudget {
            bytes: 0,
            is_percent: false,
        });
    }

    let invalid = || EnvError::invalid_config(name, format!("invalid memory spec '{spec}'"));
    let (number, suffix) = match spec.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() || c == '%' => (&spec[..idx], Some(c)),
        _ => (spec, None),
    };

    let multiplier = match suffix {
        Some('t') | Some('T') => Some(TB),
        Some('g') | Some('G') => Some(GB),
        Some('m') | Some('M') => Some(MB),
        Some('k') | Some('K') => Some(KB),
        Some('b') | Some('B') | None => None,
        Some('%') => None,
        Some(_) => return Err(invalid()),
    };
    let is_percent = suffix == Some('%');

    let bytes = if is_percent || multiplier.is_some() {
        let value = number.trim().parse::<f64>().map_err(|_| invalid())?;
        if !value.is_finite() || value < 0.0 {
            return Err(invalid());
        }
        let resolved = if is_percent {
            value / 100.0 * mem_info.physical_mem() as f64
        } else {
            value * multiplier.unwrap_or(1.0)
        };
        if resolved >= i64::MAX as f64 {
            return Err(invalid());
        }
        resolved as i64
    } else {
        let value = number.trim().parse::<i64>().map_err(|_| invalid())?;
        match value {
            -1 => 0,
            v if v < 0 => return Err(invalid()),
            v => v,
        }
    };

    Ok(MemoryBudget { bytes, is_percent })
}

/// Storage page cache budget. Absolute requests above half the process limit
/// are halved until they fit; percentage requests are taken as given.
pub fn storage_page_cache_limit(spec: &str, mem_info: &MemInfo) -> Result<MemoryBudget> {
    let mut budget = resolve_memory_spec("storage_page_cache_limit", spec, mem_info)?;
    let half_limit = mem_info.mem_limit() / 2;
    while !budget.is_percent && budget.bytes > half_limit {
        budget.bytes /= 2;
    }
    Ok(budget)
}

/// Chunk allocator reservation, floored to a multiple of `min_chunk_reserved_bytes`.
pub fn chunk_reserved_bytes_limit(
    spec: &str,
    min_chunk_reserved_bytes: i64,
    mem_info: &MemInfo,
) -> Result<i64> {
    check_power_of_two("min_chunk_reserved_bytes", min_chunk_reserved_bytes)?;
    let budget = resolve_memory_spec("chunk_reserved_bytes_limit", spec, mem_info)?;
    Ok(round_down(budget.bytes, min_chunk_reserved_bytes))
}

/// Segment cache capacity from the open file descriptor budget.
///
/// Segments are cached at rowset granularity, so more files stay open than
/// there are cache entries; a third of the descriptors is kept as headroom.
pub fn segment_cache_capacity(fd_number: u64) -> u64 {
    ((fd_number as u128) * 2 / 3) as u64
}

/// Soft limit on open file descriptors for this process.
pub fn query_fd_soft_limit() -> io::Result<u64> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(limit.rlim_cur as u64)
}

/// Use the queried descriptor limit, or `fallback` when the query failed.
pub fn resolve_fd_number(queried: io::Result<u64>, fallback: u64) -> u64 {
    match queried {
        Ok(fd_number) => fd_number,
        Err(err) => {
            warn!(
                error = %err,
                fallback,
                "call getrlimit() failed, use min_file_descriptor_number instead"
            );
            fallback
        }
    }
}

pub(crate) fn log_budget(what: &str, bytes: i64, origin: &str) {
    info!(
        "{} memory limit: {} bytes ({:.2} GB), origin config value: {}",
        what,
        bytes,
        bytes as f64 / GB,
        origin
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: i64 = 1024 * 1024 * 1024;

    fn mem(limit_gib: i64, physical_gib: i64) -> MemInfo {
        MemInfo::new(limit_gib * GIB, physical_gib * GIB)
    }

    #[test]
    fn percent_spec_resolves_against_physical_memory() {
        let budget = resolve_memory_spec("x", "50%", &mem(30, 100)).expect("resolve");
        assert_eq!(
            budget,
            MemoryBudget {
                bytes: 50 * GIB,
                is_percent: true
            }
        );
    }

    #[test]
    fn unit_suffixes_are_binary_multiples() {
        let info = mem(100, 100);
        assert_eq!(resolve_memory_spec("x", "2G", &info).unwrap().bytes, 2 * GIB);
        assert_eq!(resolve_memory_spec("x", "512m", &info).unwrap().bytes, 512 << 20);
        assert_eq!(resolve_memory_spec("x", "1.5k", &info).unwrap().bytes, 1536);
        assert_eq!(resolve_memory_spec("x", "1T", &info).unwrap().bytes, 1024 * GIB);
        assert_eq!(resolve_memory_spec("x", "4096b", &info).unwrap().bytes, 4096);
        assert_eq!(resolve_memory_spec("x", "4096", &info).unwrap().bytes, 4096);
        assert!(!resolve_memory_spec("x", "2G", &info).unwrap().is_percent);
    }

    #[test]
    fn unlimited_and_empty_resolve_to_zero() {
        let info = mem(100, 100);
        assert_eq!(resolve_memory_spec("x", "-1", &info).unwrap().bytes, 0);
        assert_eq!(resolve_memory_spec("x", "", &info).unwrap().bytes, 0);
    }

    #[test]
    fn malformed_specs_are_rejected() {
        let info = mem(100, 100);
        for spec in ["abc", "12Q", "-5", "-2G", "1.5", "G", "%"] {
            let err = resolve_memory_spec("storage_page_cache_limit", spec, &info)
                .expect_err(spec);
            assert!(
                matches!(
                    err,
                    EnvError::InvalidConfig { name, .. } if name == "storage_page_cache_limit"
                ),
                "{spec}: {err:?}"
            );
        }
    }

    #[test]
    fn absolute_storage_cache_is_halved_below_half_limit() {
        let budget = storage_page_cache_limit("80G", &mem(100, 200)).expect("resolve");
        assert_eq!(budget.bytes, 40 * GIB);
        assert!(!budget.is_percent);

        // 300G -> 150G -> 75G -> 37.5G, which fits under 50G
        let budget = storage_page_cache_limit("300G", &mem(100, 200)).expect("resolve");
        assert_eq!(budget.bytes, 300 * GIB / 8);
    }

    #[test]
    fn halving_keeps_power_of_two_fraction_and_bound() {
        let info = mem(64, 128);
        for request_gib in 1..=512 {
            let request = request_gib * GIB;
            let budget =
                storage_page_cache_limit(&format!("{request}"), &info).expect("resolve");
            assert!(budget.bytes <= info.mem_limit() / 2);
            let mut divisor = 1;
            while request / divisor > budget.bytes {
                divisor *= 2;
            }
            assert_eq!(request / divisor, budget.bytes, "request {request_gib}G");
        }
    }

    #[test]
    fn percent_storage_cache_is_not_capped() {
        let budget = storage_page_cache_limit("80%", &mem(10, 100)).expect("resolve");
        assert!(budget.is_percent);
        assert_eq!(budget.bytes, 80 * GIB);
    }

    #[test]
    fn chunk_budget_rounds_down_to_min_chunk() {
        let info = mem(100, 100);
        assert_eq!(chunk_reserved_bytes_limit("10000", 4096, &info).unwrap(), 8192);
        assert_eq!(chunk_reserved_bytes_limit("8192", 4096, &info).unwrap(), 8192);
        assert_eq!(chunk_reserved_bytes_limit("4095", 4096, &info).unwrap(), 0);
        for value in [0_i64, 1, 1023, 1024, 1025, 65_535, 1 << 31] {
            for factor in [1_i64, 2, 1024, 4096] {
                let rounded = round_down(value, factor);
                assert!(rounded <= value);
                assert_eq!(rounded % factor, 0);
                assert!(value - rounded < factor);
            }
        }
    }

    #[test]
    fn chunk_budget_requires_power_of_two_min_chunk() {
        let err = chunk_reserved_bytes_limit("1G", 1000, &mem(100, 100)).expect_err("not pow2");
        assert!(err.is_internal());
        assert!(err.to_string().contains("min_chunk_reserved_bytes"));
        assert!(err.to_string().contains("1000"));
    }

    #[test]
    fn power_of_two_check() {
        assert!(is_power_of_two(1));
        assert!(is_power_of_two(1024));
        assert!(!is_power_of_two(0));
        assert!(!is_power_of_two(100));
        assert!(!is_power_of_two(-4));
        let err = check_power_of_two("min_buffer_size", 100).expect_err("not pow2");
        assert_eq!(
            err.to_string(),
            "internal error: Config min_buffer_size must be a power-of-two: 100"
        );
    }

    #[test]
    fn segment_cache_keeps_a_third_of_descriptors_free() {
        assert_eq!(segment_cache_capacity(9000), 6000);
        assert_eq!(segment_cache_capacity(11), 7);
        assert_eq!(segment_cache_capacity(0), 0);
        assert_eq!(segment_cache_capacity(u64::MAX), (u64::MAX as u128 * 2 / 3) as u64);
    }

    #[test]
    fn fd_query_failure_falls_back_to_config() {
        let failed = Err(io::Error::from_raw_os_error(libc::EPERM));
        assert_eq!(resolve_fd_number(failed, 60_000), 60_000);
        assert_eq!(resolve_fd_number(Ok(9000), 60_000), 9000);
    }

    #[cfg(unix)]
    #[test]
    fn fd_soft_limit_is_queryable() {
        let limit = query_fd_soft_limit().expect("getrlimit");
        assert!(limit > 0);
    }
}
