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
use std::sync::{Mutex, MutexGuard, OnceLock};

use prometheus::IntCounter;

use crate::common::status::{EnvError, Result};
use crate::runtime::metrics::MetricsRegistry;
use crate::runtime::resource_scope::Subsystem;

#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct NetAddress {
    pub host: String,
    pub port: u16,
}

impl NetAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for NetAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A client connection a cache can hand out.
pub trait ServiceClient: Send + 'static {
    fn open(addr: &NetAddress) -> Result<Self>
    where
        Self: Sized;
}

struct CacheCounters {
    hits: IntCounter,
    misses: IntCounter,
}

/// Per-host pool of idle clients. At most `max_cache_size_per_host` idle
/// clients are kept for each address; extras are dropped on release.
pub struct ClientCache<C: ServiceClient> {
    max_cache_size_per_host: usize,
    idle: Mutex<HashMap<NetAddress, Vec<C>>>,
    counters: OnceLock<CacheCounters>,
}

impl<C: ServiceClient> ClientCache<C> {
    pub fn new(max_cache_size_per_host: usize) -> Self {
        Self {
            max_cache_size_per_host,
            idle: Mutex::new(HashMap::new()),
            counters: OnceLock::new(),
        }
    }

    fn idle(&self) -> MutexGuard<'_, HashMap<NetAddress, Vec<C>>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn max_cache_size_per_host(&self) -> usize {
        self.max_cache_size_per_host
    }

    /// Register `<name>_client_cache_{hits,misses}_total` counters.
    pub fn init_metrics(&self, metrics: &MetricsRegistry, name: &str) -> Result<()> {
        let hits = metrics.register_counter(
            &format!("{name}_client_cache_hits_total"),
            &format!("{name} client cache hits"),
        )?;
        let misses = metrics.register_counter(
            &format!("{name}_client_cache_misses_total"),
            &format!("{name} client cache misses"),
        )?;
        self.counters
            .set(CacheCounters { hits, misses })
            .map_err(|_| {
                EnvError::internal(format!("{name} client cache metrics already registered"))
            })
    }

    pub fn get_client(&self, addr: &NetAddress) -> Result<C> {
        let cached = self.idle().get_mut(addr).and_then(Vec::pop);
        if let Some(client) = cached {
            if let Some(counters) = self.counters.get() {
                counters.hits.inc();
            }
            return Ok(client);
        }
        if let Some(counters) = self.counters.get() {
            counters.misses.inc();
        }
        C::open(addr)
    }

    pub fn release_client(&self, addr: &NetAddress, client: C) {
        let mut idle = self.idle();
        let clients = idle.entry(addr.clone()).or_default();
        if clients.len() < self.max_cache_size_per_host {
            clients.push(client);
        }
    }

    pub fn close_connections(&self, addr: &NetAddress) {
        self.idle().remove(addr);
    }

    pub fn idle_clients(&self, addr: &NetAddress) -> usize {
        self.idle().get(addr).map_or(0, Vec::len)
    }
}

impl<C: ServiceClient> Subsystem for ClientCache<C> {
    fn shutdown(&self) {
        self.idle().clear();
    }
}

macro_rules! service_client {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug)]
        pub struct $name {
            addr: NetAddress,
        }

        impl $name {
            pub fn addr(&self) -> &NetAddress {
                &self.addr
            }
        }

        impl ServiceClient for $name {
            fn open(addr: &NetAddress) -> Result<Self> {
                if addr.host.is_empty() || addr.port == 0 {
                    return Err(EnvError::internal(format!("invalid service address {addr}")));
                }
                Ok(Self { addr: addr.clone() })
            }
        }
    };
}

service_client!(
    /// Thrift client of another backend.
    BackendServiceClient
);
service_client!(
    /// Thrift client of the frontend.
    FrontendServiceClient
);
service_client!(
    /// Thrift client of a broker.
    BrokerServiceClient
);

pub type BackendServiceClientCache = ClientCache<BackendServiceClient>;
pub type FrontendServiceClientCache = ClientCache<FrontendServiceClient>;
pub type BrokerServiceClientCache = ClientCache<BrokerServiceClient>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_released_clients_up_to_limit() {
        let cache = BackendServiceClientCache::new(1);
        let addr = NetAddress::new("be1", 9060);
        let a = cache.get_client(&addr).expect("open");
        let b = cache.get_client(&addr).expect("open");
        cache.release_client(&addr, a);
        cache.release_client(&addr, b);
        assert_eq!(cache.idle_clients(&addr), 1);
        let reused = cache.get_client(&addr).expect("reuse");
        assert_eq!(reused.addr(), &addr);
        assert_eq!(cache.idle_clients(&addr), 0);
    }

    #[test]
    fn counts_hits_and_misses() {
        let metrics = MetricsRegistry::new();
        let cache = FrontendServiceClientCache::new(4);
        cache.init_metrics(&metrics, "frontend").expect("metrics");
        assert!(cache.init_metrics(&metrics, "frontend").is_err());

        let addr = NetAddress::new("fe", 9020);
        let client = cache.get_client(&addr).expect("open");
        cache.release_client(&addr, client);
        cache.get_client(&addr).expect("reuse");

        let text = metrics.gather_text().expect("gather");
        assert!(text.contains("frontend_client_cache_hits_total 1"));
        assert!(text.contains("frontend_client_cache_misses_total 1"));
    }

    #[test]
    fn invalid_address_fails_to_open() {
        let cache = BrokerServiceClientCache::new(1);
        assert!(cache.get_client(&NetAddress::new("", 8000)).is_err());
    }
}
