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
use std::sync::{Arc, Mutex, MutexGuard};

use crate::common::status::{EnvError, Result};
use crate::runtime::resource_scope::Subsystem;
use crate::util::client_cache::NetAddress;

/// An RPC stub. Stubs multiplex calls, so one per address is shared.
pub trait RpcStub: Send + Sync + 'static {
    fn connect(addr: &NetAddress) -> Result<Self>
    where
        Self: Sized;
}

pub struct BrpcClientCache<S: RpcStub> {
    stubs: Mutex<HashMap<NetAddress, Arc<S>>>,
}

impl<S: RpcStub> Default for BrpcClientCache<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: RpcStub> BrpcClientCache<S> {
    pub fn new() -> Self {
        Self {
            stubs: Mutex::new(HashMap::new()),
        }
    }

    fn stubs(&self) -> MutexGuard<'_, HashMap<NetAddress, Arc<S>>> {
        self.stubs.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get_client(&self, addr: &NetAddress) -> Result<Arc<S>> {
        let mut stubs = self.stubs();
        if let Some(stub) = stubs.get(addr) {
            return Ok(Arc::clone(stub));
        }
        let stub = Arc::new(S::connect(addr)?);
        stubs.insert(addr.clone(), Arc::clone(&stub));
        Ok(stub)
    }

    /// Forget a stub, e.g. after the peer failed.
    pub fn erase(&self, addr: &NetAddress) -> bool {
        self.stubs().remove(addr).is_some()
    }

    pub fn len(&self) -> usize {
        self.stubs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S: RpcStub> Subsystem for BrpcClientCache<S> {
    fn shutdown(&self) {
        self.stubs().clear();
    }
}

/// Stub of the internal backend-to-backend service.
#[derive(Debug)]
pub struct InternalServiceStub {
    addr: NetAddress,
}

/// Stub of an external UDF function service.
#[derive(Debug)]
pub struct FunctionServiceStub {
    addr: NetAddress,
}

impl InternalServiceStub {
    pub fn addr(&self) -> &NetAddress {
        &self.addr
    }
}

impl FunctionServiceStub {
    pub fn addr(&self) -> &NetAddress {
        &self.addr
    }
}

fn check_addr(addr: &NetAddress) -> Result<()> {
    if addr.host.is_empty() || addr.port == 0 {
        return Err(EnvError::internal(format!("invalid brpc address {addr}")));
    }
    Ok(())
}

impl RpcStub for InternalServiceStub {
    fn connect(addr: &NetAddress) -> Result<Self> {
        check_addr(addr)?;
        Ok(Self { addr: addr.clone() })
    }
}

impl RpcStub for FunctionServiceStub {
    fn connect(addr: &NetAddress) -> Result<Self> {
        check_addr(addr)?;
        Ok(Self { addr: addr.clone() })
    }
}

pub type InternalClientCache = BrpcClientCache<InternalServiceStub>;
pub type FunctionClientCache = BrpcClientCache<FunctionServiceStub>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_stub_per_address() {
        let cache = InternalClientCache::new();
        let addr = NetAddress::new("be2", 8060);
        let a = cache.get_client(&addr).expect("connect");
        let b = cache.get_client(&addr).expect("connect");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
        assert!(cache.erase(&addr));
        assert!(!Arc::ptr_eq(&a, &cache.get_client(&addr).expect("reconnect")));
    }

    #[test]
    fn bad_address_is_rejected() {
        let cache = FunctionClientCache::new();
        assert!(cache.get_client(&NetAddress::new("udf", 0)).is_err());
        assert!(cache.is_empty());
    }
}
