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
use std::collections::BTreeSet;
use std::sync::{Mutex, OnceLock};

use crate::common::status::{EnvError, Result};
use crate::novarocks_logging::info;
use crate::runtime::resource_scope::Subsystem;

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

/// Brokers known to this backend and the client id it presents to them.
#[derive(Debug, Default)]
pub struct BrokerMgr {
    client_id: OnceLock<String>,
    brokers: Mutex<BTreeSet<BrokerAddress>>,
}

impl BrokerMgr {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fix the client id as `<host>:<pid>`.
    pub fn init(&self) -> Result<()> {
        let host = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| "localhost".to_string());
        let client_id = format!("{host}:{}", std::process::id());
        info!("broker manager client id: {client_id}");
        let _ = self.client_id.set(client_id);
        Ok(())
    }

    pub fn client_id(&self) -> Result<&str> {
        self.client_id
            .get()
            .map(String::as_str)
            .ok_or(EnvError::NotInitialized)
    }

    pub fn update_broker_addresses(&self, addresses: impl IntoIterator<Item = BrokerAddress>) {
        let mut brokers = self.brokers.lock().unwrap_or_else(|e| e.into_inner());
        *brokers = addresses.into_iter().collect();
    }

    pub fn brokers(&self) -> Vec<BrokerAddress> {
        let brokers = self.brokers.lock().unwrap_or_else(|e| e.into_inner());
        brokers.iter().cloned().collect()
    }
}

impl Subsystem for BrokerMgr {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_is_set_by_init() {
        let mgr = BrokerMgr::new();
        assert!(mgr.client_id().is_err());
        mgr.init().expect("init");
        assert!(mgr.client_id().expect("client id").ends_with(&std::process::id().to_string()));
        mgr.update_broker_addresses([
            BrokerAddress { host: "b2".into(), port: 8000 },
            BrokerAddress { host: "b1".into(), port: 8000 },
        ]);
        assert_eq!(mgr.brokers()[0].host, "b1");
    }
}
