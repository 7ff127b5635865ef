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

use thiserror::Error;

/// Error taxonomy for environment bootstrap and the subsystems it owns.
///
/// Every fallible init step returns one of these. [`EnvError::Fatal`] wraps
/// failures the process cannot recover from; the entry point is the only
/// place that turns a fatal result into a process exit.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Broken internal invariant, including configuration values that violate
    /// a documented shape (for example a size that must be a power of two).
    #[error("internal error: {0}")]
    InternalError(String),

    #[error("invalid config {name}: {message}")]
    InvalidConfig { name: &'static str, message: String },

    #[error("{subsystem} init failed: {message}")]
    SubsystemInit {
        subsystem: &'static str,
        message: String,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("exec env is not initialized")]
    NotInitialized,

    #[error("exec env has already been destroyed")]
    AlreadyDestroyed,

    /// Back-pressure from a bounded queue or a pool that is shutting down.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("fatal: {0}")]
    Fatal(Box<EnvError>),
}

pub type Result<T> = std::result::Result<T, EnvError>;

impl EnvError {
    pub fn internal(message: impl Into<String>) -> Self {
        EnvError::InternalError(message.into())
    }

    pub fn invalid_config(name: &'static str, message: impl fmt::Display) -> Self {
        EnvError::InvalidConfig {
            name,
            message: message.to_string(),
        }
    }

    pub fn subsystem(subsystem: &'static str, message: impl fmt::Display) -> Self {
        EnvError::SubsystemInit {
            subsystem,
            message: message.to_string(),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        EnvError::Io {
            context: context.into(),
            source,
        }
    }

    /// Escalate this error so the entry point terminates the process.
    pub fn into_fatal(self) -> Self {
        match self {
            EnvError::Fatal(_) => self,
            other => EnvError::Fatal(Box::new(other)),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, EnvError::Fatal(_))
    }

    pub fn is_internal(&self) -> bool {
        match self {
            EnvError::InternalError(_) => true,
            EnvError::Fatal(inner) => inner.is_internal(),
            _ => false,
        }
    }
}
