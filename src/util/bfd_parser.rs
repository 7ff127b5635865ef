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
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::common::status::{EnvError, Result};
use crate::runtime::resource_scope::Subsystem;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// Handle on the running executable, used to symbolize stack traces.
#[derive(Debug)]
pub struct BfdParser {
    file_name: PathBuf,
    is_elf: bool,
}

impl BfdParser {
    pub fn create() -> Result<Self> {
        let exe = std::env::current_exe()
            .map_err(|e| EnvError::io("resolve current executable", e))?;
        Self::open(&exe)
    }

    pub fn open(path: &Path) -> Result<Self> {
        let mut magic = [0u8; 4];
        let mut file = std::fs::File::open(path)
            .map_err(|e| EnvError::io(format!("open {}", path.display()), e))?;
        let is_elf = file.read_exact(&mut magic).is_ok() && magic == ELF_MAGIC;
        Ok(Self {
            file_name: path.to_path_buf(),
            is_elf,
        })
    }

    pub fn file_name(&self) -> &Path {
        &self.file_name
    }

    /// Symbolization only works on ELF images.
    pub fn can_symbolize(&self) -> bool {
        self.is_elf
    }
}

impl Subsystem for BfdParser {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_current_executable() {
        let parser = BfdParser::create().expect("create");
        assert!(parser.file_name().exists());
        assert_eq!(parser.can_symbolize(), cfg!(target_os = "linux"));
    }

    #[test]
    fn non_elf_file_cannot_symbolize() {
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        std::fs::write(file.path(), b"#!/bin/sh\n").expect("write");
        assert!(!BfdParser::open(file.path()).expect("open").can_symbolize());
    }
}
