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
use std::env;

// Export build-time allocator facts as plain env values so the runtime can
// resolve the allocation hook capability without conditional compilation.
fn main() {
    println!("cargo:rerun-if-env-changed=CARGO_CFG_SANITIZE");
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_JEMALLOC");

    let sanitize = env::var("CARGO_CFG_SANITIZE").unwrap_or_default();
    println!("cargo:rustc-env=NOVAROCKS_BUILD_SANITIZE={}", sanitize.trim());

    let jemalloc = env::var_os("CARGO_FEATURE_JEMALLOC").is_some();
    println!("cargo:rustc-env=NOVAROCKS_BUILD_JEMALLOC={jemalloc}");
}
