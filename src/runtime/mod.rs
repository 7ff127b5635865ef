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
pub mod alloc_hook;
pub mod broker_mgr;
pub mod data_stream_mgr;
pub mod download_cache;
pub mod exec_env;
pub mod external_scan_context_mgr;
pub mod fragment_mgr;
pub mod heartbeat_flags;
pub mod master_info;
pub mod mem_budget;
pub mod mem_env;
pub mod mem_tracker;
pub mod metrics;
pub mod resource_scope;
pub mod result_buffer_mgr;
pub mod result_queue_mgr;
pub mod small_file_mgr;
pub mod storage_policy_mgr;
pub mod thread_pool;
pub mod thread_resource_mgr;
pub mod tmp_file_mgr;
