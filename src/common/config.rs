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
use crate::basalt_config::config as basalt_app_config;

pub fn vector_size() -> usize {
    basalt_app_config()
        .ok()
        .map(|c| c.engine.vector_size)
        .unwrap_or(1024)
}

pub fn block_size_bytes() -> usize {
    basalt_app_config()
        .ok()
        .map(|c| c.engine.block_size_bytes)
        .unwrap_or(256 * 1024)
}

pub fn initial_radix_bits() -> usize {
    basalt_app_config()
        .ok()
        .map(|c| c.engine.initial_radix_bits)
        .unwrap_or(4)
}

pub fn join_memory_budget_bytes() -> usize {
    basalt_app_config()
        .ok()
        .map(|c| c.engine.join_memory_budget_bytes)
        .unwrap_or(64 * 1024 * 1024)
}

pub fn partition_threads() -> usize {
    basalt_app_config()
        .ok()
        .map(|c| c.engine.partition_threads)
        .unwrap_or(4)
}

pub fn log_level() -> String {
    basalt_app_config()
        .ok()
        .map(|c| c.log.level.clone())
        .unwrap_or_else(|| "info".to_string())
}
