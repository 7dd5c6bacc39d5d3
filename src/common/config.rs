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
use crate::novajoin_config::config as novajoin_app_config;

pub fn pre_serialize_keys_limit_bytes() -> usize {
    novajoin_app_config()
        .ok()
        .and_then(|c| c.join.pre_serialize_keys_limit_bytes)
        .unwrap_or(256 * 1024)
}

pub fn join_probe_batch_size() -> usize {
    novajoin_app_config()
        .ok()
        .and_then(|c| c.join.probe_batch_size)
        .unwrap_or(4096)
}
