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
//! Hash-join probe module exports.
//!
//! Responsibilities:
//! - Defines the join-type and row-list-flavor vocabulary shared by the
//!   probe engine, the build-side table, and callers.
//! - Exposes the probe engine, table, and key encoder types.
//!
//! Current limitations:
//! - Unsupported join-type / row-list-flavor combinations are surfaced as
//!   explicit runtime errors instead of fallback behavior.

mod hash_join_probe_core;
mod join_hash_table;
pub(crate) mod join_probe_utils;
mod key_encoder;
mod other_conjuncts;

pub use hash_join_probe_core::{
    HASH_MAP_PREFETCH_DIST, HashJoinProbeContext, HashJoinProbeCore, PROBE_SIDE_EXPLODE_RATE,
};
pub use join_hash_table::JoinHashTable;
pub use key_encoder::KeyEncoder;

/// Join modes supported by the probe engine.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum JoinType {
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
    LeftSemi,
    RightSemi,
    LeftAnti,
    RightAnti,
    NullAwareLeftAnti,
}

impl JoinType {
    pub(crate) fn is_outer(self) -> bool {
        matches!(
            self,
            JoinType::LeftOuter | JoinType::RightOuter | JoinType::FullOuter
        )
    }

    /// Left/full outer keep every probe row, padding unmatched ones.
    pub(crate) fn probe_all(self) -> bool {
        matches!(self, JoinType::LeftOuter | JoinType::FullOuter)
    }

    pub(crate) fn is_right_semi_anti(self) -> bool {
        matches!(self, JoinType::RightSemi | JoinType::RightAnti)
    }

    pub(crate) fn is_left_semi_anti_family(self) -> bool {
        matches!(
            self,
            JoinType::LeftSemi | JoinType::LeftAnti | JoinType::NullAwareLeftAnti
        )
    }

    /// Modes whose unmatched build rows are drained after probe input ends.
    pub(crate) fn needs_build_drain(self) -> bool {
        matches!(
            self,
            JoinType::RightOuter | JoinType::FullOuter | JoinType::RightSemi | JoinType::RightAnti
        )
    }
}

/// Flavor of the per-key row list held by the build-side table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RowListFlavor {
    /// Coordinates only.
    Plain,
    /// Coordinates plus one visited bit shared by the key's group.
    KeyVisited,
    /// Coordinates with one visited bit per row.
    RowVisited,
}

/// Return a stable string label for one join type, used by diagnostics and errors.
pub fn join_type_str(join_type: JoinType) -> &'static str {
    match join_type {
        JoinType::Inner => "INNER",
        JoinType::LeftOuter => "LEFT_OUTER",
        JoinType::RightOuter => "RIGHT_OUTER",
        JoinType::FullOuter => "FULL_OUTER",
        JoinType::LeftSemi => "LEFT_SEMI",
        JoinType::RightSemi => "RIGHT_SEMI",
        JoinType::LeftAnti => "LEFT_ANTI",
        JoinType::RightAnti => "RIGHT_ANTI",
        JoinType::NullAwareLeftAnti => "NULL_AWARE_LEFT_ANTI",
    }
}
