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
//! Core probe engine for hash-join output assembly.
//!
//! Responsibilities:
//! - Runs the per-batch probe loop: key lookup, match expansion, and
//!   join-type specific row construction under the output batch cap.
//! - Suspends and resumes mid-probe-row when one probe row's matches exceed
//!   one output batch.
//! - Drains unmatched build rows for right/full outer and right semi/anti
//!   joins after probe input ends.
//!
//! Key exported interfaces:
//! - Types: `HashJoinProbeCore`, `HashJoinProbeContext`.
//!
//! Current limitations:
//! - Unsupported join-type / row-list-flavor combinations are surfaced as
//!   explicit runtime errors instead of fallback behavior.

use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanArray, RecordBatch, UInt32Array};
use arrow::compute::{concat_batches, take};

use super::join_hash_table::JoinHashTable;
use super::join_probe_utils::{
    drain_output_schema, gather_build_columns, gather_probe_columns, null_columns,
    probe_output_schema,
};
use super::key_encoder::{EncodedKeys, KeyEncoder};
use super::other_conjuncts::{OtherConjunctArgs, apply_other_conjuncts};
use super::{JoinType, RowListFlavor, join_type_str};
use crate::exec::chunk::Chunk;
use crate::exec::expr::{ExprArena, ExprId};
use crate::novajoin_logging::debug;
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::profile::{CounterRef, CounterUnit, RuntimeProfile, ScopedTimer};

/// Reservation multiplier for scratch vectors relative to the batch cap.
pub const PROBE_SIDE_EXPLODE_RATE: usize = 3;
/// How many probe rows ahead of the current lookup to prefetch.
pub const HASH_MAP_PREFETCH_DIST: usize = 16;

/// Configuration and shared collaborators for one probe operator instance.
pub struct HashJoinProbeContext {
    pub arena: Arc<ExprArena>,
    pub join_type: JoinType,
    /// Probe-side key expressions, aligned with the build-side table keys.
    pub probe_key_exprs: Vec<ExprId>,
    /// Non-equi join conjuncts evaluated over joined candidate rows.
    pub other_conjuncts: Vec<ExprId>,
    pub build_blocks: Arc<Vec<Chunk>>,
    pub left_schema: arrow::datatypes::SchemaRef,
    pub right_schema: arrow::datatypes::SchemaRef,
    /// Which probe-side output columns are materialized.
    pub left_output_slot_flags: Vec<bool>,
    /// Which build-side output columns are materialized.
    pub right_output_slot_flags: Vec<bool>,
    /// Skip hash lookup for null probe keys instead of probing a serialized
    /// null; left/full outer still emit the padded row.
    pub ignore_null: bool,
    pub profile: RuntimeProfile,
    pub mem_tracker: Arc<MemTracker>,
}

/// Suspended position inside one key's row list.
#[derive(Clone, Copy, Debug)]
struct RowListCursor {
    group_id: usize,
    pos: usize,
}

/// Probe-side engine of the vectorized hash join.
///
/// One instance owns the probe state of one operator; the hash table is
/// shared read-only apart from its visited bits. `process` emits at most
/// `batch_size` rows per call and resumes mid-probe-row across calls.
pub struct HashJoinProbeCore {
    ctx: HashJoinProbeContext,
    batch_size: usize,

    // Current probe batch.
    probe_chunk: Option<Chunk>,
    probe_key_arrays: Vec<ArrayRef>,
    probe_null_map: Option<Vec<bool>>,
    probe_encoder: Option<KeyEncoder>,
    encoded_probe_keys: Option<EncodedKeys>,
    probe_hashes: Vec<u64>,
    ready_probe: bool,
    probe_index: usize,
    probe_row_match_iter: Option<RowListCursor>,
    /// Whether any tuple of the currently spilled probe row survived output
    /// in an earlier sub-block.
    is_any_probe_match_row_output: bool,

    // Per-call scratch.
    build_block_offsets: Vec<i8>,
    build_block_rows: Vec<i32>,
    probe_indexs: Vec<u32>,
    visited_map: Vec<Option<u32>>,
    same_to_prev: Vec<bool>,
    mark_flags: Vec<bool>,
    row_count_from_last_probe: usize,

    // Outer-join null flag columns.
    tuple_is_null_left_flags: Vec<u8>,
    tuple_is_null_right_flags: Vec<u8>,

    // Drain cursor over the hash table.
    drain_inited: bool,
    drain_group_cursor: usize,
    drain_row_cursor: Option<RowListCursor>,

    rows_returned_counter: CounterRef,
    search_hashtable_timer: CounterRef,
    build_side_output_timer: CounterRef,
    probe_side_output_timer: CounterRef,
    other_conjunct_timer: CounterRef,
    process_hashtable_timer: CounterRef,
}

impl HashJoinProbeCore {
    pub fn new(ctx: HashJoinProbeContext, batch_size: usize) -> Result<Self, String> {
        if batch_size == 0 {
            return Err("join probe batch size must be positive".to_string());
        }
        if ctx.probe_key_exprs.is_empty() {
            return Err("join probe requires at least one key expression".to_string());
        }
        if ctx.left_output_slot_flags.len() != ctx.left_schema.fields().len()
            || ctx.right_output_slot_flags.len() != ctx.right_schema.fields().len()
        {
            return Err("join output slot flag count mismatch".to_string());
        }
        debug!(
            "HashJoinProbeCore create: join_type={} batch_size={} keys={} other_conjuncts={}",
            join_type_str(ctx.join_type),
            batch_size,
            ctx.probe_key_exprs.len(),
            ctx.other_conjuncts.len()
        );
        let rows_returned_counter = ctx.profile.add_counter("RowsReturned", CounterUnit::Unit);
        let search_hashtable_timer = ctx.profile.add_timer("SearchHashTableTime");
        let build_side_output_timer = ctx.profile.add_timer("BuildSideOutputTime");
        let probe_side_output_timer = ctx.profile.add_timer("ProbeSideOutputTime");
        let other_conjunct_timer = ctx.profile.add_timer("OtherJoinConjunctTime");
        let process_hashtable_timer = ctx.profile.add_timer("ProcessHashTableTime");
        Ok(Self {
            ctx,
            batch_size,
            probe_chunk: None,
            probe_key_arrays: Vec::new(),
            probe_null_map: None,
            probe_encoder: None,
            encoded_probe_keys: None,
            probe_hashes: Vec::new(),
            ready_probe: false,
            probe_index: 0,
            probe_row_match_iter: None,
            is_any_probe_match_row_output: false,
            build_block_offsets: Vec::new(),
            build_block_rows: Vec::new(),
            probe_indexs: Vec::new(),
            visited_map: Vec::new(),
            same_to_prev: Vec::new(),
            mark_flags: Vec::new(),
            row_count_from_last_probe: 0,
            tuple_is_null_left_flags: Vec::new(),
            tuple_is_null_right_flags: Vec::new(),
            drain_inited: false,
            drain_group_cursor: 0,
            drain_row_cursor: None,
            rows_returned_counter,
            search_hashtable_timer,
            build_side_output_timer,
            probe_side_output_timer,
            other_conjunct_timer,
            process_hashtable_timer,
        })
    }

    pub fn join_type(&self) -> JoinType {
        self.ctx.join_type
    }

    /// True once every row of the current probe batch has been emitted,
    /// including any suspended mid-row match expansion.
    pub fn probe_exhausted(&self) -> bool {
        match self.probe_chunk.as_ref() {
            None => true,
            Some(chunk) => self.probe_index >= chunk.len() && self.probe_row_match_iter.is_none(),
        }
    }

    /// Null flags for the probe-side columns of the last emitted block, one
    /// byte per surviving row (right/full outer only).
    pub fn tuple_is_null_left_flags(&self) -> &[u8] {
        &self.tuple_is_null_left_flags
    }

    /// Null flags for the build-side columns of the last emitted block, one
    /// byte per surviving row (left/full outer only).
    pub fn tuple_is_null_right_flags(&self) -> &[u8] {
        &self.tuple_is_null_right_flags
    }

    /// Install the next probe batch. Key expressions are evaluated here; the
    /// keys are encoded and hashed once, on the first `process` call.
    pub fn prepare_probe_chunk(&mut self, chunk: &Chunk) -> Result<(), String> {
        if !self.probe_exhausted() {
            return Err("previous probe batch is not fully consumed".to_string());
        }
        let mut key_arrays = Vec::with_capacity(self.ctx.probe_key_exprs.len());
        for expr in &self.ctx.probe_key_exprs {
            key_arrays.push(self.ctx.arena.eval(*expr, chunk)?);
        }
        let has_nulls = key_arrays.iter().any(|array| array.null_count() > 0);
        self.probe_null_map = has_nulls.then(|| {
            (0..chunk.len())
                .map(|row| key_arrays.iter().any(|array| array.is_null(row)))
                .collect()
        });
        self.probe_key_arrays = key_arrays;
        self.probe_chunk = Some(chunk.clone());
        self.probe_index = 0;
        self.ready_probe = false;
        self.encoded_probe_keys = None;
        self.is_any_probe_match_row_output = false;
        Ok(())
    }

    fn init_scratch(&mut self, with_other_conjuncts: bool) {
        let reserve = self.batch_size * PROBE_SIDE_EXPLODE_RATE;
        self.build_block_offsets.clear();
        self.build_block_rows.clear();
        self.probe_indexs.clear();
        self.mark_flags.clear();
        self.build_block_offsets.reserve(reserve);
        self.build_block_rows.reserve(reserve);
        self.probe_indexs.reserve(reserve);
        if with_other_conjuncts {
            self.visited_map.clear();
            self.same_to_prev.clear();
            self.visited_map.reserve(reserve);
            self.same_to_prev.reserve(reserve);
        }
        self.row_count_from_last_probe = 0;
        self.tuple_is_null_left_flags.clear();
        self.tuple_is_null_right_flags.clear();
    }

    fn validate_process_call(
        &self,
        table: &JoinHashTable,
        is_mark_join: bool,
        have_other_conjuncts: bool,
    ) -> Result<(), String> {
        if have_other_conjuncts != !self.ctx.other_conjuncts.is_empty() {
            return Err(
                "join other-conjunct flag does not match configured conjuncts".to_string(),
            );
        }
        if have_other_conjuncts && table.flavor() != RowListFlavor::RowVisited {
            return Err(format!(
                "join with other conjuncts requires per-row visited flags, table has {:?}",
                table.flavor()
            ));
        }
        if self.ctx.join_type.needs_build_drain()
            && !have_other_conjuncts
            && table.flavor() != RowListFlavor::KeyVisited
        {
            return Err(format!(
                "{} join without other conjuncts requires key-level visited flags, table has {:?}",
                join_type_str(self.ctx.join_type),
                table.flavor()
            ));
        }
        if is_mark_join && !self.ctx.join_type.is_left_semi_anti_family() {
            return Err(format!(
                "mark join is not supported for {}",
                join_type_str(self.ctx.join_type)
            ));
        }
        Ok(())
    }

    fn ensure_probe_ready(&mut self, table: &JoinHashTable, probe_rows: usize) -> Result<(), String> {
        if self.ready_probe {
            return Ok(());
        }
        let _timer = ScopedTimer::new(Arc::clone(&self.search_hashtable_timer));
        if self.probe_encoder.is_none() {
            let mut encoder = KeyEncoder::new(table.key_types().to_vec())?;
            encoder.set_mem_tracker(MemTracker::new_child(
                "ProbeKeyArena",
                &self.ctx.mem_tracker,
            ));
            self.probe_encoder = Some(encoder);
        }
        let encoder = self
            .probe_encoder
            .as_mut()
            .ok_or_else(|| "join probe key encoder missing".to_string())?;
        let encoded = encoder.encode_batch(&self.probe_key_arrays, probe_rows)?;

        self.probe_hashes.clear();
        self.probe_hashes.resize(probe_rows, 0);
        for row in 0..probe_rows {
            if let Some(null_map) = self.probe_null_map.as_ref() {
                if null_map[row] {
                    continue;
                }
            }
            self.probe_hashes[row] = table.hash_encoded(encoder.key_ref(&encoded, row));
        }
        self.encoded_probe_keys = Some(encoded);
        self.ready_probe = true;
        Ok(())
    }

    /// Drain a suspended row-list iterator from the previous call. Returns
    /// `(resumed, exhausted)`.
    fn probe_row_match(
        &mut self,
        table: &JoinHashTable,
        with_other_conjuncts: bool,
        current_offset: &mut usize,
        all_match_one: &mut bool,
    ) -> Result<(bool, bool), String> {
        let Some(mut cursor) = self.probe_row_match_iter.take() else {
            return Ok((false, false));
        };
        let _timer = ScopedTimer::new(Arc::clone(&self.search_hashtable_timer));
        let rows_list = table.group_rows_slice(cursor.group_id)?;
        while cursor.pos < rows_list.len() && *current_offset < self.batch_size {
            let row_id = rows_list[cursor.pos];
            let (block, row) = table.row_coord(row_id)?;
            self.build_block_offsets.push(block);
            self.build_block_rows.push(row);
            self.probe_indexs.push(self.probe_index as u32);
            if with_other_conjuncts {
                self.visited_map.push(Some(row_id));
            }
            *current_offset += 1;
            cursor.pos += 1;
        }
        self.row_count_from_last_probe = *current_offset;
        *all_match_one &= *current_offset == 1;
        let exhausted = cursor.pos >= rows_list.len();
        if exhausted {
            self.probe_index += 1;
        } else {
            self.probe_row_match_iter = Some(cursor);
        }
        Ok((true, exhausted))
    }

    /// Emit one output batch for the current probe chunk. Engine state is
    /// updated so the next call resumes where this one stopped.
    pub fn process(
        &mut self,
        table: &JoinHashTable,
        is_mark_join: bool,
        have_other_conjuncts: bool,
    ) -> Result<Option<Chunk>, String> {
        self.validate_process_call(table, is_mark_join, have_other_conjuncts)?;
        let Some(probe_chunk) = self.probe_chunk.clone() else {
            return Ok(None);
        };
        let probe_rows = probe_chunk.len();
        self.ensure_probe_ready(table, probe_rows)?;
        self.init_scratch(have_other_conjuncts);

        let join_type = self.ctx.join_type;
        let batch_size = self.batch_size;
        let probe_all = join_type.probe_all();
        let is_right_semi_anti = join_type.is_right_semi_anti();
        let is_semi_anti_join =
            is_right_semi_anti || join_type.is_left_semi_anti_family();
        let right_col_idx = if is_right_semi_anti && !have_other_conjuncts {
            0
        } else {
            self.ctx.left_schema.fields().len()
        };
        let right_col_len = self.ctx.right_schema.fields().len();

        let last_probe_index = self.probe_index;
        let mut current_offset = 0usize;
        let mut all_match_one = true;
        let mut multi_matched_output_row_count = 0usize;

        let (resumed, resume_exhausted) = self.probe_row_match(
            table,
            have_other_conjuncts,
            &mut current_offset,
            &mut all_match_one,
        )?;
        let is_the_last_sub_block = resumed && resume_exhausted;
        if have_other_conjuncts && resumed && current_offset > 0 {
            self.same_to_prev.push(false);
            for _ in 0..current_offset - 1 {
                self.same_to_prev.push(true);
            }
        }

        {
            let _timer = ScopedTimer::new(Arc::clone(&self.search_hashtable_timer));
            while current_offset < batch_size && self.probe_index < probe_rows {
                let idx = self.probe_index;
                let is_null = self
                    .probe_null_map
                    .as_ref()
                    .map(|m| m[idx])
                    .unwrap_or(false);

                if is_null && self.ctx.ignore_null {
                    if probe_all {
                        self.build_block_offsets.push(-1);
                        self.build_block_rows.push(-1);
                        self.probe_indexs.push(idx as u32);
                        if have_other_conjuncts {
                            self.same_to_prev.push(false);
                            self.visited_map.push(None);
                        }
                        current_offset += 1;
                    } else {
                        all_match_one = false;
                    }
                    self.probe_index += 1;
                    continue;
                }

                // A null probe key cannot be certified not-in-set once the
                // build side holds any row.
                if join_type == JoinType::NullAwareLeftAnti
                    && is_null
                    && !have_other_conjuncts
                    && !table.is_empty()
                {
                    if is_mark_join {
                        self.mark_flags.push(false);
                        self.probe_indexs.push(idx as u32);
                        current_offset += 1;
                    } else {
                        all_match_one = false;
                    }
                    self.probe_index += 1;
                    continue;
                }

                let find_result = if is_null {
                    None
                } else {
                    let keys = self
                        .encoded_probe_keys
                        .as_ref()
                        .ok_or_else(|| "join probe keys not encoded".to_string())?;
                    let encoder = self
                        .probe_encoder
                        .as_ref()
                        .ok_or_else(|| "join probe key encoder missing".to_string())?;
                    table.find_with_hash(self.probe_hashes[idx], encoder.key_ref(keys, idx))
                };

                let prefetch_idx = idx + HASH_MAP_PREFETCH_DIST;
                if prefetch_idx < probe_rows
                    && !self
                        .probe_null_map
                        .as_ref()
                        .map(|m| m[prefetch_idx])
                        .unwrap_or(false)
                {
                    table.prefetch_by_hash(self.probe_hashes[prefetch_idx]);
                }

                let origin_offset = current_offset;

                if !have_other_conjuncts && join_type.is_left_semi_anti_family() {
                    let need_go_ahead =
                        (join_type == JoinType::LeftSemi) == find_result.is_some();
                    if is_mark_join {
                        self.mark_flags.push(need_go_ahead);
                        self.probe_indexs.push(idx as u32);
                        current_offset += 1;
                    } else if need_go_ahead {
                        self.probe_indexs.push(idx as u32);
                        current_offset += 1;
                    }
                    self.probe_index += 1;
                } else if let Some(group_id) = find_result {
                    let rows_list = table.group_rows_slice(group_id)?;
                    if is_mark_join && have_other_conjuncts {
                        // Splitting one probe row's matches across blocks is
                        // not implemented for mark joins; expand them all.
                        for &row_id in rows_list {
                            let (block, row) = table.row_coord(row_id)?;
                            self.build_block_offsets.push(block);
                            self.build_block_rows.push(row);
                            self.probe_indexs.push(idx as u32);
                            self.visited_map.push(Some(row_id));
                            current_offset += 1;
                        }
                        self.probe_index += 1;
                    } else if have_other_conjuncts || !is_right_semi_anti {
                        let mut pos = 0usize;
                        while pos < rows_list.len() && current_offset < batch_size {
                            let row_id = rows_list[pos];
                            let (block, row) = table.row_coord(row_id)?;
                            self.build_block_offsets.push(block);
                            self.build_block_rows.push(row);
                            self.probe_indexs.push(idx as u32);
                            if have_other_conjuncts {
                                self.visited_map.push(Some(row_id));
                            }
                            current_offset += 1;
                            pos += 1;
                        }
                        if pos < rows_list.len() {
                            // Remaining matches for this probe row continue in
                            // the next call; probe_index stays put.
                            self.probe_row_match_iter = Some(RowListCursor { group_id, pos });
                            if have_other_conjuncts {
                                multi_matched_output_row_count = current_offset - origin_offset;
                            }
                        } else {
                            self.probe_index += 1;
                        }
                    } else {
                        self.probe_index += 1;
                    }
                    if table.flavor() == RowListFlavor::KeyVisited {
                        table.set_key_visited(group_id)?;
                    }
                    if have_other_conjuncts {
                        self.same_to_prev.push(false);
                        for _ in 0..current_offset - origin_offset - 1 {
                            self.same_to_prev.push(true);
                        }
                    }
                } else if probe_all
                    || join_type == JoinType::LeftAnti
                    || join_type == JoinType::NullAwareLeftAnti
                    || (join_type == JoinType::LeftSemi && is_mark_join)
                {
                    self.build_block_offsets.push(-1);
                    self.build_block_rows.push(-1);
                    self.probe_indexs.push(idx as u32);
                    if have_other_conjuncts {
                        self.same_to_prev.push(false);
                        self.visited_map.push(None);
                    }
                    current_offset += 1;
                    self.probe_index += 1;
                } else {
                    self.probe_index += 1;
                }

                all_match_one &= current_offset == origin_offset + 1;
            }
        }

        let probe_size =
            self.probe_index - last_probe_index + self.probe_row_match_iter.is_some() as usize;
        let size = current_offset;
        if size == 0 {
            return Ok(None);
        }

        let emit_probe_columns = have_other_conjuncts || !is_right_semi_anti;
        let emit_build_columns = !is_semi_anti_join || have_other_conjuncts;

        let mut columns: Vec<ArrayRef> = Vec::new();
        if emit_probe_columns {
            let _timer = ScopedTimer::new(Arc::clone(&self.probe_side_output_timer));
            columns.extend(gather_probe_columns(
                &probe_chunk,
                &self.probe_indexs,
                size,
                all_match_one,
                last_probe_index,
                probe_size,
                &self.ctx.left_output_slot_flags,
            )?);
            if matches!(join_type, JoinType::RightOuter | JoinType::FullOuter)
                && !have_other_conjuncts
            {
                self.tuple_is_null_left_flags
                    .extend(std::iter::repeat(0).take(size));
            }
        }
        if emit_build_columns {
            let _timer = ScopedTimer::new(Arc::clone(&self.build_side_output_timer));
            columns.extend(gather_build_columns(
                &self.ctx.build_blocks,
                &self.build_block_offsets,
                &self.build_block_rows,
                size,
                &self.ctx.right_schema,
                &self.ctx.right_output_slot_flags,
            )?);
            if probe_all && !have_other_conjuncts {
                for j in 0..size {
                    self.tuple_is_null_right_flags
                        .push((self.build_block_rows[j] == -1) as u8);
                }
            }
        }
        if is_mark_join {
            if have_other_conjuncts {
                columns.push(Arc::new(BooleanArray::from(vec![false; size])));
            } else {
                columns.push(Arc::new(BooleanArray::from(self.mark_flags.clone())));
            }
        }

        let schema = probe_output_schema(
            &self.ctx.left_schema,
            &self.ctx.right_schema,
            &self.ctx.left_output_slot_flags,
            &self.ctx.right_output_slot_flags,
            emit_build_columns,
            matches!(join_type, JoinType::RightOuter | JoinType::FullOuter),
            probe_all || have_other_conjuncts || join_type.is_left_semi_anti_family(),
            is_mark_join,
        )?;
        let block = RecordBatch::try_new(schema, columns).map_err(|e| e.to_string())?;

        if have_other_conjuncts {
            let _timer = ScopedTimer::new(Arc::clone(&self.other_conjunct_timer));
            let out = apply_other_conjuncts(
                &self.ctx.arena,
                &self.ctx.other_conjuncts,
                block,
                OtherConjunctArgs {
                    join_type,
                    is_mark_join,
                    visited_map: &self.visited_map,
                    same_to_prev: &self.same_to_prev,
                    row_count_from_last_probe: self.row_count_from_last_probe,
                    multi_matched_output_row_count,
                    is_the_last_sub_block,
                    right_col_idx,
                    right_col_len,
                },
                table,
                &mut self.is_any_probe_match_row_output,
                &mut self.tuple_is_null_left_flags,
                &mut self.tuple_is_null_right_flags,
            )?;
            if let Some(chunk) = out.as_ref() {
                self.rows_returned_counter.add(chunk.len() as i64);
            }
            return Ok(out);
        }

        self.rows_returned_counter.add(size as i64);
        Ok(Some(Chunk::try_new(block)?))
    }

    /// Walk the hash table after probe input is exhausted and emit build rows
    /// whose visited state matches the join mode. Returns the next output
    /// chunk and the end-of-stream flag.
    pub fn process_data_in_hashtable(
        &mut self,
        table: &JoinHashTable,
    ) -> Result<(Option<Chunk>, bool), String> {
        let _timer = ScopedTimer::new(Arc::clone(&self.process_hashtable_timer));
        let join_type = self.ctx.join_type;
        if !join_type.needs_build_drain() {
            return Err(format!(
                "{} join has no build-side rows to drain",
                join_type_str(join_type)
            ));
        }
        if table.flavor() == RowListFlavor::Plain {
            return Err("join build drain requires visited flags".to_string());
        }

        if !self.drain_inited {
            self.drain_inited = true;
            self.drain_group_cursor = 0;
            self.drain_row_cursor = None;
        }
        self.tuple_is_null_left_flags.clear();
        self.tuple_is_null_right_flags.clear();

        let want_visited = join_type == JoinType::RightSemi;
        let mut locs: Vec<(i8, i32)> = Vec::with_capacity(self.batch_size);

        if let Some(mut cursor) = self.drain_row_cursor.take() {
            let rows_list = table.group_rows_slice(cursor.group_id)?;
            self.collect_drain_rows(table, rows_list, &mut cursor.pos, want_visited, &mut locs)?;
            if cursor.pos < rows_list.len() {
                self.drain_row_cursor = Some(cursor);
            } else {
                self.drain_group_cursor += 1;
            }
        }

        while self.drain_row_cursor.is_none()
            && self.drain_group_cursor < table.group_count()
            && locs.len() < self.batch_size
        {
            let group_id = self.drain_group_cursor;
            let selected = match table.flavor() {
                RowListFlavor::KeyVisited => table.key_visited(group_id)? == want_visited,
                _ => true,
            };
            if selected {
                let rows_list = table.group_rows_slice(group_id)?;
                let mut pos = 0usize;
                self.collect_drain_rows(table, rows_list, &mut pos, want_visited, &mut locs)?;
                if pos < rows_list.len() {
                    self.drain_row_cursor = Some(RowListCursor { group_id, pos });
                    break;
                }
            }
            self.drain_group_cursor += 1;
        }

        let eos = self.drain_row_cursor.is_none()
            && self.drain_group_cursor >= table.group_count();
        if locs.is_empty() {
            return Ok((None, eos));
        }

        let right_semi_anti_without_other =
            join_type.is_right_semi_anti() && self.ctx.other_conjuncts.is_empty();
        let include_probe_columns = !right_semi_anti_without_other;

        // Batch the gathers per build block.
        if self.ctx.build_blocks.len() > 1 {
            locs.sort_by(|a, b| b.0.cmp(&a.0));
        }
        let right_only_schema = drain_output_schema(
            &self.ctx.left_schema,
            &self.ctx.right_schema,
            &self.ctx.right_output_slot_flags,
            false,
            join_type == JoinType::FullOuter || !self.ctx.other_conjuncts.is_empty(),
        )?;
        let mut run_batches = Vec::new();
        let mut start = 0usize;
        while start < locs.len() {
            let mut end = start;
            while end < locs.len() && locs[end].0 == locs[start].0 {
                end += 1;
            }
            let block_offset = locs[start].0 as usize;
            let block = self
                .ctx
                .build_blocks
                .get(block_offset)
                .ok_or_else(|| "join build block offset out of bounds".to_string())?;
            let indices =
                UInt32Array::from(locs[start..end].iter().map(|l| l.1 as u32).collect::<Vec<_>>());
            let mut run_columns = Vec::with_capacity(block.columns().len());
            for (i, field) in right_only_schema.fields().iter().enumerate() {
                if !self.ctx.right_output_slot_flags[i] {
                    run_columns.push(arrow::array::new_null_array(field.data_type(), end - start));
                    continue;
                }
                let taken =
                    take(block.columns()[i].as_ref(), &indices, None).map_err(|e| e.to_string())?;
                run_columns.push(taken);
            }
            run_batches.push(
                RecordBatch::try_new(Arc::clone(&right_only_schema), run_columns)
                    .map_err(|e| e.to_string())?,
            );
            start = end;
        }
        let right_batch = if run_batches.len() == 1 {
            run_batches.remove(0)
        } else {
            concat_batches(&right_only_schema, &run_batches).map_err(|e| e.to_string())?
        };

        let schema = drain_output_schema(
            &self.ctx.left_schema,
            &self.ctx.right_schema,
            &self.ctx.right_output_slot_flags,
            include_probe_columns,
            join_type == JoinType::FullOuter || !self.ctx.other_conjuncts.is_empty(),
        )?;
        let size = right_batch.num_rows();
        let mut columns: Vec<ArrayRef> = Vec::new();
        if include_probe_columns {
            columns.extend(null_columns(&self.ctx.left_schema, size));
            if matches!(join_type, JoinType::RightOuter | JoinType::FullOuter) {
                self.tuple_is_null_left_flags
                    .extend(std::iter::repeat(1).take(size));
            }
        }
        columns.extend(right_batch.columns().iter().cloned());

        let block = RecordBatch::try_new(schema, columns).map_err(|e| e.to_string())?;
        self.rows_returned_counter.add(size as i64);
        debug!(
            "HashJoinProbeCore drain: join_type={} rows={} eos={}",
            join_type_str(join_type),
            size,
            eos
        );
        Ok((Some(Chunk::try_new(block)?), eos))
    }

    fn collect_drain_rows(
        &self,
        table: &JoinHashTable,
        rows_list: &[u32],
        pos: &mut usize,
        want_visited: bool,
        locs: &mut Vec<(i8, i32)>,
    ) -> Result<(), String> {
        match table.flavor() {
            RowListFlavor::KeyVisited => {
                // Selection was decided at key level; emit the whole list.
                while *pos < rows_list.len() && locs.len() < self.batch_size {
                    locs.push(table.row_coord(rows_list[*pos])?);
                    *pos += 1;
                }
            }
            RowListFlavor::RowVisited => {
                while *pos < rows_list.len() && locs.len() < self.batch_size {
                    let row_id = rows_list[*pos];
                    if table.row_visited(row_id)? == want_visited {
                        locs.push(table.row_coord(row_id)?);
                    }
                    *pos += 1;
                }
            }
            RowListFlavor::Plain => {
                return Err("join build drain requires visited flags".to_string());
            }
        }
        Ok(())
    }
}
