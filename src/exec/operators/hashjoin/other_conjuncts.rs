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
//! Non-equi conjunct filtering over equi-matched join output.
//!
//! Responsibilities:
//! - Evaluates the other-conjunct list on the assembled block and rewrites
//!   the filter and null maps according to per-join-mode rules.
//! - Maintains the cross-batch state for probe rows whose equi matches were
//!   split over several output blocks.
//! - Updates build-row visited bits once a tuple survives both the equi and
//!   the non-equi predicates.

use arrow::array::{Array, ArrayRef, BooleanArray, RecordBatch};
use arrow::compute::kernels::nullif::nullif;
use arrow::compute::filter_record_batch;
use std::sync::Arc;

use super::JoinType;
use super::join_hash_table::JoinHashTable;
use crate::exec::chunk::Chunk;
use crate::exec::expr::{ExprArena, ExprId};

pub(crate) struct OtherConjunctArgs<'a> {
    pub join_type: JoinType,
    pub is_mark_join: bool,
    pub visited_map: &'a [Option<u32>],
    pub same_to_prev: &'a [bool],
    pub row_count_from_last_probe: usize,
    pub multi_matched_output_row_count: usize,
    pub is_the_last_sub_block: bool,
    pub right_col_idx: usize,
    pub right_col_len: usize,
}

/// Evaluate the conjunct list into one hit byte per row; SQL null counts as a
/// miss.
fn evaluate_conjuncts(
    arena: &ExprArena,
    conjuncts: &[ExprId],
    chunk: &Chunk,
) -> Result<Vec<bool>, String> {
    let mut hits = vec![true; chunk.len()];
    for conjunct in conjuncts {
        let evaluated = arena.eval(*conjunct, chunk)?;
        let mask = evaluated
            .as_any()
            .downcast_ref::<BooleanArray>()
            .ok_or_else(|| "join other conjunct must return a boolean array".to_string())?;
        for (i, hit) in hits.iter_mut().enumerate() {
            *hit &= mask.is_valid(i) && mask.value(i);
        }
    }
    Ok(hits)
}

/// Force right-side columns to null wherever `mask` is set.
fn nullify_right_columns(
    columns: &mut [ArrayRef],
    right_col_idx: usize,
    right_col_len: usize,
    mask: &BooleanArray,
) -> Result<(), String> {
    for column in columns
        .iter_mut()
        .skip(right_col_idx)
        .take(right_col_len)
    {
        *column = nullif(column.as_ref(), mask).map_err(|e| e.to_string())?;
    }
    Ok(())
}

/// Shared handling for the leading continuation rows and the trailing
/// to-be-continued rows of a probe row whose matches span output blocks:
/// every tuple stands on its own other-conjunct result, and
/// `is_any_probe_match_row_output` records whether anything survived.
#[allow(clippy::too_many_arguments)]
fn process_splited_equal_matched_tuples(
    start: usize,
    count: usize,
    other_hit: &[bool],
    visited_map: &[Option<u32>],
    table: &JoinHashTable,
    null_map_data: &mut [bool],
    filter_map: &mut [bool],
    is_any_probe_match_row_output: &mut bool,
) -> Result<(), String> {
    for i in start..start + count {
        let oh = other_hit[i];
        if let Some(row_id) = visited_map[i] {
            table.mark_row_visited(row_id, oh)?;
            null_map_data[i] = !oh;
        } else {
            null_map_data[i] = true;
        }
        filter_map[i] = oh;
    }
    *is_any_probe_match_row_output |= filter_map[start..start + count].iter().any(|v| *v);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn apply_other_conjuncts(
    arena: &ExprArena,
    conjuncts: &[ExprId],
    block: RecordBatch,
    args: OtherConjunctArgs<'_>,
    table: &JoinHashTable,
    is_any_probe_match_row_output: &mut bool,
    tuple_is_null_left_flags: &mut Vec<u8>,
    tuple_is_null_right_flags: &mut Vec<u8>,
) -> Result<Option<Chunk>, String> {
    let row_count = block.num_rows();
    if row_count == 0 {
        return Ok(None);
    }
    if args.visited_map.len() != row_count || args.same_to_prev.len() != row_count {
        return Err("join other conjunct scratch length mismatch".to_string());
    }

    let chunk = Chunk::try_new(block)?;
    let other_hit = evaluate_conjuncts(arena, conjuncts, &chunk)?;
    let schema = chunk.schema();
    let mut columns = chunk.batch.columns().to_vec();

    let prefix = args.row_count_from_last_probe;
    let multi = args.multi_matched_output_row_count;
    let n = row_count;

    let filter_map = match args.join_type {
        JoinType::LeftOuter | JoinType::FullOuter => {
            let mut filter_map = vec![false; n];
            let mut null_map_data = vec![false; n];

            if prefix > 0 {
                process_splited_equal_matched_tuples(
                    0,
                    prefix,
                    &other_hit,
                    args.visited_map,
                    table,
                    &mut null_map_data,
                    &mut filter_map,
                    is_any_probe_match_row_output,
                )?;
                // Last continuation of a spilled probe row with nothing output
                // anywhere: keep one null-padded representative.
                if args.is_the_last_sub_block && !*is_any_probe_match_row_output {
                    filter_map[0] = true;
                    null_map_data[0] = true;
                }
            }

            let end_idx = n - multi;
            for i in prefix..end_idx {
                let oh = other_hit[i];
                if let Some(row_id) = args.visited_map[i] {
                    table.mark_row_visited(row_id, oh)?;
                    null_map_data[i] = !oh;
                    // Within one probe row's run, every other-hit tuple passes;
                    // of the leading other-miss tuples only the last survives
                    // as a null-padded representative, and it is demoted again
                    // once a later sibling passes.
                    filter_map[i] =
                        oh || !args.same_to_prev[i] || (!oh && filter_map[i - 1]);
                    if args.same_to_prev[i] && filter_map[i] && !other_hit[i - 1] {
                        filter_map[i - 1] = false;
                    }
                } else {
                    null_map_data[i] = true;
                    filter_map[i] = true;
                }
            }

            if multi > 0 {
                *is_any_probe_match_row_output = false;
                process_splited_equal_matched_tuples(
                    end_idx,
                    multi,
                    &other_hit,
                    args.visited_map,
                    table,
                    &mut null_map_data,
                    &mut filter_map,
                    is_any_probe_match_row_output,
                )?;
            }

            let nullify_mask = BooleanArray::from(
                other_hit.iter().map(|hit| !*hit).collect::<Vec<_>>(),
            );
            nullify_right_columns(
                &mut columns,
                args.right_col_idx,
                args.right_col_len,
                &nullify_mask,
            )?;

            let mut survivors = 0usize;
            for i in 0..n {
                if filter_map[i] {
                    tuple_is_null_right_flags.push(null_map_data[i] as u8);
                    survivors += 1;
                }
            }
            if args.join_type == JoinType::FullOuter {
                tuple_is_null_left_flags.extend(std::iter::repeat(0).take(survivors));
            }
            filter_map
        }
        JoinType::LeftSemi => {
            let mut filter_map = Vec::with_capacity(n);
            let mut start_row_idx = 1usize;
            if prefix > 0 && *is_any_probe_match_row_output {
                // A tuple for this probe row was already output; every
                // continuation tuple is dropped.
                filter_map.extend(std::iter::repeat(false).take(prefix));
                start_row_idx += prefix;
                if prefix < n {
                    filter_map.push(other_hit[prefix]);
                }
            } else {
                filter_map.push(other_hit[0]);
            }
            for i in start_row_idx..n {
                if other_hit[i] || (args.same_to_prev[i] && filter_map[i - 1]) {
                    // Only the last passing tuple of a run stays marked.
                    filter_map.push(true);
                    filter_map[i - 1] = !args.same_to_prev[i] && filter_map[i - 1];
                } else {
                    filter_map.push(false);
                }
            }

            if multi > 0 {
                *is_any_probe_match_row_output = filter_map[n - 1];
            } else if prefix > 0
                && !*is_any_probe_match_row_output
                && filter_map[prefix - 1]
            {
                *is_any_probe_match_row_output = true;
            }

            if args.is_mark_join {
                let mut mark_values = vec![false; n];
                for i in 1..n {
                    if !args.same_to_prev[i] {
                        mark_values[i - 1] = filter_map[i - 1];
                        filter_map[i - 1] = true;
                    }
                }
                mark_values[n - 1] = filter_map[n - 1];
                filter_map[n - 1] = true;
                let last = columns.len() - 1;
                columns[last] = Arc::new(BooleanArray::from(mark_values));
            }
            filter_map
        }
        JoinType::LeftAnti | JoinType::NullAwareLeftAnti => {
            // The probe row survives only when no tuple passed both the equi
            // and the other conjuncts; `pass` ripples along each run and the
            // run's representative is inverted at the end.
            let mut filter_map = vec![false; n];
            let mut start_row_idx = 1usize;
            if prefix > 0 && *is_any_probe_match_row_output {
                start_row_idx += prefix;
                if prefix < n {
                    filter_map[prefix] =
                        other_hit[prefix] && args.visited_map[prefix].is_some();
                }
            } else {
                filter_map[0] = other_hit[0] && args.visited_map[0].is_some();
            }
            for i in start_row_idx..n {
                if (args.visited_map[i].is_some() && other_hit[i])
                    || (args.same_to_prev[i] && filter_map[i - 1])
                {
                    filter_map[i] = true;
                    filter_map[i - 1] = !args.same_to_prev[i] && filter_map[i - 1];
                } else {
                    filter_map[i] = false;
                }
            }

            if args.is_mark_join {
                let mut mark_values = vec![false; n];
                for i in 1..n {
                    if !args.same_to_prev[i] {
                        mark_values[i - 1] = !filter_map[i - 1];
                        filter_map[i - 1] = true;
                    }
                }
                mark_values[n - 1] = !filter_map[n - 1];
                filter_map[n - 1] = true;
                let last = columns.len() - 1;
                columns[last] = Arc::new(BooleanArray::from(mark_values));
            } else {
                let end_row_idx;
                if prefix > 0 {
                    end_row_idx = n - multi;
                    if !*is_any_probe_match_row_output {
                        if filter_map[prefix - 1] {
                            *is_any_probe_match_row_output = true;
                            filter_map[prefix - 1] = false;
                        }
                        if args.is_the_last_sub_block && !*is_any_probe_match_row_output {
                            // Nothing survived in any sub-block; output one
                            // tuple for this probe row.
                            filter_map[0] = true;
                        }
                    }
                    if multi > 0 {
                        *is_any_probe_match_row_output = filter_map[n - 1];
                        filter_map[n - 1] = false;
                    }
                } else if multi > 0 {
                    end_row_idx = n - multi;
                    *is_any_probe_match_row_output = filter_map[n - 1];
                    filter_map[n - 1] = false;
                } else {
                    end_row_idx = n;
                }

                for i in (1 + prefix)..end_row_idx {
                    if !args.same_to_prev[i] {
                        filter_map[i - 1] = !filter_map[i - 1];
                    }
                }
                let non_sub_blocks_matched_row_count = n - prefix - multi;
                if non_sub_blocks_matched_row_count > 0 {
                    filter_map[end_row_idx - 1] = !filter_map[end_row_idx - 1];
                }
            }
            filter_map
        }
        JoinType::RightSemi | JoinType::RightAnti => {
            for (i, visited) in args.visited_map.iter().enumerate() {
                let row_id = visited
                    .ok_or_else(|| "join right semi/anti tuple missing build row".to_string())?;
                table.mark_row_visited(row_id, other_hit[i])?;
            }
            return Ok(None);
        }
        JoinType::RightOuter => {
            let mut survivors = 0usize;
            for (i, visited) in args.visited_map.iter().enumerate() {
                let row_id = visited
                    .ok_or_else(|| "join right outer tuple missing build row".to_string())?;
                table.mark_row_visited(row_id, other_hit[i])?;
                survivors += other_hit[i] as usize;
            }
            tuple_is_null_left_flags.extend(std::iter::repeat(0).take(survivors));
            other_hit.clone()
        }
        JoinType::Inner => other_hit.clone(),
    };

    let block = RecordBatch::try_new(schema, columns).map_err(|e| e.to_string())?;
    let filter = BooleanArray::from(filter_map);
    let filtered = filter_record_batch(&block, &filter).map_err(|e| e.to_string())?;

    let final_batch = match args.join_type {
        JoinType::LeftSemi | JoinType::LeftAnti | JoinType::NullAwareLeftAnti => {
            let mut keep: Vec<usize> = (0..args.right_col_idx).collect();
            if args.is_mark_join {
                keep.push(filtered.num_columns() - 1);
            }
            filtered.project(&keep).map_err(|e| e.to_string())?
        }
        _ => filtered,
    };

    if final_batch.num_rows() == 0 {
        return Ok(None);
    }
    Ok(Some(Chunk::try_new(final_batch)?))
}
