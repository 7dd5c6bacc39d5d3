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
//! Integration tests for the hash-join probe engine.

use std::sync::Arc;

use arrow::array::{Array, BooleanArray, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;

use novajoin::common::ids::SlotId;
use novajoin::exec::chunk::{Chunk, field_with_slot_id};
use novajoin::exec::expr::{ExprArena, ExprId, ExprNode, LiteralValue};
use novajoin::exec::operators::hashjoin::{
    HashJoinProbeContext, HashJoinProbeCore, JoinHashTable, JoinType, RowListFlavor,
};
use novajoin::runtime::mem_tracker::MemTracker;
use novajoin::runtime::profile::RuntimeProfile;

const L_KEY: u32 = 1;
const R_KEY: u32 = 10;
const R_STR: u32 = 11;
const R_NUM: u32 = 12;

fn probe_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![field_with_slot_id(
        Field::new("l_key", DataType::Int64, true),
        SlotId::new(L_KEY),
    )]))
}

fn build_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        field_with_slot_id(Field::new("r_key", DataType::Int64, true), SlotId::new(R_KEY)),
        field_with_slot_id(Field::new("r_str", DataType::Utf8, true), SlotId::new(R_STR)),
        field_with_slot_id(Field::new("r_num", DataType::Int64, true), SlotId::new(R_NUM)),
    ]))
}

fn probe_chunk(keys: &[Option<i64>]) -> Chunk {
    let batch = RecordBatch::try_new(
        probe_schema(),
        vec![Arc::new(Int64Array::from(keys.to_vec()))],
    )
    .expect("probe batch");
    Chunk::new(batch)
}

fn build_chunk(rows: &[(Option<i64>, &str, i64)]) -> Chunk {
    let keys: Vec<Option<i64>> = rows.iter().map(|r| r.0).collect();
    let strs: Vec<&str> = rows.iter().map(|r| r.1).collect();
    let nums: Vec<i64> = rows.iter().map(|r| r.2).collect();
    let batch = RecordBatch::try_new(
        build_schema(),
        vec![
            Arc::new(Int64Array::from(keys)),
            Arc::new(StringArray::from(strs)),
            Arc::new(Int64Array::from(nums)),
        ],
    )
    .expect("build batch");
    Chunk::new(batch)
}

fn build_table(blocks: &[Chunk], flavor: RowListFlavor) -> JoinHashTable {
    let mut table = JoinHashTable::new(vec![DataType::Int64], flavor).expect("table");
    for (offset, block) in blocks.iter().enumerate() {
        let keys = vec![block.column_by_slot_id(SlotId::new(R_KEY)).expect("r_key")];
        table
            .add_build_block(&keys, block.len(), offset)
            .expect("add build block");
    }
    table.finalize().expect("finalize");
    table
}

struct Fixture {
    core: HashJoinProbeCore,
    table: JoinHashTable,
}

/// `conjunct` builds the non-equi predicate ids from the arena, e.g.
/// `r_num > 10`.
fn fixture_with(
    join_type: JoinType,
    blocks: Vec<Chunk>,
    flavor: RowListFlavor,
    batch_size: usize,
    ignore_null: bool,
    conjunct: impl FnOnce(&mut ExprArena) -> Vec<ExprId>,
) -> Fixture {
    let mut arena = ExprArena::default();
    let probe_key = arena.push(ExprNode::SlotId(SlotId::new(L_KEY)));
    let other_conjuncts = conjunct(&mut arena);
    let table = build_table(&blocks, flavor);
    let ctx = HashJoinProbeContext {
        arena: Arc::new(arena),
        join_type,
        probe_key_exprs: vec![probe_key],
        other_conjuncts,
        build_blocks: Arc::new(blocks),
        left_schema: probe_schema(),
        right_schema: build_schema(),
        left_output_slot_flags: vec![true],
        right_output_slot_flags: vec![true; 3],
        ignore_null,
        profile: RuntimeProfile::new(),
        mem_tracker: MemTracker::new_root("test-join"),
    };
    let core = HashJoinProbeCore::new(ctx, batch_size).expect("core");
    Fixture { core, table }
}

fn fixture(
    join_type: JoinType,
    blocks: Vec<Chunk>,
    flavor: RowListFlavor,
    batch_size: usize,
) -> Fixture {
    fixture_with(join_type, blocks, flavor, batch_size, true, |_| Vec::new())
}

fn gt_conjunct(slot: u32, value: i64) -> impl FnOnce(&mut ExprArena) -> Vec<ExprId> {
    move |arena| {
        let col = arena.push(ExprNode::SlotId(SlotId::new(slot)));
        let lit = arena.push(ExprNode::Literal(LiteralValue::Int64(value)));
        vec![arena.push(ExprNode::Gt(col, lit))]
    }
}

fn run_to_exhaustion(
    fixture: &mut Fixture,
    probe: &Chunk,
    is_mark_join: bool,
    have_other_conjuncts: bool,
) -> Vec<Chunk> {
    fixture.core.prepare_probe_chunk(probe).expect("prepare");
    let mut out = Vec::new();
    while !fixture.core.probe_exhausted() {
        if let Some(chunk) = fixture
            .core
            .process(&fixture.table, is_mark_join, have_other_conjuncts)
            .expect("process")
        {
            out.push(chunk);
        }
    }
    out
}

fn drain_to_eos(fixture: &mut Fixture) -> Vec<Chunk> {
    let mut out = Vec::new();
    loop {
        let (chunk, eos) = fixture
            .core
            .process_data_in_hashtable(&fixture.table)
            .expect("drain");
        if let Some(chunk) = chunk {
            out.push(chunk);
        }
        if eos {
            break;
        }
    }
    out
}

fn i64_col(chunk: &Chunk, slot: u32) -> Vec<Option<i64>> {
    let array = chunk.column_by_slot_id(SlotId::new(slot)).expect("slot");
    let array = array.as_any().downcast_ref::<Int64Array>().expect("i64");
    (0..array.len())
        .map(|i| array.is_valid(i).then(|| array.value(i)))
        .collect()
}

fn str_col(chunk: &Chunk, slot: u32) -> Vec<Option<String>> {
    let array = chunk.column_by_slot_id(SlotId::new(slot)).expect("slot");
    let array = array.as_any().downcast_ref::<StringArray>().expect("utf8");
    (0..array.len())
        .map(|i| array.is_valid(i).then(|| array.value(i).to_string()))
        .collect()
}

fn mark_col(chunk: &Chunk) -> Vec<bool> {
    let array = chunk.columns().last().expect("mark column");
    let array = array.as_any().downcast_ref::<BooleanArray>().expect("bool");
    (0..array.len()).map(|i| array.value(i)).collect()
}

fn flat_i64(chunks: &[Chunk], slot: u32) -> Vec<Option<i64>> {
    chunks.iter().flat_map(|c| i64_col(c, slot)).collect()
}

#[test]
fn inner_single_block_single_matches() {
    let block = build_chunk(&[(Some(1), "a", 10), (Some(2), "b", 20), (Some(3), "c", 30)]);
    let mut f = fixture(JoinType::Inner, vec![block], RowListFlavor::Plain, 4096);
    let out = run_to_exhaustion(&mut f, &probe_chunk(&[Some(3), Some(1), Some(1), Some(4)]), false, false);

    assert_eq!(flat_i64(&out, L_KEY), vec![Some(3), Some(1), Some(1)]);
    let strs: Vec<Option<String>> = out.iter().flat_map(|c| str_col(c, R_STR)).collect();
    assert_eq!(
        strs,
        vec![
            Some("c".to_string()),
            Some("a".to_string()),
            Some("a".to_string())
        ]
    );
}

#[test]
fn inner_multi_block_gather() {
    let first = build_chunk(&[(Some(1), "a", 10)]);
    let second = build_chunk(&[(Some(2), "b", 20), (Some(1), "a2", 11)]);
    let mut f = fixture(JoinType::Inner, vec![first, second], RowListFlavor::Plain, 4096);
    let out = run_to_exhaustion(&mut f, &probe_chunk(&[Some(1), Some(2)]), false, false);

    assert_eq!(flat_i64(&out, L_KEY), vec![Some(1), Some(1), Some(2)]);
    let strs: Vec<Option<String>> = out.iter().flat_map(|c| str_col(c, R_STR)).collect();
    assert_eq!(
        strs,
        vec![
            Some("a".to_string()),
            Some("a2".to_string()),
            Some("b".to_string())
        ]
    );
}

#[test]
fn left_outer_explosion_across_batches() {
    let block = build_chunk(&[
        (Some(7), "v0", 0),
        (Some(7), "v1", 1),
        (Some(7), "v2", 2),
        (Some(7), "v3", 3),
        (Some(7), "v4", 4),
    ]);
    let mut f = fixture(JoinType::LeftOuter, vec![block], RowListFlavor::Plain, 2);
    f.core.prepare_probe_chunk(&probe_chunk(&[Some(7)])).unwrap();

    let sizes: Vec<usize> = (0..4)
        .map(|_| {
            f.core
                .process(&f.table, false, false)
                .unwrap()
                .map(|c| c.len())
                .unwrap_or(0)
        })
        .collect();
    assert_eq!(sizes, vec![2, 2, 1, 0]);
    assert!(f.core.probe_exhausted());
}

#[test]
fn left_outer_pads_unmatched_probe_rows() {
    let block = build_chunk(&[(Some(1), "a", 10)]);
    let mut f = fixture(JoinType::LeftOuter, vec![block], RowListFlavor::Plain, 4096);
    f.core
        .prepare_probe_chunk(&probe_chunk(&[Some(1), Some(99)]))
        .unwrap();
    let chunk = f.core.process(&f.table, false, false).unwrap().expect("chunk");

    assert_eq!(i64_col(&chunk, L_KEY), vec![Some(1), Some(99)]);
    assert_eq!(i64_col(&chunk, R_KEY), vec![Some(1), None]);
    assert_eq!(f.core.tuple_is_null_right_flags(), &[0, 1]);
}

#[test]
fn left_outer_ignores_null_probe_keys_with_padding() {
    let block = build_chunk(&[(Some(1), "a", 10)]);
    let mut f = fixture(JoinType::LeftOuter, vec![block], RowListFlavor::Plain, 4096);
    let out = run_to_exhaustion(&mut f, &probe_chunk(&[Some(1), None]), false, false);

    assert_eq!(flat_i64(&out, L_KEY), vec![Some(1), None]);
    assert_eq!(flat_i64(&out, R_KEY), vec![Some(1), None]);
}

#[test]
fn left_anti_with_other_conjuncts_split_across_batches() {
    let block = build_chunk(&[(Some(5), "x", 1), (Some(5), "y", 2), (Some(5), "z", 3)]);
    let mut f = fixture_with(
        JoinType::LeftAnti,
        vec![block],
        RowListFlavor::RowVisited,
        2,
        true,
        gt_conjunct(R_NUM, 10),
    );
    let out = run_to_exhaustion(&mut f, &probe_chunk(&[Some(5)]), false, true);

    // Every equi match fails the other conjunct, so exactly one null-padded
    // representative survives, produced by the final sub-block.
    let rows: Vec<Option<i64>> = flat_i64(&out, L_KEY);
    assert_eq!(rows, vec![Some(5)]);
    // Anti output keeps only probe-side columns.
    assert_eq!(out.iter().map(|c| c.columns().len()).max(), Some(1));
}

#[test]
fn left_anti_with_other_conjuncts_suppressed_when_any_match_passes() {
    let block = build_chunk(&[(Some(5), "x", 1), (Some(5), "y", 20), (Some(5), "z", 3)]);
    let mut f = fixture_with(
        JoinType::LeftAnti,
        vec![block],
        RowListFlavor::RowVisited,
        2,
        true,
        gt_conjunct(R_NUM, 10),
    );
    let out = run_to_exhaustion(&mut f, &probe_chunk(&[Some(5)]), false, true);
    assert_eq!(flat_i64(&out, L_KEY), Vec::<Option<i64>>::new());
}

#[test]
fn left_semi_mark_join_emits_match_column() {
    let block = build_chunk(&[(Some(2), "b", 20)]);
    let mut f = fixture(JoinType::LeftSemi, vec![block], RowListFlavor::Plain, 4096);
    let out = run_to_exhaustion(
        &mut f,
        &probe_chunk(&[Some(1), Some(2), Some(3)]),
        true,
        false,
    );

    assert_eq!(out.len(), 1);
    assert_eq!(i64_col(&out[0], L_KEY), vec![Some(1), Some(2), Some(3)]);
    assert_eq!(mark_col(&out[0]), vec![false, true, false]);
}

#[test]
fn left_semi_with_other_conjuncts_emits_one_row_per_probe_row() {
    let block = build_chunk(&[(Some(5), "x", 1), (Some(5), "y", 20), (Some(5), "z", 30)]);
    let mut f = fixture_with(
        JoinType::LeftSemi,
        vec![block],
        RowListFlavor::RowVisited,
        4096,
        true,
        gt_conjunct(R_NUM, 10),
    );
    let out = run_to_exhaustion(&mut f, &probe_chunk(&[Some(5), Some(6)]), false, true);
    assert_eq!(flat_i64(&out, L_KEY), vec![Some(5)]);
}

#[test]
fn left_semi_mark_with_other_conjuncts() {
    let block = build_chunk(&[(Some(2), "b", 5), (Some(2), "bb", 20)]);
    let mut f = fixture_with(
        JoinType::LeftSemi,
        vec![block],
        RowListFlavor::RowVisited,
        4096,
        true,
        gt_conjunct(R_NUM, 10),
    );
    let out = run_to_exhaustion(&mut f, &probe_chunk(&[Some(1), Some(2)]), true, true);

    assert_eq!(out.len(), 1);
    assert_eq!(i64_col(&out[0], L_KEY), vec![Some(1), Some(2)]);
    assert_eq!(mark_col(&out[0]), vec![false, true]);
}

#[test]
fn right_anti_drain_emits_unmatched_build_rows() {
    let block = build_chunk(&[(Some(1), "a", 10), (Some(2), "b", 20), (Some(3), "c", 30)]);
    let mut f = fixture(JoinType::RightAnti, vec![block], RowListFlavor::KeyVisited, 4096);
    let out = run_to_exhaustion(&mut f, &probe_chunk(&[Some(2)]), false, false);
    assert!(out.is_empty());

    let drained = drain_to_eos(&mut f);
    let mut keys: Vec<Option<i64>> = drained.iter().flat_map(|c| i64_col(c, R_KEY)).collect();
    keys.sort();
    assert_eq!(keys, vec![Some(1), Some(3)]);

    // Draining once more reports end-of-stream with no rows.
    let (chunk, eos) = f.core.process_data_in_hashtable(&f.table).unwrap();
    assert!(chunk.is_none());
    assert!(eos);
}

#[test]
fn right_semi_drain_emits_matched_build_rows() {
    let block = build_chunk(&[(Some(1), "a", 10), (Some(2), "b", 20)]);
    let mut f = fixture(JoinType::RightSemi, vec![block], RowListFlavor::KeyVisited, 4096);
    let out = run_to_exhaustion(&mut f, &probe_chunk(&[Some(2), Some(2)]), false, false);
    assert!(out.is_empty());

    let drained = drain_to_eos(&mut f);
    assert_eq!(flat_i64(&drained, R_KEY), vec![Some(2)]);
}

#[test]
fn null_aware_left_anti_suppresses_null_probe_keys() {
    let block = build_chunk(&[(Some(1), "a", 10)]);
    let mut f = fixture_with(
        JoinType::NullAwareLeftAnti,
        vec![block],
        RowListFlavor::Plain,
        4096,
        false,
        |_| Vec::new(),
    );
    let out = run_to_exhaustion(&mut f, &probe_chunk(&[Some(1), None]), false, false);
    assert!(out.is_empty(), "null key and matched key must both be suppressed");
}

#[test]
fn null_aware_left_anti_keeps_everything_on_empty_build() {
    let mut f = fixture_with(
        JoinType::NullAwareLeftAnti,
        Vec::new(),
        RowListFlavor::Plain,
        4096,
        false,
        |_| Vec::new(),
    );
    let out = run_to_exhaustion(&mut f, &probe_chunk(&[Some(1), None]), false, false);
    assert_eq!(flat_i64(&out, L_KEY), vec![Some(1), None]);
}

#[test]
fn resumption_matches_single_call_output() {
    let block = build_chunk(&[
        (Some(9), "a", 0),
        (Some(9), "b", 1),
        (Some(9), "c", 2),
        (Some(9), "d", 3),
        (Some(9), "e", 4),
        (Some(9), "f", 5),
        (Some(9), "g", 6),
        (Some(8), "h", 7),
    ]);
    let probe = probe_chunk(&[Some(9), Some(8), Some(9)]);

    let mut small = fixture(JoinType::Inner, vec![block.clone()], RowListFlavor::Plain, 3);
    let small_out = run_to_exhaustion(&mut small, &probe, false, false);
    for chunk in &small_out {
        assert!(chunk.len() <= 3);
    }

    let mut large = fixture(JoinType::Inner, vec![block], RowListFlavor::Plain, 1000);
    let large_out = run_to_exhaustion(&mut large, &probe, false, false);

    assert_eq!(flat_i64(&small_out, L_KEY), flat_i64(&large_out, L_KEY));
    assert_eq!(flat_i64(&small_out, R_NUM), flat_i64(&large_out, R_NUM));
}

#[test]
fn split_probe_input_matches_single_batch() {
    let block = build_chunk(&[(Some(1), "a", 10), (Some(3), "c", 30)]);

    let mut whole = fixture(JoinType::Inner, vec![block.clone()], RowListFlavor::Plain, 4096);
    let whole_out = run_to_exhaustion(
        &mut whole,
        &probe_chunk(&[Some(3), Some(1), Some(1), Some(4)]),
        false,
        false,
    );

    let mut split = fixture(JoinType::Inner, vec![block], RowListFlavor::Plain, 4096);
    let mut split_out = run_to_exhaustion(&mut split, &probe_chunk(&[Some(3), Some(1)]), false, false);
    split_out.extend(run_to_exhaustion(
        &mut split,
        &probe_chunk(&[Some(1), Some(4)]),
        false,
        false,
    ));

    assert_eq!(flat_i64(&whole_out, L_KEY), flat_i64(&split_out, L_KEY));
    assert_eq!(flat_i64(&whole_out, R_KEY), flat_i64(&split_out, R_KEY));
}

#[test]
fn right_outer_conjunct_updates_visited_bits_and_drains_rest() {
    let block = build_chunk(&[(Some(2), "b", 10), (Some(2), "bb", 20)]);
    let mut f = fixture_with(
        JoinType::RightOuter,
        vec![block],
        RowListFlavor::RowVisited,
        4096,
        true,
        gt_conjunct(R_NUM, 15),
    );
    let out = run_to_exhaustion(&mut f, &probe_chunk(&[Some(2)]), false, true);
    assert_eq!(flat_i64(&out, R_NUM), vec![Some(20)]);
    assert_eq!(f.core.tuple_is_null_left_flags(), &[0]);

    let drained = drain_to_eos(&mut f);
    assert_eq!(flat_i64(&drained, R_NUM), vec![Some(10)]);
    assert_eq!(flat_i64(&drained, L_KEY), vec![None]);
    assert_eq!(f.core.tuple_is_null_left_flags(), &[1]);
}

#[test]
fn full_outer_pads_both_sides() {
    let block = build_chunk(&[(Some(1), "a", 10), (Some(2), "b", 20)]);
    let mut f = fixture(JoinType::FullOuter, vec![block], RowListFlavor::KeyVisited, 4096);
    let out = run_to_exhaustion(&mut f, &probe_chunk(&[Some(1), Some(4)]), false, false);

    assert_eq!(flat_i64(&out, L_KEY), vec![Some(1), Some(4)]);
    assert_eq!(flat_i64(&out, R_KEY), vec![Some(1), None]);
    assert_eq!(f.core.tuple_is_null_right_flags(), &[0, 1]);

    let drained = drain_to_eos(&mut f);
    assert_eq!(flat_i64(&drained, L_KEY), vec![None]);
    assert_eq!(flat_i64(&drained, R_KEY), vec![Some(2)]);
    assert_eq!(f.core.tuple_is_null_left_flags(), &[1]);
}

#[test]
fn left_outer_conjunct_keeps_passing_tuples_only() {
    let block = build_chunk(&[(Some(3), "lo", 5), (Some(3), "hi", 20)]);
    let mut f = fixture_with(
        JoinType::LeftOuter,
        vec![block],
        RowListFlavor::RowVisited,
        4096,
        true,
        gt_conjunct(R_NUM, 10),
    );
    let out = run_to_exhaustion(&mut f, &probe_chunk(&[Some(3), Some(8)]), false, true);

    assert_eq!(flat_i64(&out, L_KEY), vec![Some(3), Some(8)]);
    assert_eq!(flat_i64(&out, R_NUM), vec![Some(20), None]);
    assert_eq!(f.core.tuple_is_null_right_flags(), &[0, 1]);
}

#[test]
fn left_outer_conjunct_emits_null_padded_representative() {
    let block = build_chunk(&[(Some(3), "lo", 5), (Some(3), "lo2", 6)]);
    let mut f = fixture_with(
        JoinType::LeftOuter,
        vec![block],
        RowListFlavor::RowVisited,
        4096,
        true,
        gt_conjunct(R_NUM, 10),
    );
    let out = run_to_exhaustion(&mut f, &probe_chunk(&[Some(3)]), false, true);

    assert_eq!(flat_i64(&out, L_KEY), vec![Some(3)]);
    assert_eq!(flat_i64(&out, R_NUM), vec![None]);
    assert_eq!(f.core.tuple_is_null_right_flags(), &[1]);
}

#[test]
fn output_row_count_stays_under_batch_size() {
    let rows: Vec<(Option<i64>, &str, i64)> =
        (0..10).map(|i| (Some(7), "v", i as i64)).collect();
    let block = build_chunk(&rows);
    let mut f = fixture(JoinType::LeftOuter, vec![block], RowListFlavor::Plain, 3);
    f.core.prepare_probe_chunk(&probe_chunk(&[Some(7), Some(1)])).unwrap();
    let mut total = 0usize;
    while !f.core.probe_exhausted() {
        if let Some(chunk) = f.core.process(&f.table, false, false).unwrap() {
            assert!(chunk.len() <= 3);
            total += chunk.len();
        }
    }
    // 10 matches plus one padded row for the unmatched probe key.
    assert_eq!(total, 11);
}

#[test]
fn rejects_other_conjuncts_without_row_level_flags() {
    let block = build_chunk(&[(Some(1), "a", 10)]);
    let mut f = fixture_with(
        JoinType::Inner,
        vec![block],
        RowListFlavor::Plain,
        4096,
        true,
        gt_conjunct(R_NUM, 10),
    );
    f.core.prepare_probe_chunk(&probe_chunk(&[Some(1)])).unwrap();
    let err = f.core.process(&f.table, false, true).unwrap_err();
    assert!(err.contains("per-row visited flags"), "err={}", err);
}

#[test]
fn rejects_drain_without_visited_flags() {
    let block = build_chunk(&[(Some(1), "a", 10)]);
    let mut f = fixture(JoinType::RightAnti, vec![block], RowListFlavor::Plain, 4096);
    let err = f.core.process_data_in_hashtable(&f.table).unwrap_err();
    assert!(err.contains("visited"), "err={}", err);
}

#[test]
fn rejects_drain_for_probe_only_join_types() {
    let block = build_chunk(&[(Some(1), "a", 10)]);
    let mut f = fixture(JoinType::Inner, vec![block], RowListFlavor::Plain, 4096);
    let err = f.core.process_data_in_hashtable(&f.table).unwrap_err();
    assert!(err.contains("no build-side rows to drain"), "err={}", err);
}
