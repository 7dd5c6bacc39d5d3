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
//! Columnar output assembly for the hash-join probe engine.
//!
//! Responsibilities:
//! - Expands scratch row coordinates into build-side output columns, with
//!   null padding for the `(-1, -1)` sentinel.
//! - Replicates or range-copies probe-side columns by probe-row index.
//! - Builds the joined output schemas, forcing nullability where padding or
//!   conjunct nullification can introduce nulls.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, UInt32Array, new_null_array};
use arrow::compute::{interleave, take};
use arrow::datatypes::{DataType, Field, Fields, Schema, SchemaRef};

use crate::common::ids::SlotId;
use crate::exec::chunk::{Chunk, field_slot_id, field_with_slot_id};

/// Name of the trailing mark-join output column.
pub(crate) const MARK_COLUMN_NAME: &str = "__join_match";

/// Gather build-side output columns by `(block_offset, row_num)` coordinates.
///
/// A `-1` block offset produces a null row. The single-block case is one
/// `take` per column with a null-masked index vector; multiple blocks go
/// through `interleave` with a one-row null array serving the padding slot.
pub(crate) fn gather_build_columns(
    build_blocks: &[Chunk],
    build_block_offsets: &[i8],
    build_block_rows: &[i32],
    size: usize,
    right_schema: &SchemaRef,
    right_output_slot_flags: &[bool],
) -> Result<Vec<ArrayRef>, String> {
    if build_block_offsets.len() < size || build_block_rows.len() < size {
        return Err("join build coordinate scratch shorter than output size".to_string());
    }
    let right_fields = right_schema.fields();
    if right_output_slot_flags.len() != right_fields.len() {
        return Err("join right output slot flag count mismatch".to_string());
    }

    let mut columns = Vec::with_capacity(right_fields.len());
    if build_blocks.is_empty() {
        // Every coordinate is the padding sentinel.
        for field in right_fields {
            columns.push(new_null_array(field.data_type(), size));
        }
        return Ok(columns);
    }
    if build_blocks.len() == 1 {
        let indices: UInt32Array = (0..size)
            .map(|j| {
                let row = build_block_rows[j];
                (row >= 0).then_some(row as u32)
            })
            .collect();
        for (i, field) in right_fields.iter().enumerate() {
            if !right_output_slot_flags[i] {
                columns.push(new_null_array(field.data_type(), size));
                continue;
            }
            let block = build_blocks
                .first()
                .ok_or_else(|| "join build block missing".to_string())?;
            let source = block
                .columns()
                .get(i)
                .ok_or_else(|| "join build column out of bounds".to_string())?;
            let taken = take(source.as_ref(), &indices, None).map_err(|e| e.to_string())?;
            columns.push(taken);
        }
        return Ok(columns);
    }

    let mut indices = Vec::with_capacity(size);
    for j in 0..size {
        let offset = build_block_offsets[j];
        if offset < 0 {
            indices.push((build_blocks.len(), 0));
        } else {
            let slot = offset as usize;
            if slot >= build_blocks.len() {
                return Err("join build block offset out of bounds".to_string());
            }
            indices.push((slot, build_block_rows[j] as usize));
        }
    }
    for (i, field) in right_fields.iter().enumerate() {
        if !right_output_slot_flags[i] {
            columns.push(new_null_array(field.data_type(), size));
            continue;
        }
        let mut sources = Vec::with_capacity(build_blocks.len() + 1);
        for block in build_blocks {
            sources.push(
                block
                    .columns()
                    .get(i)
                    .ok_or_else(|| "join build column out of bounds".to_string())?
                    .clone(),
            );
        }
        sources.push(new_null_array(field.data_type(), 1));
        let refs: Vec<&dyn Array> = sources.iter().map(|a| a.as_ref()).collect();
        let merged = interleave(&refs, &indices).map_err(|e| e.to_string())?;
        columns.push(merged);
    }
    Ok(columns)
}

/// Produce probe-side output columns, range-copying when every probe row in
/// this call emitted exactly one contiguous tuple.
pub(crate) fn gather_probe_columns(
    probe: &Chunk,
    probe_indexs: &[u32],
    size: usize,
    all_match_one: bool,
    last_probe_index: usize,
    probe_size: usize,
    left_output_slot_flags: &[bool],
) -> Result<Vec<ArrayRef>, String> {
    let fields = probe.schema().fields().clone();
    if left_output_slot_flags.len() != fields.len() {
        return Err("join left output slot flag count mismatch".to_string());
    }

    let mut columns = Vec::with_capacity(fields.len());
    if all_match_one {
        if last_probe_index + probe_size > probe.len() || probe_size != size {
            return Err("join probe range copy out of bounds".to_string());
        }
        for (i, field) in fields.iter().enumerate() {
            if !left_output_slot_flags[i] {
                columns.push(new_null_array(field.data_type(), size));
                continue;
            }
            columns.push(probe.columns()[i].slice(last_probe_index, probe_size));
        }
        return Ok(columns);
    }

    if probe_indexs.len() < size {
        return Err("join probe index scratch shorter than output size".to_string());
    }
    let indices = UInt32Array::from(probe_indexs[..size].to_vec());
    for (i, field) in fields.iter().enumerate() {
        if !left_output_slot_flags[i] {
            columns.push(new_null_array(field.data_type(), size));
            continue;
        }
        let taken = take(probe.columns()[i].as_ref(), &indices, None).map_err(|e| e.to_string())?;
        columns.push(taken);
    }
    Ok(columns)
}

/// All-null columns matching `schema`, used to pad the absent side of a
/// drained block.
pub(crate) fn null_columns(schema: &SchemaRef, len: usize) -> Vec<ArrayRef> {
    schema
        .fields()
        .iter()
        .map(|field| new_null_array(field.data_type(), len))
        .collect()
}

fn forced_fields(
    schema: &SchemaRef,
    force_nullable: bool,
    output_slot_flags: &[bool],
) -> Vec<Field> {
    schema
        .fields()
        .iter()
        .enumerate()
        .map(|(i, field)| {
            let retained = output_slot_flags.get(i).copied().unwrap_or(true);
            let nullable = field.is_nullable() || force_nullable || !retained;
            field.as_ref().clone().with_nullable(nullable)
        })
        .collect()
}

fn max_slot_id(schemas: &[&SchemaRef]) -> Result<u32, String> {
    let mut max = 0u32;
    for schema in schemas {
        for field in schema.fields() {
            let slot = field_slot_id(field.as_ref())?
                .ok_or_else(|| format!("join schema field {} missing slot id", field.name()))?;
            max = max.max(slot.as_u32());
        }
    }
    Ok(max)
}

pub(crate) fn mark_field(left: &SchemaRef, right: &SchemaRef) -> Result<Field, String> {
    let slot = max_slot_id(&[left, right])? + 1;
    Ok(field_with_slot_id(
        Field::new(MARK_COLUMN_NAME, DataType::Boolean, false),
        SlotId::new(slot),
    ))
}

/// Intermediate output schema for probe-phase blocks: probe fields, build
/// fields unless the mode omits them, and the trailing mark field.
pub(crate) fn probe_output_schema(
    left_schema: &SchemaRef,
    right_schema: &SchemaRef,
    left_output_slot_flags: &[bool],
    right_output_slot_flags: &[bool],
    include_build_columns: bool,
    force_left_nullable: bool,
    force_right_nullable: bool,
    with_mark: bool,
) -> Result<SchemaRef, String> {
    let mut fields = forced_fields(left_schema, force_left_nullable, left_output_slot_flags);
    if include_build_columns {
        fields.extend(forced_fields(
            right_schema,
            force_right_nullable,
            right_output_slot_flags,
        ));
    }
    if with_mark {
        fields.push(mark_field(left_schema, right_schema)?);
    }
    Ok(Arc::new(Schema::new(Fields::from(fields))))
}

/// Output schema for drained build rows: null-padded probe fields first for
/// right/full outer, build fields only for right semi/anti without other
/// conjuncts.
pub(crate) fn drain_output_schema(
    left_schema: &SchemaRef,
    right_schema: &SchemaRef,
    right_output_slot_flags: &[bool],
    include_probe_columns: bool,
    force_right_nullable: bool,
) -> Result<SchemaRef, String> {
    let mut fields = Vec::new();
    if include_probe_columns {
        let all = vec![true; left_schema.fields().len()];
        fields.extend(forced_fields(left_schema, true, &all));
    }
    fields.extend(forced_fields(
        right_schema,
        force_right_nullable,
        right_output_slot_flags,
    ));
    Ok(Arc::new(Schema::new(Fields::from(fields))))
}
