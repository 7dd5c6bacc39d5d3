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
use crate::exec::chunk::Chunk;
use crate::exec::expr::{ExprArena, ExprId};
use arrow::array::{Array, ArrayRef, BooleanArray};
use arrow::compute::cast;
use arrow::compute::kernels::boolean::{and_kleene, not, or_kleene};
use arrow::compute::kernels::cmp::{eq, gt, gt_eq, lt, lt_eq, neq};
use arrow::compute::kernels::numeric;
use std::sync::Arc;

/// Evaluate both children and cast the right side to the left type when the
/// physical types differ (integer literals against wider columns, etc.).
fn eval_aligned(
    arena: &ExprArena,
    a: ExprId,
    b: ExprId,
    chunk: &Chunk,
) -> Result<(ArrayRef, ArrayRef), String> {
    let left = arena.eval(a, chunk)?;
    let mut right = arena.eval(b, chunk)?;
    if left.data_type() != right.data_type() {
        right = cast(&right, left.data_type()).map_err(|e| {
            format!(
                "comparison operand cast failed from {:?} to {:?}: {}",
                right.data_type(),
                left.data_type(),
                e
            )
        })?;
    }
    Ok((left, right))
}

fn as_boolean(array: &ArrayRef, what: &str) -> Result<BooleanArray, String> {
    array
        .as_any()
        .downcast_ref::<BooleanArray>()
        .cloned()
        .ok_or_else(|| format!("{} expects a boolean operand", what))
}

macro_rules! cmp_eval {
    ($name:ident, $kernel:ident) => {
        pub(crate) fn $name(
            arena: &ExprArena,
            a: ExprId,
            b: ExprId,
            chunk: &Chunk,
        ) -> Result<ArrayRef, String> {
            let (left, right) = eval_aligned(arena, a, b, chunk)?;
            let out = $kernel(&left, &right).map_err(|e| e.to_string())?;
            Ok(Arc::new(out))
        }
    };
}

cmp_eval!(eval_eq, eq);
cmp_eval!(eval_ne, neq);
cmp_eval!(eval_lt, lt);
cmp_eval!(eval_le, lt_eq);
cmp_eval!(eval_gt, gt);
cmp_eval!(eval_ge, gt_eq);

pub(crate) fn eval_add(
    arena: &ExprArena,
    a: ExprId,
    b: ExprId,
    chunk: &Chunk,
) -> Result<ArrayRef, String> {
    let (left, right) = eval_aligned(arena, a, b, chunk)?;
    numeric::add(&left, &right).map_err(|e| e.to_string())
}

pub(crate) fn eval_sub(
    arena: &ExprArena,
    a: ExprId,
    b: ExprId,
    chunk: &Chunk,
) -> Result<ArrayRef, String> {
    let (left, right) = eval_aligned(arena, a, b, chunk)?;
    numeric::sub(&left, &right).map_err(|e| e.to_string())
}

pub(crate) fn eval_and(
    arena: &ExprArena,
    a: ExprId,
    b: ExprId,
    chunk: &Chunk,
) -> Result<ArrayRef, String> {
    let left = arena.eval(a, chunk)?;
    let right = arena.eval(b, chunk)?;
    let left = as_boolean(&left, "AND")?;
    let right = as_boolean(&right, "AND")?;
    let out = and_kleene(&left, &right).map_err(|e| e.to_string())?;
    Ok(Arc::new(out))
}

pub(crate) fn eval_or(
    arena: &ExprArena,
    a: ExprId,
    b: ExprId,
    chunk: &Chunk,
) -> Result<ArrayRef, String> {
    let left = arena.eval(a, chunk)?;
    let right = arena.eval(b, chunk)?;
    let left = as_boolean(&left, "OR")?;
    let right = as_boolean(&right, "OR")?;
    let out = or_kleene(&left, &right).map_err(|e| e.to_string())?;
    Ok(Arc::new(out))
}

pub(crate) fn eval_not(arena: &ExprArena, child: ExprId, chunk: &Chunk) -> Result<ArrayRef, String> {
    let arr = arena.eval(child, chunk)?;
    let arr = as_boolean(&arr, "NOT")?;
    let out = not(&arr).map_err(|e| e.to_string())?;
    Ok(Arc::new(out))
}

pub(crate) fn eval_is_null(
    arena: &ExprArena,
    child: ExprId,
    chunk: &Chunk,
) -> Result<ArrayRef, String> {
    let arr = arena.eval(child, chunk)?;
    let out = arrow::compute::is_null(arr.as_ref()).map_err(|e| e.to_string())?;
    Ok(Arc::new(out))
}

pub(crate) fn eval_is_not_null(
    arena: &ExprArena,
    child: ExprId,
    chunk: &Chunk,
) -> Result<ArrayRef, String> {
    let arr = arena.eval(child, chunk)?;
    let out = arrow::compute::is_not_null(arr.as_ref()).map_err(|e| e.to_string())?;
    Ok(Arc::new(out))
}
