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
//! Expression arena for scalar predicate evaluation over chunks.
//!
//! Responsibilities:
//! - Stores expression trees as flat arena nodes addressed by `ExprId`.
//! - Evaluates slot references, literals, comparisons, boolean and arithmetic
//!   operators against a chunk, yielding Arrow arrays.
//!
//! Key exported interfaces:
//! - Types: `ExprArena`, `ExprId`, `ExprNode`, `LiteralValue`.

mod comparison;
mod literal;
mod slot;

use crate::common::ids::SlotId;
use crate::exec::chunk::Chunk;
use arrow::array::{ArrayRef, new_null_array};
use arrow::datatypes::DataType;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ExprId(pub usize);

#[derive(Clone, Debug)]
pub enum LiteralValue {
    Null,
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Bool(bool),
    Utf8(String),
    Date32(i32),
}

#[derive(Clone, Debug)]
pub enum ExprNode {
    Literal(LiteralValue),
    /// Column reference resolved through chunk slot-id metadata.
    SlotId(SlotId),
    Add(ExprId, ExprId),
    Sub(ExprId, ExprId),
    Eq(ExprId, ExprId),
    Ne(ExprId, ExprId),
    Lt(ExprId, ExprId),
    Le(ExprId, ExprId),
    Gt(ExprId, ExprId),
    Ge(ExprId, ExprId),
    And(ExprId, ExprId),
    Or(ExprId, ExprId),
    Not(ExprId),
    IsNull(ExprId),
    IsNotNull(ExprId),
}

#[derive(Clone, Debug, Default)]
pub struct ExprArena {
    nodes: Vec<ExprNode>,
    types: Vec<DataType>,
}

impl ExprArena {
    pub fn push(&mut self, node: ExprNode) -> ExprId {
        self.push_typed(node, DataType::Null)
    }

    pub fn push_typed(&mut self, node: ExprNode, data_type: DataType) -> ExprId {
        let id = ExprId(self.nodes.len());
        self.nodes.push(node);
        self.types.push(data_type);
        id
    }

    pub fn node(&self, id: ExprId) -> Option<&ExprNode> {
        self.nodes.get(id.0)
    }

    pub fn data_type(&self, id: ExprId) -> Option<&DataType> {
        self.types.get(id.0)
    }

    pub fn eval(&self, id: ExprId, chunk: &Chunk) -> Result<ArrayRef, String> {
        let node = self
            .nodes
            .get(id.0)
            .ok_or_else(|| "invalid ExprId".to_string())?;
        match node {
            ExprNode::Literal(v) => {
                if matches!(v, LiteralValue::Null) {
                    let target_type = self.data_type(id).cloned().unwrap_or(DataType::Null);
                    if !matches!(target_type, DataType::Null) {
                        return Ok(new_null_array(&target_type, chunk.len()));
                    }
                }
                literal::eval(v, chunk.len())
            }
            ExprNode::SlotId(slot_id) => slot::eval_slot_id(*slot_id, chunk),
            ExprNode::Add(a, b) => comparison::eval_add(self, *a, *b, chunk),
            ExprNode::Sub(a, b) => comparison::eval_sub(self, *a, *b, chunk),
            ExprNode::Eq(a, b) => comparison::eval_eq(self, *a, *b, chunk),
            ExprNode::Ne(a, b) => comparison::eval_ne(self, *a, *b, chunk),
            ExprNode::Lt(a, b) => comparison::eval_lt(self, *a, *b, chunk),
            ExprNode::Le(a, b) => comparison::eval_le(self, *a, *b, chunk),
            ExprNode::Gt(a, b) => comparison::eval_gt(self, *a, *b, chunk),
            ExprNode::Ge(a, b) => comparison::eval_ge(self, *a, *b, chunk),
            ExprNode::And(a, b) => comparison::eval_and(self, *a, *b, chunk),
            ExprNode::Or(a, b) => comparison::eval_or(self, *a, *b, chunk),
            ExprNode::Not(child) => comparison::eval_not(self, *child, chunk),
            ExprNode::IsNull(child) => comparison::eval_is_null(self, *child, chunk),
            ExprNode::IsNotNull(child) => comparison::eval_is_not_null(self, *child, chunk),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::chunk::{Chunk, field_with_slot_id};
    use arrow::array::{Array, BooleanArray, Int64Array};
    use arrow::datatypes::{Field, Schema};
    use arrow::record_batch::RecordBatch;
    use std::sync::Arc;

    fn int_chunk(values: Vec<Option<i64>>) -> Chunk {
        let field = field_with_slot_id(Field::new("v", DataType::Int64, true), SlotId::new(7));
        let schema = Arc::new(Schema::new(vec![field]));
        let batch =
            RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).unwrap();
        Chunk::new(batch)
    }

    #[test]
    fn slot_gt_literal() {
        let mut arena = ExprArena::default();
        let slot = arena.push(ExprNode::SlotId(SlotId::new(7)));
        let lit = arena.push(ExprNode::Literal(LiteralValue::Int64(10)));
        let pred = arena.push(ExprNode::Gt(slot, lit));

        let chunk = int_chunk(vec![Some(5), Some(11), None]);
        let arr = arena.eval(pred, &chunk).unwrap();
        let mask = arr.as_any().downcast_ref::<BooleanArray>().unwrap();
        assert!(!mask.value(0));
        assert!(mask.value(1));
        assert!(mask.is_null(2));
    }

    #[test]
    fn typed_null_literal_uses_declared_type() {
        let mut arena = ExprArena::default();
        let expr = arena.push_typed(ExprNode::Literal(LiteralValue::Null), DataType::Utf8);

        let chunk = int_chunk(vec![Some(1), Some(2), Some(3)]);
        let arr = arena.eval(expr, &chunk).unwrap();
        assert_eq!(arr.data_type(), &DataType::Utf8);
        assert_eq!(arr.len(), 3);
        assert!(arr.is_null(0));
    }
}
