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
//! Join-key materialization for hash-table insert and probe.
//!
//! Responsibilities:
//! - Packs fixed-width composite keys into 128-bit words.
//! - Serializes mixed or wide keys into a reusable stride buffer, falling back
//!   to per-row arena storage above a configured byte estimate.
//! - Reports scratch-allocation deltas to the owning memory tracker.
//!
//! Key exported interfaces:
//! - Types: `KeyEncoder`, `EncodedKeys`, `EncodedKeyRef`, `KeyLayout`.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Date32Array, Float32Array, Float64Array, Int8Array, Int16Array,
    Int32Array, Int64Array, StringArray,
};
use arrow::datatypes::DataType;

use crate::common::config::pre_serialize_keys_limit_bytes;
use crate::exec::expr::LiteralValue;
use crate::runtime::mem_tracker::MemTracker;

const FIXED_KEY_MAX_BYTES: usize = 16;

/// Physical encoding chosen for a key column set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum KeyLayout {
    /// All columns fixed-width; null bits plus values packed into one `u128`.
    Fixed { widths: Vec<usize>, null_bytes: usize },
    /// Variable-length serialized row bytes.
    Serialized,
}

pub(crate) fn fixed_width_size(data_type: &DataType) -> Option<usize> {
    let width = match data_type {
        DataType::Boolean => 1,
        DataType::Int8 => 1,
        DataType::Int16 => 2,
        DataType::Int32 => 4,
        DataType::Int64 => 8,
        DataType::Float32 => 4,
        DataType::Float64 => 8,
        DataType::Date32 => 4,
        _ => return None,
    };
    Some(width)
}

fn is_supported_key_type(data_type: &DataType) -> bool {
    fixed_width_size(data_type).is_some() || matches!(data_type, DataType::Utf8)
}

pub(crate) fn pick_key_layout(types: &[DataType]) -> KeyLayout {
    let null_bytes = (types.len() + 7) / 8;
    let mut total = null_bytes;
    let mut widths = Vec::with_capacity(types.len());
    for data_type in types {
        let Some(width) = fixed_width_size(data_type) else {
            return KeyLayout::Serialized;
        };
        widths.push(width);
        total += width;
        if total > FIXED_KEY_MAX_BYTES {
            return KeyLayout::Serialized;
        }
    }
    KeyLayout::Fixed { widths, null_bytes }
}

/// Position of one stored key row inside a `KeyArena`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RowKey {
    region: u32,
    offset: u32,
    len: u32,
}

/// Append-only byte storage addressed by `RowKey` positions.
///
/// A region never grows once opened, so stored rows keep stable positions;
/// when the current region cannot take the next row a new one opens at twice
/// the previous size. Region capacity is reported to the attached memory
/// tracker as it is reserved and returned on `clear`.
pub(crate) struct KeyArena {
    regions: Vec<Vec<u8>>,
    min_region_bytes: usize,
    next_region_bytes: usize,
    mem_tracker: Option<Arc<MemTracker>>,
    accounted_bytes: i64,
}

impl KeyArena {
    pub(crate) fn with_region_bytes(min_region_bytes: usize) -> Self {
        let min_region_bytes = min_region_bytes.max(1);
        Self {
            regions: Vec::new(),
            min_region_bytes,
            next_region_bytes: min_region_bytes,
            mem_tracker: None,
            accounted_bytes: 0,
        }
    }

    pub(crate) fn set_mem_tracker(&mut self, tracker: Arc<MemTracker>) {
        if let Some(previous) = self.mem_tracker.take() {
            previous.release(self.accounted_bytes);
        }
        let reserved: usize = self.regions.iter().map(Vec::capacity).sum();
        self.accounted_bytes = i64::try_from(reserved).unwrap_or(i64::MAX);
        tracker.consume(self.accounted_bytes);
        self.mem_tracker = Some(tracker);
    }

    pub(crate) fn store(&mut self, bytes: &[u8]) -> RowKey {
        let fits = self
            .regions
            .last()
            .map(|region| region.len() + bytes.len() <= region.capacity())
            .unwrap_or(false);
        if !fits {
            let capacity = self.next_region_bytes.max(bytes.len()).max(1);
            self.regions.push(Vec::with_capacity(capacity));
            self.next_region_bytes = capacity.saturating_mul(2);
            let delta = i64::try_from(capacity).unwrap_or(i64::MAX);
            if let Some(tracker) = self.mem_tracker.as_ref() {
                tracker.consume(delta);
            }
            self.accounted_bytes = self.accounted_bytes.saturating_add(delta);
        }
        let region_index = self.regions.len() - 1;
        let region = &mut self.regions[region_index];
        let offset = region.len();
        region.extend_from_slice(bytes);
        RowKey {
            region: region_index as u32,
            offset: offset as u32,
            len: bytes.len() as u32,
        }
    }

    pub(crate) fn slice(&self, key: RowKey) -> &[u8] {
        let region = &self.regions[key.region as usize];
        let start = key.offset as usize;
        &region[start..start + key.len as usize]
    }

    /// Drop all regions; previously returned `RowKey`s become invalid.
    pub(crate) fn clear(&mut self) {
        if let Some(tracker) = self.mem_tracker.as_ref() {
            tracker.release(self.accounted_bytes);
        }
        self.accounted_bytes = 0;
        self.regions.clear();
        self.next_region_bytes = self.min_region_bytes;
    }
}

impl Drop for KeyArena {
    fn drop(&mut self) {
        if let Some(tracker) = self.mem_tracker.as_ref() {
            tracker.release(self.accounted_bytes);
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum EncodedKeyRef<'a> {
    Fixed(u128),
    Bytes(&'a [u8]),
}

/// Encoded keys of one probe or build batch. Byte-form keys are resolved
/// back through the encoder that produced them.
pub(crate) enum EncodedKeys {
    Fixed(Vec<u128>),
    /// `(offset, len)` slots in the encoder's reusable stride buffer.
    Buffered(Vec<(u32, u32)>),
    /// Rows stored individually in the encoder's per-batch arena.
    Arena(Vec<RowKey>),
}

/// Materializes join-key columns into the form the hash table compares.
pub struct KeyEncoder {
    key_types: Vec<DataType>,
    layout: KeyLayout,
    pre_serialize_limit_bytes: usize,
    serialize_buffer: Vec<u8>,
    arena: KeyArena,
    mem_tracker: Option<Arc<MemTracker>>,
}

impl KeyEncoder {
    pub fn new(key_types: Vec<DataType>) -> Result<Self, String> {
        Self::with_limit(key_types, pre_serialize_keys_limit_bytes())
    }

    pub fn with_limit(key_types: Vec<DataType>, limit_bytes: usize) -> Result<Self, String> {
        if key_types.is_empty() {
            return Err("join key encoder requires at least one key column".to_string());
        }
        for data_type in &key_types {
            if !is_supported_key_type(data_type) {
                return Err(format!("unsupported join key type: {:?}", data_type));
            }
        }
        let layout = pick_key_layout(&key_types);
        Ok(Self {
            key_types,
            layout,
            pre_serialize_limit_bytes: limit_bytes,
            serialize_buffer: Vec::new(),
            // Arena rows only exist above the stride-buffer limit, so size
            // regions off that limit rather than a fixed block.
            arena: KeyArena::with_region_bytes(limit_bytes.max(4 * 1024)),
            mem_tracker: None,
        })
    }

    pub(crate) fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    pub fn key_types(&self) -> &[DataType] {
        &self.key_types
    }

    pub fn set_mem_tracker(&mut self, tracker: Arc<MemTracker>) {
        if let Some(previous) = self.mem_tracker.take() {
            previous.release(self.serialize_buffer.len() as i64);
        }
        tracker.consume(self.serialize_buffer.len() as i64);
        self.arena.set_mem_tracker(Arc::clone(&tracker));
        self.mem_tracker = Some(tracker);
    }

    /// Resolve one encoded row for hashing and comparison.
    pub(crate) fn key_ref<'a>(&'a self, keys: &'a EncodedKeys, row: usize) -> EncodedKeyRef<'a> {
        match keys {
            EncodedKeys::Fixed(words) => EncodedKeyRef::Fixed(words[row]),
            EncodedKeys::Buffered(slots) => {
                let (offset, len) = slots[row];
                let start = offset as usize;
                EncodedKeyRef::Bytes(&self.serialize_buffer[start..start + len as usize])
            }
            EncodedKeys::Arena(rows) => EncodedKeyRef::Bytes(self.arena.slice(rows[row])),
        }
    }

    pub(crate) fn encode_batch(
        &mut self,
        key_arrays: &[ArrayRef],
        rows: usize,
    ) -> Result<EncodedKeys, String> {
        if key_arrays.len() != self.key_types.len() {
            return Err(format!(
                "join key arity mismatch: expected {} columns, got {}",
                self.key_types.len(),
                key_arrays.len()
            ));
        }
        for (array, expected) in key_arrays.iter().zip(&self.key_types) {
            if array.data_type() != expected {
                return Err(format!(
                    "join key type mismatch: expected {:?}, got {:?}",
                    expected,
                    array.data_type()
                ));
            }
            if array.len() < rows {
                return Err("join key column shorter than batch row count".to_string());
            }
        }

        match self.layout.clone() {
            KeyLayout::Fixed { widths, null_bytes } => {
                Ok(EncodedKeys::Fixed(encode_fixed_batch(
                    key_arrays, rows, &widths, null_bytes,
                )?))
            }
            KeyLayout::Serialized => self.encode_serialized_batch(key_arrays, rows),
        }
    }

    fn encode_serialized_batch(
        &mut self,
        key_arrays: &[ArrayRef],
        rows: usize,
    ) -> Result<EncodedKeys, String> {
        let max_one_row_byte_size = max_one_row_byte_size(key_arrays, rows)?;
        let total_bytes = max_one_row_byte_size.saturating_mul(rows);

        // A single very long string key can blow up the estimate; above the
        // limit every row is stored individually instead of reserving the
        // whole stride buffer.
        if total_bytes > self.pre_serialize_limit_bytes || total_bytes > u32::MAX as usize {
            self.arena.clear();
            let mut row_buf = vec![0u8; max_one_row_byte_size];
            let mut keys = Vec::with_capacity(rows);
            for row in 0..rows {
                let mut len = 0usize;
                for array in key_arrays {
                    len += write_column_value(array, row, &mut row_buf[len..])?;
                }
                keys.push(self.arena.store(&row_buf[..len]));
            }
            return Ok(EncodedKeys::Arena(keys));
        }

        if total_bytes > self.serialize_buffer.len() {
            let old_bytes = self.serialize_buffer.len() as i64;
            self.serialize_buffer = vec![0u8; total_bytes];
            if let Some(tracker) = self.mem_tracker.as_ref() {
                tracker.adjust(total_bytes as i64 - old_bytes);
            }
        }

        let mut lens = vec![0usize; rows];
        for array in key_arrays {
            for (row, len) in lens.iter_mut().enumerate() {
                let start = row * max_one_row_byte_size + *len;
                let end = (row + 1) * max_one_row_byte_size;
                *len += write_column_value(array, row, &mut self.serialize_buffer[start..end])?;
            }
        }

        let slots = lens
            .iter()
            .enumerate()
            .map(|(row, len)| ((row * max_one_row_byte_size) as u32, *len as u32))
            .collect();
        Ok(EncodedKeys::Buffered(slots))
    }

    /// Decode one serialized key row back into literal values.
    pub(crate) fn decode_serialized_row(
        &self,
        mut bytes: &[u8],
    ) -> Result<Vec<Option<LiteralValue>>, String> {
        let mut out = Vec::with_capacity(self.key_types.len());
        for data_type in &self.key_types {
            let (value, rest) = decode_column_value(data_type, bytes)?;
            out.push(value);
            bytes = rest;
        }
        if !bytes.is_empty() {
            return Err("trailing bytes after decoding serialized join key".to_string());
        }
        Ok(out)
    }

    /// Decode one packed fixed-width key row back into literal values.
    pub(crate) fn decode_fixed_row(&self, word: u128) -> Result<Vec<Option<LiteralValue>>, String> {
        let KeyLayout::Fixed { widths, null_bytes } = &self.layout else {
            return Err("decode_fixed_row called on serialized key layout".to_string());
        };
        let bytes = word.to_le_bytes();
        let mut out = Vec::with_capacity(self.key_types.len());
        let mut offset = *null_bytes;
        for (idx, (data_type, width)) in self.key_types.iter().zip(widths).enumerate() {
            let is_null = bytes[idx / 8] & (1 << (idx % 8)) != 0;
            if is_null {
                out.push(None);
            } else {
                out.push(Some(decode_fixed_value(
                    data_type,
                    &bytes[offset..offset + width],
                )?));
            }
            offset += width;
        }
        Ok(out)
    }
}

/// Join keys compare NaN equal to NaN, so every NaN payload collapses to one
/// bit pattern before packing or serialization.
fn f32_key_bits(value: f32) -> u32 {
    if value.is_nan() {
        return f32::NAN.to_bits();
    }
    value.to_bits()
}

fn f64_key_bits(value: f64) -> u64 {
    if value.is_nan() {
        return f64::NAN.to_bits();
    }
    value.to_bits()
}

fn max_one_row_byte_size(key_arrays: &[ArrayRef], rows: usize) -> Result<usize, String> {
    let mut total = 0usize;
    for array in key_arrays {
        let column_max = match array.data_type() {
            DataType::Utf8 => {
                let arr = array
                    .as_any()
                    .downcast_ref::<StringArray>()
                    .ok_or_else(|| "failed to downcast Utf8 join key".to_string())?;
                let mut max_len = 0usize;
                for row in 0..rows {
                    if !arr.is_null(row) {
                        max_len = max_len.max(arr.value_length(row) as usize);
                    }
                }
                1 + 4 + max_len
            }
            other => {
                let width = fixed_width_size(other)
                    .ok_or_else(|| format!("unsupported join key type: {:?}", other))?;
                1 + width
            }
        };
        total = total.saturating_add(column_max);
    }
    Ok(total)
}

fn encode_fixed_batch(
    key_arrays: &[ArrayRef],
    rows: usize,
    widths: &[usize],
    null_bytes: usize,
) -> Result<Vec<u128>, String> {
    let mut out = Vec::with_capacity(rows);
    for row in 0..rows {
        let mut bytes = [0u8; FIXED_KEY_MAX_BYTES];
        let mut offset = null_bytes;
        for (idx, (array, width)) in key_arrays.iter().zip(widths).enumerate() {
            if array.is_null(row) {
                bytes[idx / 8] |= 1 << (idx % 8);
            } else {
                write_fixed_value(array, row, &mut bytes[offset..offset + width])?;
            }
            offset += width;
        }
        out.push(u128::from_le_bytes(bytes));
    }
    Ok(out)
}

fn write_fixed_value(array: &ArrayRef, row: usize, dst: &mut [u8]) -> Result<(), String> {
    macro_rules! write_le {
        ($value:expr) => {{
            dst.copy_from_slice(&$value.to_le_bytes());
        }};
    }
    match array.data_type() {
        DataType::Boolean => {
            let arr = downcast::<BooleanArray>(array)?;
            dst[0] = arr.value(row) as u8;
        }
        DataType::Int8 => write_le!(downcast::<Int8Array>(array)?.value(row)),
        DataType::Int16 => write_le!(downcast::<Int16Array>(array)?.value(row)),
        DataType::Int32 => write_le!(downcast::<Int32Array>(array)?.value(row)),
        DataType::Int64 => write_le!(downcast::<Int64Array>(array)?.value(row)),
        DataType::Float32 => {
            write_le!(f32_key_bits(downcast::<Float32Array>(array)?.value(row)))
        }
        DataType::Float64 => {
            write_le!(f64_key_bits(downcast::<Float64Array>(array)?.value(row)))
        }
        DataType::Date32 => write_le!(downcast::<Date32Array>(array)?.value(row)),
        other => return Err(format!("unsupported fixed join key type: {:?}", other)),
    }
    Ok(())
}

/// Write one column's null marker and value at the front of `dst`; returns the
/// number of bytes written.
fn write_column_value(array: &ArrayRef, row: usize, dst: &mut [u8]) -> Result<usize, String> {
    if array.is_null(row) {
        dst[0] = 1;
        return Ok(1);
    }
    dst[0] = 0;
    let written = match array.data_type() {
        DataType::Utf8 => {
            let arr = downcast::<StringArray>(array)?;
            let value = arr.value(row).as_bytes();
            dst[1..5].copy_from_slice(&(value.len() as u32).to_le_bytes());
            dst[5..5 + value.len()].copy_from_slice(value);
            5 + value.len()
        }
        other => {
            let width = fixed_width_size(other)
                .ok_or_else(|| format!("unsupported join key type: {:?}", other))?;
            write_fixed_value(array, row, &mut dst[1..1 + width])?;
            1 + width
        }
    };
    Ok(written)
}

fn decode_column_value<'a>(
    data_type: &DataType,
    bytes: &'a [u8],
) -> Result<(Option<LiteralValue>, &'a [u8]), String> {
    let (null_byte, rest) = bytes
        .split_first()
        .ok_or_else(|| "truncated serialized join key".to_string())?;
    if *null_byte == 1 {
        return Ok((None, rest));
    }
    if let DataType::Utf8 = data_type {
        if rest.len() < 4 {
            return Err("truncated serialized join key".to_string());
        }
        let len = u32::from_le_bytes(rest[0..4].try_into().expect("u32 bytes")) as usize;
        if rest.len() < 4 + len {
            return Err("truncated serialized join key".to_string());
        }
        let value = std::str::from_utf8(&rest[4..4 + len])
            .map_err(|e| format!("invalid utf8 in serialized join key: {}", e))?;
        return Ok((Some(LiteralValue::Utf8(value.to_string())), &rest[4 + len..]));
    }
    let width = fixed_width_size(data_type)
        .ok_or_else(|| format!("unsupported join key type: {:?}", data_type))?;
    if rest.len() < width {
        return Err("truncated serialized join key".to_string());
    }
    let value = decode_fixed_value(data_type, &rest[..width])?;
    Ok((Some(value), &rest[width..]))
}

fn decode_fixed_value(data_type: &DataType, bytes: &[u8]) -> Result<LiteralValue, String> {
    let value = match data_type {
        DataType::Boolean => LiteralValue::Bool(bytes[0] != 0),
        DataType::Int8 => LiteralValue::Int8(i8::from_le_bytes(bytes.try_into().expect("i8"))),
        DataType::Int16 => LiteralValue::Int16(i16::from_le_bytes(bytes.try_into().expect("i16"))),
        DataType::Int32 => LiteralValue::Int32(i32::from_le_bytes(bytes.try_into().expect("i32"))),
        DataType::Int64 => LiteralValue::Int64(i64::from_le_bytes(bytes.try_into().expect("i64"))),
        DataType::Float32 => LiteralValue::Float32(f32::from_bits(u32::from_le_bytes(
            bytes.try_into().expect("u32"),
        ))),
        DataType::Float64 => LiteralValue::Float64(f64::from_bits(u64::from_le_bytes(
            bytes.try_into().expect("u64"),
        ))),
        DataType::Date32 => LiteralValue::Date32(i32::from_le_bytes(bytes.try_into().expect("i32"))),
        other => return Err(format!("unsupported fixed join key type: {:?}", other)),
    };
    Ok(value)
}

fn downcast<'a, T: 'static>(array: &'a ArrayRef) -> Result<&'a T, String> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| "failed to downcast join key column".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int32Array, Int64Array, StringArray};

    fn literal_eq(a: &LiteralValue, b: &LiteralValue) -> bool {
        format!("{:?}", a) == format!("{:?}", b)
    }

    fn byte_key<'a>(encoder: &'a KeyEncoder, keys: &'a EncodedKeys, row: usize) -> &'a [u8] {
        match encoder.key_ref(keys, row) {
            EncodedKeyRef::Bytes(bytes) => bytes,
            EncodedKeyRef::Fixed(_) => panic!("expected serialized key"),
        }
    }

    #[test]
    fn fixed_layout_round_trip() {
        let types = vec![DataType::Int32, DataType::Int64];
        let encoder = KeyEncoder::new(types.clone()).unwrap();
        assert!(matches!(encoder.layout(), KeyLayout::Fixed { .. }));

        let mut encoder = encoder;
        let arrays: Vec<ArrayRef> = vec![
            Arc::new(Int32Array::from(vec![Some(7), None])),
            Arc::new(Int64Array::from(vec![Some(-1), Some(9)])),
        ];
        let keys = encoder.encode_batch(&arrays, 2).unwrap();
        let EncodedKeys::Fixed(words) = keys else {
            panic!("expected fixed keys");
        };
        let row0 = encoder.decode_fixed_row(words[0]).unwrap();
        assert!(literal_eq(row0[0].as_ref().unwrap(), &LiteralValue::Int32(7)));
        assert!(literal_eq(row0[1].as_ref().unwrap(), &LiteralValue::Int64(-1)));
        let row1 = encoder.decode_fixed_row(words[1]).unwrap();
        assert!(row1[0].is_none());
        assert!(literal_eq(row1[1].as_ref().unwrap(), &LiteralValue::Int64(9)));
        // Distinct keys pack to distinct words.
        assert_ne!(words[0], words[1]);
    }

    #[test]
    fn serialized_round_trip_with_buffer_growth() {
        let types = vec![DataType::Utf8, DataType::Int64];
        let mut encoder = KeyEncoder::with_limit(types, 1 << 20).unwrap();
        let tracker = MemTracker::new_root("test");
        encoder.set_mem_tracker(Arc::clone(&tracker));

        let arrays: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from(vec![Some("ab"), None])),
            Arc::new(Int64Array::from(vec![Some(1), Some(2)])),
        ];
        let keys = encoder.encode_batch(&arrays, 2).unwrap();
        assert!(matches!(keys, EncodedKeys::Buffered(_)));
        let decoded = encoder
            .decode_serialized_row(byte_key(&encoder, &keys, 0))
            .unwrap();
        assert!(literal_eq(
            decoded[0].as_ref().unwrap(),
            &LiteralValue::Utf8("ab".to_string())
        ));
        assert!(literal_eq(decoded[1].as_ref().unwrap(), &LiteralValue::Int64(1)));
        let decoded = encoder
            .decode_serialized_row(byte_key(&encoder, &keys, 1))
            .unwrap();
        assert!(decoded[0].is_none());

        let first_footprint = tracker.current();
        assert!(first_footprint > 0);

        // A wider batch grows the reusable buffer and re-reports the delta.
        let arrays: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from(vec![Some("a-much-longer-key-value"); 64])),
            Arc::new(Int64Array::from(vec![Some(5); 64])),
        ];
        let keys = encoder.encode_batch(&arrays, 64).unwrap();
        assert!(matches!(keys, EncodedKeys::Buffered(_)));
        let decoded = encoder
            .decode_serialized_row(byte_key(&encoder, &keys, 63))
            .unwrap();
        assert!(literal_eq(
            decoded[0].as_ref().unwrap(),
            &LiteralValue::Utf8("a-much-longer-key-value".to_string())
        ));
        assert!(tracker.current() > first_footprint);
    }

    #[test]
    fn oversized_estimate_switches_to_arena() {
        let types = vec![DataType::Utf8];
        let mut encoder = KeyEncoder::with_limit(types, 0).unwrap();
        let tracker = MemTracker::new_root("test");
        encoder.set_mem_tracker(Arc::clone(&tracker));

        let arrays: Vec<ArrayRef> = vec![Arc::new(StringArray::from(vec![Some("xyz"), Some("q")]))];
        let keys = encoder.encode_batch(&arrays, 2).unwrap();
        assert!(matches!(keys, EncodedKeys::Arena(_)));
        let decoded = encoder
            .decode_serialized_row(byte_key(&encoder, &keys, 0))
            .unwrap();
        assert!(literal_eq(
            decoded[0].as_ref().unwrap(),
            &LiteralValue::Utf8("xyz".to_string())
        ));
        // Arena regions are accounted while the batch is alive.
        assert!(tracker.current() > 0);
        let arena_bytes = tracker.current();
        let _ = encoder.encode_batch(&arrays, 2).unwrap();
        // Cleared and re-reserved per batch, not accumulated.
        assert_eq!(tracker.current(), arena_bytes);
    }

    #[test]
    fn arena_rows_survive_region_turnover() {
        // Region capacity of one byte forces a fresh region per row.
        let mut arena = KeyArena::with_region_bytes(1);
        let first = arena.store(b"first-key");
        let second = arena.store(b"k2");
        let third = arena.store(b"third");
        assert_eq!(arena.slice(first), b"first-key");
        assert_eq!(arena.slice(second), b"k2");
        assert_eq!(arena.slice(third), b"third");
        arena.clear();
        let reused = arena.store(b"after-clear");
        assert_eq!(arena.slice(reused), b"after-clear");
    }
}
