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
//! Build-side hash table for join key lookup.
//!
//! Responsibilities:
//! - Indexes build rows by equi-key into per-key row lists with block/row
//!   coordinates.
//! - Serves probe-time lookups from a flat bucket directory that supports
//!   hash-based prefetching.
//! - Owns the visited bits consulted by semi/anti/outer drains.
//!
//! Key exported interfaces:
//! - Types: `JoinHashTable`.
//!
//! Current limitations:
//! - Visited bits are plain cells; concurrent probe instances must partition
//!   the probe input instead of sharing them.

use std::cell::Cell;
use std::hash::BuildHasher;
use std::mem;
use std::sync::Arc;

use arrow::array::ArrayRef;
use arrow::datatypes::DataType;
use hashbrown::hash_map::DefaultHashBuilder;
use hashbrown::raw::RawTable;

use super::RowListFlavor;
use super::key_encoder::{EncodedKeyRef, KeyArena, KeyEncoder, RowKey};
use crate::runtime::mem_tracker::MemTracker;

const ROW_NONE: u32 = u32::MAX;
const MAX_BUILD_BLOCKS: usize = i8::MAX as usize;

#[derive(Clone, Copy, Debug)]
struct KeyEntry {
    group_id: usize,
    hash: u64,
}

#[derive(Clone, Copy, Debug, Default)]
struct ProbeBucket {
    hash: u64,
    group_id_plus_one: u32,
}

/// Hash table mapping equi-keys to build-row lists.
///
/// Build batches are inserted through `add_build_block`; `finalize` freezes
/// the table into probe form (contiguous row lists plus the bucket
/// directory). Probing is read-only except for the visited bits.
pub struct JoinHashTable {
    flavor: RowListFlavor,
    encoder: KeyEncoder,
    hasher: DefaultHashBuilder,
    entries: RawTable<KeyEntry>,
    group_hashes: Vec<u64>,
    group_keys_fixed: Vec<u128>,
    group_key_rows: Vec<RowKey>,
    key_store: KeyArena,
    group_head: Vec<u32>,
    row_next: Vec<u32>,
    row_block: Vec<i8>,
    row_in_block: Vec<i32>,
    row_count: usize,
    group_offsets: Option<Vec<u32>>,
    group_rows: Option<Vec<u32>>,
    buckets: Vec<ProbeBucket>,
    bucket_mask: usize,
    key_visited: Vec<Cell<bool>>,
    row_visited: Vec<Cell<bool>>,
    mem_tracker: Option<Arc<MemTracker>>,
    accounted_bytes: i64,
}

impl JoinHashTable {
    pub fn new(key_types: Vec<DataType>, flavor: RowListFlavor) -> Result<Self, String> {
        if key_types.is_empty() {
            return Err("join hash table requires join keys".to_string());
        }
        let encoder = KeyEncoder::new(key_types)?;
        Ok(Self {
            flavor,
            encoder,
            // Per-instance random state; probe-side hashing goes through
            // `hash_encoded` so both sides agree.
            hasher: DefaultHashBuilder::default(),
            entries: RawTable::new(),
            group_hashes: Vec::new(),
            group_keys_fixed: Vec::new(),
            group_key_rows: Vec::new(),
            key_store: KeyArena::with_region_bytes(4 * 1024),
            group_head: Vec::new(),
            row_next: Vec::new(),
            row_block: Vec::new(),
            row_in_block: Vec::new(),
            row_count: 0,
            group_offsets: None,
            group_rows: None,
            buckets: Vec::new(),
            bucket_mask: 0,
            key_visited: Vec::new(),
            row_visited: Vec::new(),
            mem_tracker: None,
            accounted_bytes: 0,
        })
    }

    pub fn set_mem_tracker(&mut self, tracker: Arc<MemTracker>) {
        if let Some(previous) = self.mem_tracker.take() {
            previous.release(self.accounted_bytes);
        }
        let bytes = self.tracked_bytes();
        tracker.consume(bytes);
        self.key_store
            .set_mem_tracker(MemTracker::new_child("JoinKeyStore", &tracker));
        self.mem_tracker = Some(tracker);
        self.accounted_bytes = bytes;
    }

    pub fn flavor(&self) -> RowListFlavor {
        self.flavor
    }

    pub fn key_types(&self) -> &[DataType] {
        self.encoder.key_types()
    }

    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn group_count(&self) -> usize {
        self.group_head.len()
    }

    pub(crate) fn hash_encoded(&self, key: EncodedKeyRef<'_>) -> u64 {
        match key {
            EncodedKeyRef::Fixed(word) => self.hasher.hash_one(word),
            EncodedKeyRef::Bytes(bytes) => self.hasher.hash_one(bytes),
        }
    }

    /// Insert every row of one build block under `block_offset`.
    pub fn add_build_block(
        &mut self,
        key_arrays: &[ArrayRef],
        num_rows: usize,
        block_offset: usize,
    ) -> Result<(), String> {
        if self.group_offsets.is_some() || self.group_rows.is_some() {
            return Err("join hash table already finalized".to_string());
        }
        if block_offset > MAX_BUILD_BLOCKS {
            return Err(format!(
                "join build block offset {} exceeds the {} block limit",
                block_offset, MAX_BUILD_BLOCKS
            ));
        }
        if num_rows == 0 {
            return Ok(());
        }
        let next_row_count = self
            .row_count
            .checked_add(num_rows)
            .ok_or_else(|| "join build row count overflow".to_string())?;
        if next_row_count >= ROW_NONE as usize {
            return Err("join build row count overflow".to_string());
        }

        let encoded = self.encoder.encode_batch(key_arrays, num_rows)?;

        let base_row_id = self.row_count as u32;
        self.row_next.resize(next_row_count, ROW_NONE);
        self.row_block.resize(next_row_count, 0);
        self.row_in_block.resize(next_row_count, 0);
        self.row_count = next_row_count;

        for row in 0..num_rows {
            let row_id = base_row_id + row as u32;
            let slot = row_id as usize;
            self.row_block[slot] = block_offset as i8;
            self.row_in_block[slot] = row as i32;

            let key = self.encoder.key_ref(&encoded, row);
            let hash = self.hash_encoded(key);
            let found = self
                .entries
                .get(hash, |entry| {
                    stored_key_matches(
                        &self.group_keys_fixed,
                        &self.group_key_rows,
                        &self.key_store,
                        entry.group_id,
                        key,
                    )
                })
                .map(|entry| entry.group_id);
            let group_id = match found {
                Some(group_id) => group_id,
                None => {
                    let group_id = self.group_head.len();
                    match key {
                        EncodedKeyRef::Fixed(word) => self.group_keys_fixed.push(word),
                        EncodedKeyRef::Bytes(bytes) => {
                            let stored = self.key_store.store(bytes);
                            self.group_key_rows.push(stored);
                        }
                    }
                    self.group_hashes.push(hash);
                    self.group_head.push(ROW_NONE);
                    self.entries
                        .insert(hash, KeyEntry { group_id, hash }, |entry| entry.hash);
                    group_id
                }
            };
            self.link_row(group_id, row_id)?;
        }

        self.refresh_accounting();
        Ok(())
    }

    fn link_row(&mut self, group_id: usize, row_id: u32) -> Result<(), String> {
        let head = self
            .group_head
            .get(group_id)
            .copied()
            .ok_or_else(|| "join group id out of bounds".to_string())?;
        let slot = row_id as usize;
        if slot >= self.row_next.len() {
            return Err("join row id out of bounds".to_string());
        }
        self.row_next[slot] = head;
        self.group_head[group_id] = row_id;
        Ok(())
    }

    /// Freeze insertion chains into contiguous row lists and lay out the
    /// probe bucket directory. Row lists preserve build insertion order.
    pub fn finalize(&mut self) -> Result<(), String> {
        if self.group_offsets.is_some() || self.group_rows.is_some() {
            return Ok(());
        }
        let group_count = self.group_head.len();
        let mut counts = vec![0u32; group_count];
        for (group_id, count) in counts.iter_mut().enumerate() {
            let mut row = self.group_head[group_id];
            while row != ROW_NONE {
                *count = count
                    .checked_add(1)
                    .ok_or_else(|| "join group row count overflow".to_string())?;
                row = self.next_row(row)?;
            }
        }

        let mut offsets = Vec::with_capacity(group_count + 1);
        offsets.push(0u32);
        let mut total = 0u32;
        for count in &counts {
            total = total
                .checked_add(*count)
                .ok_or_else(|| "join group rows overflow".to_string())?;
            offsets.push(total);
        }

        // Chains are prepend-linked, so the head is the newest row; writing
        // each group back-to-front restores insertion order.
        let mut rows = vec![0u32; total as usize];
        for group_id in 0..group_count {
            let mut write_pos = offsets[group_id + 1] as usize;
            let mut row = self.group_head[group_id];
            while row != ROW_NONE {
                write_pos -= 1;
                rows[write_pos] = row;
                row = self.next_row(row)?;
            }
        }

        let bucket_count = (group_count.saturating_mul(2)).next_power_of_two().max(16);
        let mut buckets = vec![ProbeBucket::default(); bucket_count];
        let mask = bucket_count - 1;
        for (group_id, hash) in self.group_hashes.iter().enumerate() {
            let mut idx = (*hash as usize) & mask;
            while buckets[idx].group_id_plus_one != 0 {
                idx = (idx + 1) & mask;
            }
            buckets[idx] = ProbeBucket {
                hash: *hash,
                group_id_plus_one: group_id as u32 + 1,
            };
        }

        match self.flavor {
            RowListFlavor::Plain => {}
            RowListFlavor::KeyVisited => {
                self.key_visited = vec![Cell::new(false); group_count];
            }
            RowListFlavor::RowVisited => {
                self.row_visited = vec![Cell::new(false); self.row_count];
            }
        }

        self.group_offsets = Some(offsets);
        self.group_rows = Some(rows);
        self.buckets = buckets;
        self.bucket_mask = mask;
        // The build-time dedup table is no longer needed once the directory
        // exists.
        self.entries = RawTable::new();
        self.refresh_accounting();
        Ok(())
    }

    /// Probe-time key lookup with a precomputed hash.
    pub(crate) fn find_with_hash(&self, hash: u64, key: EncodedKeyRef<'_>) -> Option<usize> {
        if self.buckets.is_empty() {
            return None;
        }
        let mut idx = (hash as usize) & self.bucket_mask;
        loop {
            let bucket = self.buckets[idx];
            if bucket.group_id_plus_one == 0 {
                return None;
            }
            let group_id = (bucket.group_id_plus_one - 1) as usize;
            if bucket.hash == hash
                && stored_key_matches(
                    &self.group_keys_fixed,
                    &self.group_key_rows,
                    &self.key_store,
                    group_id,
                    key,
                )
            {
                return Some(group_id);
            }
            idx = (idx + 1) & self.bucket_mask;
        }
    }

    /// Nonblocking cache hint for the bucket a hash lands on.
    #[inline]
    pub(crate) fn prefetch_by_hash(&self, hash: u64) {
        #[cfg(target_arch = "x86_64")]
        {
            if !self.buckets.is_empty() {
                let idx = (hash as usize) & self.bucket_mask;
                unsafe {
                    std::arch::x86_64::_mm_prefetch(
                        self.buckets.as_ptr().add(idx) as *const i8,
                        std::arch::x86_64::_MM_HINT_T0,
                    );
                }
            }
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = hash;
        }
    }

    pub(crate) fn group_rows_slice(&self, group_id: usize) -> Result<&[u32], String> {
        let offsets = self
            .group_offsets
            .as_ref()
            .ok_or_else(|| "join hash table not finalized".to_string())?;
        let rows = self
            .group_rows
            .as_ref()
            .ok_or_else(|| "join hash table not finalized".to_string())?;
        if group_id + 1 >= offsets.len() {
            return Err("join group id out of bounds".to_string());
        }
        let start = offsets[group_id] as usize;
        let end = offsets[group_id + 1] as usize;
        Ok(&rows[start..end])
    }

    pub(crate) fn row_coord(&self, row_id: u32) -> Result<(i8, i32), String> {
        let slot = row_id as usize;
        let block = *self
            .row_block
            .get(slot)
            .ok_or_else(|| "join row id out of bounds".to_string())?;
        let row = *self
            .row_in_block
            .get(slot)
            .ok_or_else(|| "join row id out of bounds".to_string())?;
        Ok((block, row))
    }

    pub(crate) fn key_visited(&self, group_id: usize) -> Result<bool, String> {
        self.key_visited
            .get(group_id)
            .map(Cell::get)
            .ok_or_else(|| "join key visited flag out of bounds".to_string())
    }

    pub(crate) fn set_key_visited(&self, group_id: usize) -> Result<(), String> {
        self.key_visited
            .get(group_id)
            .map(|cell| cell.set(true))
            .ok_or_else(|| "join key visited flag out of bounds".to_string())
    }

    pub(crate) fn row_visited(&self, row_id: u32) -> Result<bool, String> {
        self.row_visited
            .get(row_id as usize)
            .map(Cell::get)
            .ok_or_else(|| "join row visited flag out of bounds".to_string())
    }

    pub(crate) fn mark_row_visited(&self, row_id: u32, hit: bool) -> Result<(), String> {
        self.row_visited
            .get(row_id as usize)
            .map(|cell| cell.set(cell.get() | hit))
            .ok_or_else(|| "join row visited flag out of bounds".to_string())
    }

    fn next_row(&self, row_id: u32) -> Result<u32, String> {
        self.row_next
            .get(row_id as usize)
            .copied()
            .ok_or_else(|| "join row id out of bounds".to_string())
    }

    fn refresh_accounting(&mut self) {
        let Some(tracker) = self.mem_tracker.as_ref() else {
            return;
        };
        let bytes = self.tracked_bytes();
        tracker.adjust(bytes - self.accounted_bytes);
        self.accounted_bytes = bytes;
    }

    fn tracked_bytes(&self) -> i64 {
        fn vec_bytes<T>(v: &Vec<T>) -> i64 {
            let bytes = v.capacity().saturating_mul(mem::size_of::<T>());
            i64::try_from(bytes).unwrap_or(i64::MAX)
        }
        fn opt_vec_bytes<T>(v: &Option<Vec<T>>) -> i64 {
            v.as_ref().map(vec_bytes).unwrap_or(0)
        }

        vec_bytes(&self.group_head)
            .saturating_add(vec_bytes(&self.row_next))
            .saturating_add(vec_bytes(&self.row_block))
            .saturating_add(vec_bytes(&self.row_in_block))
            .saturating_add(vec_bytes(&self.group_hashes))
            .saturating_add(vec_bytes(&self.group_keys_fixed))
            .saturating_add(vec_bytes(&self.group_key_rows))
            .saturating_add(vec_bytes(&self.buckets))
            .saturating_add(vec_bytes(&self.key_visited))
            .saturating_add(vec_bytes(&self.row_visited))
            .saturating_add(opt_vec_bytes(&self.group_offsets))
            .saturating_add(opt_vec_bytes(&self.group_rows))
    }
}

impl Drop for JoinHashTable {
    fn drop(&mut self) {
        if let Some(tracker) = self.mem_tracker.as_ref() {
            tracker.release(self.accounted_bytes);
        }
    }
}

fn stored_key_matches(
    fixed: &[u128],
    stored: &[RowKey],
    store: &KeyArena,
    group_id: usize,
    key: EncodedKeyRef<'_>,
) -> bool {
    match key {
        EncodedKeyRef::Fixed(word) => fixed.get(group_id).copied() == Some(word),
        EncodedKeyRef::Bytes(bytes) => stored
            .get(group_id)
            .map(|row_key| store.slice(*row_key) == bytes)
            .unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};

    fn table_from_keys(keys: &[Option<i64>], flavor: RowListFlavor) -> JoinHashTable {
        let mut table = JoinHashTable::new(vec![DataType::Int64], flavor).unwrap();
        let arrays: Vec<ArrayRef> = vec![Arc::new(Int64Array::from(keys.to_vec()))];
        table.add_build_block(&arrays, keys.len(), 0).unwrap();
        table.finalize().unwrap();
        table
    }

    fn lookup(table: &JoinHashTable, key: i64) -> Option<usize> {
        let mut encoder = KeyEncoder::new(vec![DataType::Int64]).unwrap();
        let arrays: Vec<ArrayRef> = vec![Arc::new(Int64Array::from(vec![Some(key)]))];
        let encoded = encoder.encode_batch(&arrays, 1).unwrap();
        let key_ref = encoder.key_ref(&encoded, 0);
        table.find_with_hash(table.hash_encoded(key_ref), key_ref)
    }

    #[test]
    fn duplicate_keys_share_a_group_in_insertion_order() {
        let table = table_from_keys(
            &[Some(1), Some(2), Some(1), Some(1)],
            RowListFlavor::Plain,
        );
        assert_eq!(table.group_count(), 2);
        let group_id = lookup(&table, 1).expect("key 1");
        let rows = table.group_rows_slice(group_id).unwrap();
        assert_eq!(rows, &[0, 2, 3]);
        assert_eq!(table.row_coord(rows[1]).unwrap(), (0, 2));
        assert!(lookup(&table, 42).is_none());
    }

    #[test]
    fn null_keys_form_their_own_group() {
        let table = table_from_keys(&[Some(1), None, None], RowListFlavor::Plain);
        assert_eq!(table.group_count(), 2);
        assert_eq!(table.row_count(), 3);
    }

    #[test]
    fn serialized_keys_survive_build_batches() {
        let mut table =
            JoinHashTable::new(vec![DataType::Utf8], RowListFlavor::Plain).unwrap();
        let first: Vec<ArrayRef> = vec![Arc::new(StringArray::from(vec!["aa", "bb"]))];
        table.add_build_block(&first, 2, 0).unwrap();
        // A second batch re-encodes through the same reusable buffer; stored
        // group keys must not alias it.
        let second: Vec<ArrayRef> =
            vec![Arc::new(StringArray::from(vec!["cc-much-longer", "aa"]))];
        table.add_build_block(&second, 2, 1).unwrap();
        table.finalize().unwrap();
        assert_eq!(table.group_count(), 3);

        let mut encoder = KeyEncoder::new(vec![DataType::Utf8]).unwrap();
        let probe: Vec<ArrayRef> = vec![Arc::new(StringArray::from(vec!["aa"]))];
        let encoded = encoder.encode_batch(&probe, 1).unwrap();
        let key_ref = encoder.key_ref(&encoded, 0);
        let group_id = table
            .find_with_hash(table.hash_encoded(key_ref), key_ref)
            .expect("aa");
        let rows = table.group_rows_slice(group_id).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(table.row_coord(rows[0]).unwrap(), (0, 0));
        assert_eq!(table.row_coord(rows[1]).unwrap(), (1, 1));
    }

    #[test]
    fn visited_flags_follow_flavor() {
        let table = table_from_keys(&[Some(1), Some(1)], RowListFlavor::RowVisited);
        assert!(!table.row_visited(0).unwrap());
        table.mark_row_visited(0, false).unwrap();
        assert!(!table.row_visited(0).unwrap());
        table.mark_row_visited(0, true).unwrap();
        table.mark_row_visited(0, false).unwrap();
        assert!(table.row_visited(0).unwrap());
        assert!(table.key_visited(0).is_err());

        let table = table_from_keys(&[Some(1)], RowListFlavor::KeyVisited);
        assert!(!table.key_visited(0).unwrap());
        table.set_key_visited(0).unwrap();
        assert!(table.key_visited(0).unwrap());
    }
}
