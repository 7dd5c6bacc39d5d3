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
//! Logical memory accounting for join scratch allocations.
//!
//! Responsibilities:
//! - Records byte deltas reported by owners of scratch buffers and arenas.
//! - Rolls every delta up through the tracker's ancestor chain so an
//!   operator-level tracker sees the sum of its components.
//!
//! Only explicitly reported bytes are counted; this is not a view of
//! allocator or process RSS state.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug)]
pub struct MemTracker {
    label: String,
    parent: Option<Arc<MemTracker>>,
    current: AtomicI64,
    peak: AtomicI64,
}

impl MemTracker {
    pub fn new_root(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            parent: None,
            current: AtomicI64::new(0),
            peak: AtomicI64::new(0),
        })
    }

    pub fn new_child(label: impl Into<String>, parent: &Arc<MemTracker>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            parent: Some(Arc::clone(parent)),
            current: AtomicI64::new(0),
            peak: AtomicI64::new(0),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }

    /// Apply a signed byte delta to this tracker and every ancestor.
    pub fn adjust(&self, delta: i64) {
        if delta == 0 {
            return;
        }
        let updated = self.current.fetch_add(delta, Ordering::AcqRel) + delta;
        self.peak.fetch_max(updated, Ordering::AcqRel);
        if let Some(parent) = self.parent.as_ref() {
            parent.adjust(delta);
        }
    }

    pub fn consume(&self, bytes: i64) {
        if bytes > 0 {
            self.adjust(bytes);
        }
    }

    pub fn release(&self, bytes: i64) {
        if bytes > 0 {
            self.adjust(-bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_deltas_roll_up_to_ancestors() {
        let root = MemTracker::new_root("join");
        let child = MemTracker::new_child("scratch", &root);
        child.consume(128);
        assert_eq!(child.current(), 128);
        assert_eq!(root.current(), 128);
        child.adjust(-28);
        assert_eq!(child.current(), 100);
        assert_eq!(root.current(), 100);
        assert_eq!(root.peak(), 128);
        child.release(100);
        assert_eq!(root.current(), 0);
        assert_eq!(child.label(), "scratch");
    }
}
