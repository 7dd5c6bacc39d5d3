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
//! Runtime counters and timers for operator-level metrics.
//!
//! Responsibilities:
//! - Provides named atomic counters grouped under a profile node.
//! - Provides scoped wall-clock timers accumulating nanoseconds into counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CounterUnit {
    Unit,
    Bytes,
    TimeNs,
}

#[derive(Debug)]
pub struct Counter {
    name: String,
    unit: CounterUnit,
    value: AtomicI64,
}

pub type CounterRef = Arc<Counter>;

impl Counter {
    pub fn new(name: impl Into<String>, unit: CounterUnit) -> CounterRef {
        Arc::new(Self {
            name: name.into(),
            unit,
            value: AtomicI64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> CounterUnit {
        self.unit
    }

    pub fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A named group of counters owned by one operator instance.
#[derive(Clone, Debug, Default)]
pub struct RuntimeProfile {
    counters: Arc<Mutex<HashMap<String, CounterRef>>>,
}

impl RuntimeProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_counter(&self, name: impl Into<String>, unit: CounterUnit) -> CounterRef {
        let name = name.into();
        let mut guard = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            guard
                .entry(name.clone())
                .or_insert_with(|| Counter::new(name, unit)),
        )
    }

    pub fn add_timer(&self, name: impl Into<String>) -> CounterRef {
        self.add_counter(name, CounterUnit::TimeNs)
    }

    pub fn counter(&self, name: &str) -> Option<CounterRef> {
        let guard = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        guard.get(name).cloned()
    }
}

/// Accumulates elapsed wall-clock nanoseconds into a counter on drop.
pub struct ScopedTimer {
    counter: CounterRef,
    start: Instant,
}

impl ScopedTimer {
    pub fn new(counter: CounterRef) -> Self {
        Self {
            counter,
            start: Instant::now(),
        }
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed().as_nanos();
        self.counter.add(clamp_u128_to_i64(elapsed));
    }
}

pub fn clamp_u128_to_i64(value: u128) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_timer_accumulates() {
        let profile = RuntimeProfile::new();
        let timer = profile.add_timer("SearchHashTableTime");
        {
            let _t = ScopedTimer::new(Arc::clone(&timer));
        }
        assert!(timer.value() >= 0);
        assert!(profile.counter("SearchHashTableTime").is_some());
    }
}
