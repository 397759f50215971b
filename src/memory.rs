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

//! [`MemoryTracker`]: the operator's read-only view of memory pressure.

use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Reports the memory usage the operator should budget against.
///
/// The tracker is typically process- or query-wide and shared with other
/// operators; this operator only ever reads it. Whoever accounts
/// allocations (an engine's memory pool, an allocator hook, ...) is
/// responsible for keeping it current.
pub trait MemoryTracker: Debug + Send + Sync {
    /// Currently tracked usage, in bytes
    fn current_usage(&self) -> usize;
}

/// A [`MemoryTracker`] backed by a shared atomic counter.
///
/// The handle is cheap to clone; all clones observe the same counter.
#[derive(Debug, Default)]
pub struct SharedUsageTracker {
    used: AtomicUsize,
}

impl SharedUsageTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record `n` additional bytes of usage
    pub fn grow(&self, n: usize) {
        self.used.fetch_add(n, Ordering::Relaxed);
    }

    /// Record `n` bytes released, saturating at zero
    pub fn shrink(&self, n: usize) {
        let _ = self
            .used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                Some(used.saturating_sub(n))
            });
    }

    /// Overwrite the tracked usage
    pub fn set_usage(&self, n: usize) {
        self.used.store(n, Ordering::Relaxed);
    }
}

impl MemoryTracker for SharedUsageTracker {
    fn current_usage(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }
}
