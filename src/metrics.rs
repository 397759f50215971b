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

//! Metric value types and the operator's metrics set.

use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A counter to record things such as number of input or output rows
///
/// Note `clone`ing counters update the same underlying metrics
#[derive(Debug, Clone, Default)]
pub struct Count {
    value: Arc<AtomicUsize>,
}

impl Count {
    /// create a new counter
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `n` to the metric's value
    pub fn add(&self, n: usize) {
        // relaxed ordering for operations on `value` poses no issues
        // we're purely using atomic ops with no associated memory ops
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get the current value
    pub fn value(&self) -> usize {
        self.value.load(Ordering::Relaxed)
    }
}

/// Measure a potentially non contiguous duration of time
#[derive(Debug, Clone, Default)]
pub struct Time {
    /// elapsed time, in nanoseconds
    nanos: Arc<AtomicUsize>,
}

impl Time {
    /// Create a new [`Time`] wrapper suitable for recording elapsed
    /// times for operations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add elapsed nanoseconds since `start` to self
    pub fn add_elapsed(&self, start: Instant) {
        self.add_duration(start.elapsed());
    }

    /// Add duration of time to self
    pub fn add_duration(&self, duration: Duration) {
        let more_nanos = duration.as_nanos() as usize;
        self.nanos.fetch_add(more_nanos, Ordering::Relaxed);
    }

    /// return a scoped guard that adds the amount of time elapsed
    /// between its creation and its drop or call to `stop` to the
    /// underlying metric.
    pub fn timer(&self) -> ScopedTimerGuard<'_> {
        ScopedTimerGuard {
            inner: self,
            start: Some(Instant::now()),
        }
    }

    /// Get the number of nanoseconds recorded by this Time metric
    pub fn value(&self) -> usize {
        self.nanos.load(Ordering::Relaxed)
    }

    /// Get the recorded time in whole milliseconds
    pub fn millis(&self) -> usize {
        self.value() / 1_000_000
    }
}

/// RAII structure that adds all time between its construction and
/// destruction to the underlying metric, or the first call to `stop`,
/// whichever comes first
pub struct ScopedTimerGuard<'a> {
    inner: &'a Time,
    start: Option<Instant>,
}

impl ScopedTimerGuard<'_> {
    /// Stop the timer timing and record the time taken
    pub fn stop(&mut self) {
        if let Some(start) = self.start.take() {
            self.inner.add_elapsed(start)
        }
    }

    /// Stop the timer, record the time taken and consume self
    pub fn done(mut self) {
        self.stop()
    }
}

impl Drop for ScopedTimerGuard<'_> {
    fn drop(&mut self) {
        self.stop()
    }
}

/// The set of metrics the operator reports once, when it is dropped.
#[derive(Debug, Clone, Default)]
pub struct GraceMetrics {
    /// batches pulled from the input port
    pub input_blocks: Count,
    /// rows pulled from the input port
    pub input_rows: Count,
    /// batches pushed to the output port
    pub output_blocks: Count,
    /// rows pushed to the output port
    pub output_rows: Count,
    /// bytes written to spill streams
    pub spill_bytes: Count,
    /// time spent writing spill streams
    pub spill_time: Time,
    /// time spent replaying spilled buckets
    pub read_time: Time,
    /// time spent hash-scattering batches
    pub scatter_time: Time,
}

impl GraceMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Display for GraceMetrics {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "total_input_blocks: {}, total_input_rows: {}, \
             total_output_blocks: {}, total_output_rows: {}, \
             total_spill_bytes: {}, total_spill_ms: {}, \
             total_read_ms: {}, total_scatter_ms: {}",
            self.input_blocks.value(),
            self.input_rows.value(),
            self.output_blocks.value(),
            self.output_rows.value(),
            self.spill_bytes.value(),
            self.spill_time.millis(),
            self.read_time.millis(),
            self.scatter_time.millis(),
        )
    }
}
