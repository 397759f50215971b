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

//! The grace-hash merging aggregate operator.
//!
//! Consumes batches of partially aggregated states and emits fully merged,
//! finalized rows, bounding peak memory by hash-partitioning the key space
//! into buckets and spilling non-current buckets to temporary streams.
//!
//! Bucket 0 is merged in memory as input arrives; batches for other
//! buckets are queued and flushed to spill streams under memory pressure.
//! If pressure persists after flushing, the bucket count doubles and the
//! in-memory state is rescattered under the new partitioning. Once the
//! input is exhausted the buckets are finalized in index order, replaying
//! each bucket's spilled and queued batches through the same merge path.

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use std::time::Instant;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use log::{info, trace};

use crate::aggregate::{AggregationState, Aggregator};
use crate::batch::TaggedBatch;
use crate::bucket::Bucket;
use crate::error::Result;
use crate::memory::MemoryTracker;
use crate::metrics::GraceMetrics;
use crate::port::{InputPort, OperatorStatus, OutputPort};
use crate::scatter::BatchScatterer;
use crate::spill::SpillStore;
use crate::{config_err, exec_err, internal_err, resources_err};

/// Options recognized by [`GraceMergingAggregate`]
#[derive(Debug, Clone)]
pub struct GraceAggregateConfig {
    /// Soft memory ceiling in bytes; 0 disables spilling entirely.
    /// The overflow predicate triggers at 80% of this value.
    pub max_memory: usize,
    /// Upper bound on the bucket count; must be a positive power of two.
    /// Needing more buckets than this raises `ResourcesExhausted`.
    pub max_buckets: usize,
}

impl Default for GraceAggregateConfig {
    fn default() -> Self {
        Self {
            max_memory: 0,
            max_buckets: 256,
        }
    }
}

impl GraceAggregateConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_memory(mut self, max_memory: usize) -> Self {
        self.max_memory = max_memory;
        self
    }

    pub fn with_max_buckets(mut self, max_buckets: usize) -> Self {
        self.max_buckets = max_buckets;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_buckets == 0 || !self.max_buckets.is_power_of_two() {
            return config_err!(
                "max_buckets must be a positive power of two, got {}",
                self.max_buckets
            );
        }
        Ok(())
    }
}

/// Pull-based streaming operator merging partial aggregate batches under
/// a memory budget.
///
/// The pipeline scheduler drives the operator by alternating
/// [`prepare`](Self::prepare) (cheap port bookkeeping, reports what is
/// needed next) and [`work`](Self::work) (merging, spill I/O). Upstream
/// feeds [`InputPort`]; downstream drains [`OutputPort`].
#[derive(Debug)]
pub struct GraceMergingAggregate {
    input_schema: SchemaRef,
    output_schema: SchemaRef,
    aggregator: Arc<dyn Aggregator>,
    spills: Arc<dyn SpillStore>,
    memory: Arc<dyn MemoryTracker>,
    max_memory: usize,
    max_buckets: usize,

    input: InputPort,
    output: OutputPort,

    /// `buckets.len()` is the current bucket count; always a power of two
    buckets: Vec<Bucket>,
    /// index of the bucket being merged; strictly increasing
    current_bucket: usize,
    /// hash table of the current bucket, created lazily
    state: Option<Box<dyn AggregationState>>,
    no_more_keys: bool,
    /// bytes per distinct group, measured during the latest rescatter;
    /// zero until the first one
    per_key_bytes: usize,

    scatterer: BatchScatterer,
    /// finalized batches of the current bucket, not yet emitted
    pending_output: VecDeque<RecordBatch>,
    input_finished: bool,
    input_batch: Option<TaggedBatch>,
    output_batch: Option<RecordBatch>,

    metrics: GraceMetrics,
}

impl GraceMergingAggregate {
    pub fn try_new(
        input_schema: SchemaRef,
        aggregator: Arc<dyn Aggregator>,
        spills: Arc<dyn SpillStore>,
        memory: Arc<dyn MemoryTracker>,
        config: GraceAggregateConfig,
    ) -> Result<Self> {
        config.validate()?;
        let num_keys = aggregator.num_key_columns();
        if num_keys == 0 || num_keys > input_schema.fields().len() {
            return exec_err!(
                "aggregator expects {} key columns but the schema has {} columns",
                num_keys,
                input_schema.fields().len()
            );
        }
        let scatterer = BatchScatterer::try_new(input_schema.as_ref(), num_keys)?;
        let output_schema = aggregator.output_schema(input_schema.as_ref(), true);
        Ok(Self {
            input_schema,
            output_schema,
            aggregator,
            spills,
            memory,
            max_memory: config.max_memory,
            max_buckets: config.max_buckets,
            input: InputPort::default(),
            output: OutputPort::default(),
            buckets: vec![Bucket::default()],
            current_bucket: 0,
            state: None,
            no_more_keys: false,
            per_key_bytes: 0,
            scatterer,
            pending_output: VecDeque::new(),
            input_finished: false,
            input_batch: None,
            output_batch: None,
            metrics: GraceMetrics::new(),
        })
    }

    /// Schema of the batches pushed to the output port
    pub fn schema(&self) -> SchemaRef {
        self.output_schema.clone()
    }

    pub fn input_mut(&mut self) -> &mut InputPort {
        &mut self.input
    }

    pub fn output_mut(&mut self) -> &mut OutputPort {
        &mut self.output
    }

    /// Counters and timings accumulated so far; also logged once when the
    /// operator drops
    pub fn metrics(&self) -> &GraceMetrics {
        &self.metrics
    }

    /// Current bucket count
    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Index of the bucket currently being merged or finalized
    pub fn current_bucket(&self) -> usize {
        self.current_bucket
    }

    /// Move batches across the ports and report what the operator needs
    /// next. Cheap and non-blocking; all heavy lifting happens in
    /// [`work`](Self::work).
    pub fn prepare(&mut self) -> Result<OperatorStatus> {
        if self.output.is_closed() {
            self.input.close();
            return Ok(OperatorStatus::Finished);
        }

        if let Some(batch) = self.output_batch.take() {
            if self.output.can_push() {
                self.metrics.output_rows.add(batch.num_rows());
                self.metrics.output_blocks.add(1);
                self.output.push(batch);
            } else {
                self.output_batch = Some(batch);
            }
            return Ok(OperatorStatus::PortFull);
        }

        if self.input_batch.is_some() {
            return Ok(OperatorStatus::Ready);
        }

        if !self.input_finished {
            if self.input.is_finished() {
                self.input_finished = true;
                return Ok(OperatorStatus::Ready);
            }
            self.input.set_needed();
            if !self.input.has_data() {
                return Ok(OperatorStatus::NeedData);
            }
            let batch = self.input.pull()?;
            self.metrics.input_rows.add(batch.num_rows());
            self.metrics.input_blocks.add(1);
            self.input_batch = Some(batch);
            return Ok(OperatorStatus::Ready);
        }

        if self.current_bucket >= self.buckets.len() && self.pending_output.is_empty() {
            self.output.finish();
            return Ok(OperatorStatus::Finished);
        }
        Ok(OperatorStatus::Ready)
    }

    /// Consume the pulled input batch, or produce the next output batch
    /// once the input is exhausted.
    pub fn work(&mut self) -> Result<()> {
        if let Some(batch) = self.input_batch.take() {
            debug_assert!(!self.input_finished);
            return self.merge_batch(batch);
        }

        debug_assert!(self.input_finished);
        if self.pending_output.is_empty() {
            if self.current_bucket >= self.buckets.len() {
                return Ok(());
            }
            self.finalize_current_bucket()?;
            self.current_bucket += 1;
        }
        while let Some(batch) = self.pending_output.pop_front() {
            if batch.num_rows() == 0 {
                continue;
            }
            self.output_batch = Some(batch);
            break;
        }
        Ok(())
    }

    /// Merge one batch into the current bucket, spilling and repartitioning
    /// first if memory is tight. Batches tagged for the current bucket
    /// count feed the aggregation state directly; everything else is
    /// rescattered, the current bucket's share merged and the rest queued
    /// on their buckets.
    fn merge_batch(&mut self, batch: TaggedBatch) -> Result<()> {
        if batch.num_rows() == 0 {
            return Ok(());
        }

        if self.is_memory_overflow() {
            self.flush_buckets()?;
        }
        if self.is_memory_overflow() {
            self.extend_buckets()?;
            self.rehash_state()?;
        }

        trace!(
            "merging batch: rows {}, bytes {}, tag {}, current bucket {}, buckets {}, mem used {}",
            batch.num_rows(),
            batch.mem_size(),
            batch.bucket_tag,
            self.current_bucket,
            self.buckets.len(),
            self.memory.current_usage(),
        );

        let num_buckets = self.buckets.len();
        if batch.bucket_tag == num_buckets as i64 || num_buckets == 1 {
            self.merge_into_current(&batch.batch)
        } else {
            let scattered = self.scatter_batch(&batch.batch)?;
            self.route_scattered(scattered)
        }
    }

    /// Feed the current bucket's share into the aggregation state and
    /// queue every later bucket's share. Shares of already finalized
    /// buckets are necessarily empty (the partition function only moves
    /// keys forward when the bucket count grows) and are dropped.
    fn route_scattered(&mut self, scattered: Vec<TaggedBatch>) -> Result<()> {
        for (index, part) in scattered.into_iter().enumerate() {
            if index == self.current_bucket {
                self.merge_into_current(&part.batch)?;
            } else if index > self.current_bucket {
                self.buckets[index].append(part);
            }
        }
        Ok(())
    }

    fn merge_into_current(&mut self, batch: &RecordBatch) -> Result<()> {
        if self.state.is_none() {
            self.state = Some(self.aggregator.create_state());
            self.no_more_keys = false;
        }
        if let Some(state) = self.state.as_mut() {
            self.aggregator
                .merge_batch(batch, state.as_mut(), &mut self.no_more_keys)?;
        }
        Ok(())
    }

    fn scatter_batch(&self, batch: &RecordBatch) -> Result<Vec<TaggedBatch>> {
        let timer = self.metrics.scatter_time.timer();
        let scattered = self.scatterer.scatter(batch, self.buckets.len())?;
        timer.done();
        Ok(scattered)
    }

    /// Double the bucket count. The new bucket slots start empty; buffered
    /// batches keep their (now stale) tags and are rescattered when they
    /// are next merged.
    fn extend_buckets(&mut self) -> Result<()> {
        let current_size = self.buckets.len();
        let next_size = current_size * 2;
        if next_size > self.max_buckets {
            return resources_err!(
                "aggregation needs more than {} buckets; consider raising the \
                 memory limit or the bucket limit",
                self.max_buckets
            );
        }
        info!("extending buckets from {current_size} to {next_size}");
        self.buckets.resize_with(next_size, Bucket::default);
        Ok(())
    }

    /// Re-materialize the current state and repartition it under the new
    /// bucket count: the current bucket's share is merged into a fresh
    /// state, later buckets' shares are queued. Also refreshes the
    /// per-group memory estimate from the materialized batches.
    fn rehash_state(&mut self) -> Result<()> {
        let state = match self.state.take() {
            Some(state) => state,
            None => self.aggregator.create_state(),
        };
        let batches = self.aggregator.convert_to_batches(state, false)?;

        let mut total_rows = 0;
        let mut total_bytes = 0;
        for batch in &batches {
            total_rows += batch.num_rows();
            total_bytes += batch.get_array_memory_size();
        }
        if total_rows > 0 {
            self.per_key_bytes = total_bytes / total_rows;
        }

        self.state = Some(self.aggregator.create_state());
        self.no_more_keys = false;
        for batch in batches {
            let scattered = self.scatter_batch(&batch)?;
            self.route_scattered(scattered)?;
        }
        Ok(())
    }

    /// Flush the queues of every bucket after the current one to their
    /// spill streams.
    fn flush_buckets(&mut self) -> Result<()> {
        let before = self.memory.current_usage();
        let start = Instant::now();
        let mut flushed = 0;
        for index in self.current_bucket + 1..self.buckets.len() {
            flushed += self.buckets[index].flush(self.spills.as_ref(), &self.input_schema)?;
        }
        self.metrics.spill_time.add_elapsed(start);
        self.metrics.spill_bytes.add(flushed);
        info!(
            "flushed {} bytes in {} ms, memory usage: {} -> {}",
            flushed,
            start.elapsed().as_millis(),
            before,
            self.memory.current_usage(),
        );
        Ok(())
    }

    /// True when merging should not continue before memory is reclaimed.
    ///
    /// Once a per-group cost estimate exists the prediction is
    /// `usage + per_key_bytes * groups` against 80% of the limit. Before
    /// any estimate exists, trigger at half the limit; this forces an
    /// early rescatter, which is what populates the estimate.
    fn is_memory_overflow(&self) -> bool {
        if self.max_memory == 0 {
            return false;
        }
        let cap = self.max_memory * 8 / 10;
        let current_mem_used = self.memory.current_usage();
        let current_groups = self.state.as_ref().map(|s| s.num_groups()).unwrap_or(0);
        if self.per_key_bytes > 0 {
            if current_mem_used + self.per_key_bytes * current_groups >= cap {
                info!(
                    "memory overflow: used {}, cap {}, per key bytes {}, groups {}, buckets {}",
                    current_mem_used,
                    cap,
                    self.per_key_bytes,
                    current_groups,
                    self.buckets.len(),
                );
                return true;
            }
        } else if current_mem_used * 2 >= self.max_memory {
            info!(
                "memory overflow on half of max usage: used {}, max {}, buckets {}",
                current_mem_used,
                self.max_memory,
                self.buckets.len(),
            );
            return true;
        }
        false
    }

    /// Replay the current bucket's spilled and queued batches through the
    /// merge path, then convert its state into finalized output batches.
    ///
    /// The replay may itself flush or repartition; any batches spilled
    /// while draining land in buckets after the current one, so no
    /// finalized bucket is ever written to again.
    fn finalize_current_bucket(&mut self) -> Result<()> {
        let start = Instant::now();
        let mut read_bytes = 0;
        let mut read_rows = 0;

        if self.state.is_none() {
            self.state = Some(self.aggregator.create_state());
            self.no_more_keys = false;
        }

        let bucket = mem::take(&mut self.buckets[self.current_bucket]);
        let (stream, mut spilled_tags, queue) = bucket.into_parts();

        if let Some(mut stream) = stream {
            stream.finish_writing()?;
            while let Some(batch) = stream.read()? {
                let tag = match spilled_tags.pop_front() {
                    Some(tag) => tag,
                    None => {
                        return internal_err!(
                            "spilled batch count of bucket {} exceeds its recorded tags",
                            self.current_bucket
                        )
                    }
                };
                read_bytes += batch.get_array_memory_size();
                read_rows += batch.num_rows();
                self.merge_batch(TaggedBatch::new(batch, tag))?;
            }
            if !spilled_tags.is_empty() {
                return internal_err!(
                    "bucket {} recorded {} more spilled batches than its stream holds",
                    self.current_bucket,
                    spilled_tags.len()
                );
            }
            self.metrics.read_time.add_elapsed(start);
        }
        for batch in queue {
            self.merge_batch(batch)?;
        }

        let state = match self.state.take() {
            Some(state) => state,
            None => self.aggregator.create_state(),
        };
        let batches = self.aggregator.convert_to_batches(state, true)?;
        info!(
            "prepared output of bucket {}: read {} bytes, {} rows from spill in {} ms",
            self.current_bucket,
            read_bytes,
            read_rows,
            start.elapsed().as_millis(),
        );
        self.pending_output.extend(batches);
        Ok(())
    }
}

impl Drop for GraceMergingAggregate {
    fn drop(&mut self) {
        info!("grace merging aggregate metrics: {}", self.metrics);
    }
}
