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

//! Per-bucket batch queues and their backing spill streams.

use std::collections::VecDeque;

use arrow::compute::concat_batches;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;

use crate::batch::TaggedBatch;
use crate::error::Result;
use crate::spill::{SpillStore, SpillStream};

/// One hash partition of the key space: an in-memory FIFO of batches and
/// an optional spill stream, created lazily on the first flush.
///
/// Every batch held here carries the bucket tag it was partitioned under.
/// Tags are not persisted inside the spill payload; instead the bucket
/// records the tag of each written batch in order, and re-attaches them
/// when the stream is replayed.
#[derive(Debug, Default)]
pub(crate) struct Bucket {
    queue: VecDeque<TaggedBatch>,
    stream: Option<Box<dyn SpillStream>>,
    /// bucket tag of each batch written to `stream`, in write order
    spilled_tags: VecDeque<i64>,
}

impl Bucket {
    /// Queue a batch for this bucket. Empty batches are dropped.
    pub fn append(&mut self, batch: TaggedBatch) {
        if batch.num_rows() == 0 {
            return;
        }
        self.queue.push_back(batch);
    }

    /// Move the queued batches onto the spill stream, creating it if
    /// needed. Consecutive batches sharing a tag are concatenated into a
    /// single write so the replay path sees few, large, tag-homogeneous
    /// batches. Returns the number of bytes flushed.
    pub fn flush(&mut self, store: &dyn SpillStore, schema: &SchemaRef) -> Result<usize> {
        if self.queue.is_empty() {
            return Ok(0);
        }
        if self.stream.is_none() {
            self.stream = Some(store.create_stream(schema.clone())?);
        }
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => unreachable!("stream was just created"),
        };

        let mut flushed = 0;
        while !self.queue.is_empty() {
            let tag = self.queue[0].bucket_tag;
            let mut run: Vec<RecordBatch> = Vec::new();
            while self.queue.front().is_some_and(|next| next.bucket_tag == tag) {
                if let Some(next) = self.queue.pop_front() {
                    run.push(next.batch);
                }
            }
            let merged = concat_batches(schema, &run)?;
            if merged.num_rows() > 0 {
                flushed += merged.get_array_memory_size();
                stream.write(&merged)?;
                self.spilled_tags.push_back(tag);
            }
        }
        Ok(flushed)
    }

    /// Tear the bucket apart for draining: the spill stream (if any) with
    /// its recorded tag sequence, and the residual in-memory queue.
    pub fn into_parts(
        self,
    ) -> (
        Option<Box<dyn SpillStream>>,
        VecDeque<i64>,
        VecDeque<TaggedBatch>,
    ) {
        (self.stream, self.spilled_tags, self.queue)
    }
}
