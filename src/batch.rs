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

//! [`TaggedBatch`]: a record batch plus its bucket tag.

use arrow::record_batch::RecordBatch;

/// Tag of a batch that has not been hash-partitioned yet
pub const UNPARTITIONED: i64 = -1;

/// A [`RecordBatch`] annotated with the bucket count it was last
/// partitioned for.
///
/// A tag of [`UNPARTITIONED`] means the batch may contain keys of any
/// bucket. A non-negative tag records the bucket count at partition
/// time; if the operator has since doubled its bucket count the tag is
/// stale and the batch must be rescattered before it is merged.
#[derive(Debug, Clone)]
pub struct TaggedBatch {
    pub batch: RecordBatch,
    pub bucket_tag: i64,
}

impl TaggedBatch {
    pub fn new(batch: RecordBatch, bucket_tag: i64) -> Self {
        Self { batch, bucket_tag }
    }

    /// Wrap a batch that has not been partitioned
    pub fn untagged(batch: RecordBatch) -> Self {
        Self::new(batch, UNPARTITIONED)
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    /// Estimated in-memory size of the batch, in bytes
    pub fn mem_size(&self) -> usize {
        self.batch.get_array_memory_size()
    }
}

impl From<RecordBatch> for TaggedBatch {
    fn from(batch: RecordBatch) -> Self {
        Self::untagged(batch)
    }
}
