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

//! Grace-hash merging aggregation over Arrow record batches.
//!
//! [`GraceMergingAggregate`] is a pull-based streaming operator that
//! consumes batches of partially aggregated states (group-by key columns
//! followed by partial state columns) and emits fully merged, finalized
//! rows. Peak memory is bounded by recursively hash-partitioning the key
//! space into buckets and spilling non-current buckets to temporary
//! streams; partitions double in count when flushing alone does not
//! relieve pressure.
//!
//! The operator is built around three collaborators it borrows rather
//! than owns:
//!
//! * an [`Aggregator`] that knows how to merge and materialize partial
//!   states (a row-format implementation for additive `Int64` partials,
//!   [`RowMergeAggregator`], is included),
//! * a [`SpillStore`] producing temporary batch streams
//!   ([`IpcSpillStore`] writes Arrow IPC files), and
//! * a [`MemoryTracker`] reporting the memory usage to budget against.
//!
//! ```
//! use std::sync::Arc;
//! use arrow::array::Int64Array;
//! use arrow::datatypes::{DataType, Field, Schema};
//! use arrow::record_batch::RecordBatch;
//! use grace_aggregate::{
//!     GraceAggregateConfig, GraceMergingAggregate, IpcSpillStore,
//!     OperatorStatus, RowMergeAggregator, SharedUsageTracker, TaggedBatch,
//! };
//!
//! # fn main() -> grace_aggregate::Result<()> {
//! let schema = Arc::new(Schema::new(vec![
//!     Field::new("k", DataType::Int64, false),
//!     Field::new("count", DataType::Int64, false),
//! ]));
//! let aggregator = Arc::new(RowMergeAggregator::try_new(schema.clone(), 1)?);
//! let mut op = GraceMergingAggregate::try_new(
//!     schema.clone(),
//!     aggregator,
//!     Arc::new(IpcSpillStore::new()),
//!     SharedUsageTracker::new(),
//!     GraceAggregateConfig::new(),
//! )?;
//!
//! let mut inputs = vec![RecordBatch::try_new(
//!     schema,
//!     vec![
//!         Arc::new(Int64Array::from(vec![1, 1, 2])),
//!         Arc::new(Int64Array::from(vec![1, 1, 1])),
//!     ],
//! )?]
//! .into_iter();
//!
//! let mut merged_rows = 0;
//! loop {
//!     match op.prepare()? {
//!         OperatorStatus::NeedData => match inputs.next() {
//!             Some(batch) => op.input_mut().push(TaggedBatch::untagged(batch)),
//!             None => op.input_mut().finish(),
//!         },
//!         OperatorStatus::PortFull => {
//!             if let Some(batch) = op.output_mut().pull() {
//!                 merged_rows += batch.num_rows();
//!             }
//!         }
//!         OperatorStatus::Ready => op.work()?,
//!         OperatorStatus::Finished => break,
//!     }
//! }
//! assert_eq!(merged_rows, 2);
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod batch;
mod bucket;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod operator;
pub mod port;
mod scatter;
pub mod spill;

pub use aggregate::row_merge::RowMergeAggregator;
pub use aggregate::{AggregationState, Aggregator};
pub use batch::{TaggedBatch, UNPARTITIONED};
pub use error::{GraceError, Result};
pub use memory::{MemoryTracker, SharedUsageTracker};
pub use operator::{GraceAggregateConfig, GraceMergingAggregate};
pub use port::{InputPort, OperatorStatus, OutputPort};
pub use spill::{IpcSpillStore, SpillStore, SpillStream};
