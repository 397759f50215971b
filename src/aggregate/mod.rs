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

//! The aggregation collaborator: merges partial aggregate states and
//! materializes them back into batches.
//!
//! The operator owns at most one live [`AggregationState`] at a time (the
//! hash table of the bucket being processed) and only ever manipulates it
//! through an [`Aggregator`]. The state is opaque to the operator; the
//! concrete type is whatever the aggregator's `create_state` returns.

use std::any::Any;
use std::fmt::Debug;

use arrow::datatypes::{Schema, SchemaRef};
use arrow::record_batch::RecordBatch;

use crate::error::Result;

pub mod row_merge;

/// Accumulated partial-aggregation state for one bucket.
pub trait AggregationState: Debug + Send {
    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any>;

    /// Number of distinct groups accumulated so far
    fn num_groups(&self) -> usize;
}

/// Combines batches of partial aggregate states.
///
/// Input batches carry the group-by key columns first, followed by one or
/// more opaque partial-state columns. The merge must be commutative: the
/// operator replays spilled batches in an order unrelated to arrival
/// order.
pub trait Aggregator: Debug + Send + Sync {
    /// How many leading columns of the input schema are group-by keys
    fn num_key_columns(&self) -> usize;

    /// A fresh, empty state
    fn create_state(&self) -> Box<dyn AggregationState>;

    /// Accumulate one batch of partial states into `state`.
    ///
    /// `no_more_keys` lets an implementation stop admitting new groups
    /// once set; the operator resets it whenever it creates a fresh
    /// state.
    fn merge_batch(
        &self,
        batch: &RecordBatch,
        state: &mut dyn AggregationState,
        no_more_keys: &mut bool,
    ) -> Result<()>;

    /// Materialize `state` as batches, consuming it. With
    /// `final_output = false` the batches are partial states suitable for
    /// re-merging (used when the operator repartitions); with `true` they
    /// are finalized output rows.
    fn convert_to_batches(
        &self,
        state: Box<dyn AggregationState>,
        final_output: bool,
    ) -> Result<Vec<RecordBatch>>;

    /// Schema of the batches `convert_to_batches` produces
    fn output_schema(&self, input_schema: &Schema, final_output: bool) -> SchemaRef;
}
