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

//! [`RowMergeAggregator`]: merges `Int64` partial states by key.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use ahash::RandomState;
use arrow::array::{Array, ArrayRef, Int64Array};
use arrow::datatypes::{DataType, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use arrow::row::{RowConverter, Rows, SortField};
use hashbrown::hash_table::{Entry, HashTable};

use super::{AggregationState, Aggregator};
use crate::error::Result;
use crate::{exec_err, internal_err};

/// Default number of rows per materialized output batch
const DEFAULT_BATCH_SIZE: usize = 8192;

/// An [`Aggregator`] whose partial states are `Int64` columns combined by
/// addition.
///
/// This covers the merge side of `count` and `sum` aggregations: each
/// input row carries one partial per state column, and merging partials
/// for the same key adds them. Finalization is the identity, so the
/// output schema equals the input schema.
///
/// Group keys are the leading columns of the schema, normalized to the
/// arrow row format for hashing and comparison; any row-convertible key
/// types work.
#[derive(Debug)]
pub struct RowMergeAggregator {
    input_schema: SchemaRef,
    converter: Arc<RowConverter>,
    num_keys: usize,
    batch_size: usize,
}

impl RowMergeAggregator {
    pub fn try_new(input_schema: SchemaRef, num_keys: usize) -> Result<Self> {
        if num_keys == 0 || num_keys >= input_schema.fields().len() {
            return exec_err!(
                "schema with {} columns cannot have {} key columns",
                input_schema.fields().len(),
                num_keys
            );
        }
        for field in input_schema.fields().iter().skip(num_keys) {
            if field.data_type() != &DataType::Int64 {
                return exec_err!(
                    "partial state column {} has unsupported type {}",
                    field.name(),
                    field.data_type()
                );
            }
        }
        let sort_fields = input_schema
            .fields()
            .iter()
            .take(num_keys)
            .map(|f| SortField::new(f.data_type().clone()))
            .collect();
        Ok(Self {
            input_schema,
            converter: Arc::new(RowConverter::new(sort_fields)?),
            num_keys,
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }

    /// Set the maximum number of rows per materialized batch
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

impl Aggregator for RowMergeAggregator {
    fn num_key_columns(&self) -> usize {
        self.num_keys
    }

    fn create_state(&self) -> Box<dyn AggregationState> {
        let num_state_columns = self.input_schema.fields().len() - self.num_keys;
        Box::new(RowMergeState {
            converter: Arc::clone(&self.converter),
            random_state: RandomState::new(),
            group_rows: self.converter.empty_rows(0, 0),
            map: HashTable::new(),
            accumulators: vec![Vec::new(); num_state_columns],
        })
    }

    fn merge_batch(
        &self,
        batch: &RecordBatch,
        state: &mut dyn AggregationState,
        no_more_keys: &mut bool,
    ) -> Result<()> {
        let state = match state.as_any_mut().downcast_mut::<RowMergeState>() {
            Some(state) => state,
            None => return internal_err!("aggregation state type mismatch"),
        };
        if batch.num_rows() == 0 {
            return Ok(());
        }

        let keys: Vec<ArrayRef> = batch.columns()[..self.num_keys].to_vec();
        let rows = state.converter.convert_columns(&keys)?;

        let mut partials = Vec::with_capacity(batch.num_columns() - self.num_keys);
        for (index, column) in batch.columns().iter().enumerate().skip(self.num_keys) {
            match column.as_any().downcast_ref::<Int64Array>() {
                Some(array) => partials.push(array),
                None => {
                    return internal_err!("partial state column {index} is not Int64")
                }
            }
        }

        let RowMergeState {
            random_state,
            group_rows,
            map,
            accumulators,
            ..
        } = state;

        for i in 0..rows.num_rows() {
            let row = rows.row(i);
            let hash = random_state.hash_one(row.data());
            let group_idx = match map.entry(
                hash,
                |&(group_idx, _)| group_rows.row(group_idx) == row,
                |&(_, hash)| hash,
            ) {
                Entry::Occupied(entry) => entry.get().0,
                Entry::Vacant(entry) => {
                    if *no_more_keys {
                        continue;
                    }
                    let group_idx = group_rows.num_rows();
                    entry.insert((group_idx, hash));
                    group_rows.push(row);
                    for accumulator in accumulators.iter_mut() {
                        accumulator.push(0);
                    }
                    group_idx
                }
            };
            for (accumulator, column) in accumulators.iter_mut().zip(&partials) {
                if column.is_valid(i) {
                    accumulator[group_idx] += column.value(i);
                }
            }
        }
        Ok(())
    }

    fn convert_to_batches(
        &self,
        state: Box<dyn AggregationState>,
        _final_output: bool,
    ) -> Result<Vec<RecordBatch>> {
        // partials finalize to themselves, so both modes produce the
        // same shape
        let state = match state.into_any().downcast::<RowMergeState>() {
            Ok(state) => *state,
            Err(_) => return internal_err!("aggregation state type mismatch"),
        };
        let RowMergeState {
            converter,
            group_rows,
            accumulators,
            ..
        } = state;

        let num_groups = group_rows.num_rows();
        if num_groups == 0 {
            return Ok(vec![]);
        }

        let mut batches = Vec::with_capacity(num_groups.div_ceil(self.batch_size));
        let mut start = 0;
        while start < num_groups {
            let len = self.batch_size.min(num_groups - start);
            let mut columns =
                converter.convert_rows((start..start + len).map(|i| group_rows.row(i)))?;
            for accumulator in &accumulators {
                let partials = Int64Array::from(accumulator[start..start + len].to_vec());
                columns.push(Arc::new(partials) as ArrayRef);
            }
            batches.push(RecordBatch::try_new(self.input_schema.clone(), columns)?);
            start += len;
        }
        Ok(batches)
    }

    fn output_schema(&self, input_schema: &Schema, _final_output: bool) -> SchemaRef {
        Arc::new(input_schema.clone())
    }
}

/// Row-format hash table of group keys plus one accumulator column per
/// partial state column.
struct RowMergeState {
    converter: Arc<RowConverter>,
    random_state: RandomState,
    /// distinct group keys; `group_rows[i]` is the key of group `i`
    group_rows: Rows,
    /// (group index, key hash) probed by hash then verified against
    /// `group_rows`
    map: HashTable<(usize, u64)>,
    accumulators: Vec<Vec<i64>>,
}

impl fmt::Debug for RowMergeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowMergeState")
            .field("num_groups", &self.group_rows.num_rows())
            .field("num_state_columns", &self.accumulators.len())
            .finish()
    }
}

impl AggregationState for RowMergeState {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }

    fn num_groups(&self) -> usize {
        self.group_rows.num_rows()
    }
}
