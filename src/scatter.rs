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

//! Hash-partitions batches across buckets by their key columns.

use ahash::RandomState;
use arrow::array::{ArrayRef, UInt32Array};
use arrow::compute::take;
use arrow::datatypes::Schema;
use arrow::record_batch::RecordBatch;
use arrow::row::{RowConverter, SortField};

use crate::batch::TaggedBatch;
use crate::error::Result;

/// Splits batches into per-bucket sub-batches by hashing the key columns.
///
/// The key columns are normalized to the arrow row format and the row
/// bytes hashed with a fixed-seed [`RandomState`], so a given key maps to
/// the same hash for the whole lifetime of the operator. Buckets are the
/// hash modulo the bucket count; bucket counts are powers of two, so
/// doubling the count moves a key from bucket `b` only to `b` or
/// `b + old_count`. Spilled data therefore stays valid across extensions.
#[derive(Debug)]
pub(crate) struct BatchScatterer {
    converter: RowConverter,
    random_state: RandomState,
    num_keys: usize,
}

impl BatchScatterer {
    pub fn try_new(schema: &Schema, num_keys: usize) -> Result<Self> {
        let fields = schema
            .fields()
            .iter()
            .take(num_keys)
            .map(|f| SortField::new(f.data_type().clone()))
            .collect();
        Ok(Self {
            converter: RowConverter::new(fields)?,
            random_state: RandomState::with_seeds(0, 0, 0, 0),
            num_keys,
        })
    }

    /// Scatter `batch` into exactly `num_buckets` sub-batches, each tagged
    /// with `num_buckets`. Sub-batches of buckets no key mapped to are
    /// empty.
    pub fn scatter(
        &self,
        batch: &RecordBatch,
        num_buckets: usize,
    ) -> Result<Vec<TaggedBatch>> {
        let keys: Vec<ArrayRef> = batch.columns()[..self.num_keys].to_vec();
        let rows = self.converter.convert_columns(&keys)?;

        let mut indices: Vec<Vec<u32>> = vec![Vec::new(); num_buckets];
        for i in 0..rows.num_rows() {
            let hash = self.random_state.hash_one(rows.row(i).data());
            indices[(hash % num_buckets as u64) as usize].push(i as u32);
        }

        let mut scattered = Vec::with_capacity(num_buckets);
        for bucket_indices in indices {
            let bucket_indices = UInt32Array::from(bucket_indices);
            let columns = batch
                .columns()
                .iter()
                .map(|c| Ok(take(c.as_ref(), &bucket_indices, None)?))
                .collect::<Result<Vec<_>>>()?;
            let sub_batch = RecordBatch::try_new(batch.schema(), columns)?;
            scattered.push(TaggedBatch::new(sub_batch, num_buckets as i64));
        }
        Ok(scattered)
    }

    /// The bucket a single-row key batch maps to under `num_buckets`;
    /// exposed for tests asserting partition placement.
    #[cfg(test)]
    pub fn bucket_of(&self, batch: &RecordBatch, row: usize, num_buckets: usize) -> usize {
        let keys: Vec<ArrayRef> = batch.columns()[..self.num_keys].to_vec();
        let rows = self.converter.convert_columns(&keys).unwrap();
        (self.random_state.hash_one(rows.row(row).data()) % num_buckets as u64) as usize
    }
}
