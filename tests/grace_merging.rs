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

//! End-to-end tests driving the operator through its ports the way the
//! pipeline scheduler would.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;

use grace_aggregate::{
    Aggregator, GraceAggregateConfig, GraceError, GraceMergingAggregate, IpcSpillStore,
    MemoryTracker, OperatorStatus, Result, RowMergeAggregator, SharedUsageTracker,
    SpillStore, TaggedBatch,
};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn int_count_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, false),
        Field::new("count", DataType::Int64, false),
    ]))
}

fn int_count_batch(keys: Vec<i64>) -> RecordBatch {
    let counts = vec![1_i64; keys.len()];
    RecordBatch::try_new(
        int_count_schema(),
        vec![
            Arc::new(Int64Array::from(keys)),
            Arc::new(Int64Array::from(counts)),
        ],
    )
    .unwrap()
}

fn int_pairs_batch(pairs: &[(i64, i64)]) -> RecordBatch {
    RecordBatch::try_new(
        int_count_schema(),
        vec![
            Arc::new(Int64Array::from(
                pairs.iter().map(|(k, _)| *k).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(
                pairs.iter().map(|(_, v)| *v).collect::<Vec<_>>(),
            )),
        ],
    )
    .unwrap()
}

fn make_operator(
    schema: SchemaRef,
    spills: Arc<dyn SpillStore>,
    memory: Arc<dyn MemoryTracker>,
    config: GraceAggregateConfig,
) -> GraceMergingAggregate {
    let aggregator = Arc::new(RowMergeAggregator::try_new(schema.clone(), 1).unwrap());
    GraceMergingAggregate::try_new(schema, aggregator, spills, memory, config).unwrap()
}

/// Drive the operator to completion. `after_push(n)` runs after the n-th
/// batch has been pushed, letting tests vary memory pressure mid-stream.
fn drive(
    op: &mut GraceMergingAggregate,
    batches: Vec<RecordBatch>,
    mut after_push: impl FnMut(usize),
) -> Result<Vec<RecordBatch>> {
    let mut inputs = batches.into_iter();
    let mut pushed = 0;
    let mut outputs = Vec::new();
    loop {
        match op.prepare()? {
            OperatorStatus::NeedData => match inputs.next() {
                Some(batch) => {
                    op.input_mut().push(TaggedBatch::untagged(batch));
                    pushed += 1;
                    after_push(pushed);
                }
                None => op.input_mut().finish(),
            },
            OperatorStatus::PortFull => {
                if let Some(batch) = op.output_mut().pull() {
                    outputs.push(batch);
                }
            }
            OperatorStatus::Ready => op.work()?,
            OperatorStatus::Finished => return Ok(outputs),
        }
    }
}

fn collect_int_counts(batches: &[RecordBatch]) -> HashMap<i64, i64> {
    let mut out = HashMap::new();
    for batch in batches {
        let keys = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        let counts = batch
            .column(1)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        for i in 0..batch.num_rows() {
            *out.entry(keys.value(i)).or_insert(0) += counts.value(i);
        }
    }
    out
}

/// What a single-pass merge of all batches would produce
fn reference_counts(schema: SchemaRef, batches: &[RecordBatch]) -> HashMap<i64, i64> {
    let aggregator = RowMergeAggregator::try_new(schema, 1).unwrap();
    let mut state = aggregator.create_state();
    let mut no_more_keys = false;
    for batch in batches {
        aggregator
            .merge_batch(batch, state.as_mut(), &mut no_more_keys)
            .unwrap();
    }
    let merged = aggregator.convert_to_batches(state, true).unwrap();
    collect_int_counts(&merged)
}

#[test]
fn counts_merge_without_memory_limit() -> Result<()> {
    // S1: count aggregation, max_memory 0, a single bucket
    init_logs();
    let schema = Arc::new(Schema::new(vec![
        Field::new("k", DataType::Utf8, false),
        Field::new("count", DataType::Int64, false),
    ]));
    let batches = vec![
        RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(vec!["a", "a", "b"])),
                Arc::new(Int64Array::from(vec![1, 1, 1])),
            ],
        )
        .unwrap(),
        RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(vec!["b", "c"])),
                Arc::new(Int64Array::from(vec![1, 1])),
            ],
        )
        .unwrap(),
    ];

    let mut op = make_operator(
        schema,
        Arc::new(IpcSpillStore::new()),
        SharedUsageTracker::new(),
        GraceAggregateConfig::new().with_max_buckets(1),
    );
    let outputs = drive(&mut op, batches, |_| {})?;

    let mut counts = HashMap::new();
    for batch in &outputs {
        let keys = batch
            .column(0)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        let values = batch
            .column(1)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        for i in 0..batch.num_rows() {
            *counts.entry(keys.value(i).to_string()).or_insert(0) += values.value(i);
        }
    }
    assert_eq!(counts.len(), 3);
    assert_eq!(counts["a"], 2);
    assert_eq!(counts["b"], 2);
    assert_eq!(counts["c"], 1);

    assert_eq!(op.num_buckets(), 1);
    assert_eq!(op.metrics().spill_bytes.value(), 0);
    Ok(())
}

#[test]
fn sums_of_overlapping_partials_merge() -> Result<()> {
    // S3: sum(v) over partials [(1,1),(2,2)] and [(1,3)]
    let batches = vec![
        int_pairs_batch(&[(1, 1), (2, 2)]),
        int_pairs_batch(&[(1, 3)]),
    ];
    let mut op = make_operator(
        int_count_schema(),
        Arc::new(IpcSpillStore::new()),
        SharedUsageTracker::new(),
        GraceAggregateConfig::new().with_max_buckets(1),
    );
    let outputs = drive(&mut op, batches, |_| {})?;
    let sums = collect_int_counts(&outputs);
    assert_eq!(sums, HashMap::from([(1, 4), (2, 2)]));
    Ok(())
}

#[test]
fn pressure_spills_extends_and_conserves_every_key() -> Result<()> {
    // S2: 10 batches of 1000 distinct keys each; pressure for the first
    // two ingests forces spilling and two bucket extensions
    init_logs();
    let tracker = SharedUsageTracker::new();
    tracker.set_usage(600_000);

    let batches: Vec<RecordBatch> = (0..10)
        .map(|i| int_count_batch((i * 1000..(i + 1) * 1000).collect()))
        .collect();

    let mut op = make_operator(
        int_count_schema(),
        Arc::new(IpcSpillStore::new()),
        tracker.clone(),
        GraceAggregateConfig::new()
            .with_max_memory(1 << 20)
            .with_max_buckets(16),
    );

    let relax = {
        let tracker = tracker.clone();
        move |pushed: usize| {
            if pushed == 3 {
                tracker.set_usage(32_000);
            }
        }
    };
    let outputs = drive(&mut op, batches, relax)?;

    let counts = collect_int_counts(&outputs);
    assert_eq!(counts.len(), 10_000);
    assert!(counts.values().all(|&count| count == 1));

    assert_eq!(op.num_buckets(), 4);
    assert!(op.metrics().spill_bytes.value() > 0);
    assert_eq!(op.metrics().input_rows.value(), 10_000);
    assert_eq!(op.metrics().output_rows.value(), 10_000);
    Ok(())
}

#[test]
fn skewed_keys_terminate_under_pressure() -> Result<()> {
    // S4: every row carries the same key; the operator must terminate
    // without exhausting buckets once pressure subsides
    let tracker = SharedUsageTracker::new();
    tracker.set_usage(600_000);

    let batches: Vec<RecordBatch> =
        (0..20).map(|_| int_count_batch(vec![7; 1000])).collect();

    let mut op = make_operator(
        int_count_schema(),
        Arc::new(IpcSpillStore::new()),
        tracker.clone(),
        GraceAggregateConfig::new()
            .with_max_memory(1 << 20)
            .with_max_buckets(16),
    );

    let relax = {
        let tracker = tracker.clone();
        move |pushed: usize| {
            if pushed == 3 {
                tracker.set_usage(1000);
            }
        }
    };
    let outputs = drive(&mut op, batches, relax)?;

    let counts = collect_int_counts(&outputs);
    assert_eq!(counts, HashMap::from([(7, 20_000)]));
    assert!(op.num_buckets() <= 16);
    Ok(())
}

#[test]
fn sustained_pressure_exhausts_the_bucket_limit() -> Result<()> {
    // S5: pressure is never relieved and only two buckets are allowed
    let tracker = SharedUsageTracker::new();
    tracker.set_usage(600_000);

    let batches: Vec<RecordBatch> = (0..4)
        .map(|i| int_count_batch((i * 100..(i + 1) * 100).collect()))
        .collect();

    let mut op = make_operator(
        int_count_schema(),
        Arc::new(IpcSpillStore::new()),
        tracker,
        GraceAggregateConfig::new()
            .with_max_memory(1 << 20)
            .with_max_buckets(2),
    );

    let err = drive(&mut op, batches, |_| {}).unwrap_err();
    assert!(matches!(err, GraceError::ResourcesExhausted(_)));
    assert_eq!(op.num_buckets(), 2);
    Ok(())
}

#[test]
fn cancellation_reaches_finished_and_leaks_no_files() -> Result<()> {
    // S6: downstream closes the output mid-stream
    let dir = tempfile::tempdir()?;
    let store = Arc::new(IpcSpillStore::with_base_dir(dir.path()));
    let tracker = SharedUsageTracker::new();
    tracker.set_usage(600_000);

    let mut op = make_operator(
        int_count_schema(),
        store.clone(),
        tracker,
        GraceAggregateConfig::new()
            .with_max_memory(1 << 20)
            .with_max_buckets(16),
    );

    // push a few batches under pressure so spill files exist
    for i in 0..4 {
        assert_eq!(op.prepare()?, OperatorStatus::NeedData);
        op.input_mut()
            .push(TaggedBatch::untagged(int_count_batch(
                (i * 500..(i + 1) * 500).collect(),
            )));
        assert_eq!(op.prepare()?, OperatorStatus::Ready);
        op.work()?;
    }
    assert!(op.metrics().spill_bytes.value() > 0);

    op.output_mut().close();
    assert_eq!(op.prepare()?, OperatorStatus::Finished);
    assert!(!op.input_mut().is_needed());

    // dropping the operator drops every bucket's stream handle
    drop(op);
    assert!(files_under(dir.path())?.is_empty());

    // the store's spill directory itself goes away with the store
    drop(store);
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
    Ok(())
}

#[test]
fn output_matches_a_single_pass_merge_for_any_config() -> Result<()> {
    // overlapping keys across batches so real merging happens
    let batches: Vec<RecordBatch> = (0..6)
        .map(|i| {
            let pairs: Vec<(i64, i64)> =
                (0..400).map(|j| ((i * 37 + j) % 500, j % 5 + 1)).collect();
            int_pairs_batch(&pairs)
        })
        .collect();
    let expected = reference_counts(int_count_schema(), &batches);

    // unbounded, single bucket
    let mut op = make_operator(
        int_count_schema(),
        Arc::new(IpcSpillStore::new()),
        SharedUsageTracker::new(),
        GraceAggregateConfig::new().with_max_buckets(1),
    );
    let outputs = drive(&mut op, batches.clone(), |_| {})?;
    assert_eq!(collect_int_counts(&outputs), expected);

    // unbounded, default bucket limit
    let mut op = make_operator(
        int_count_schema(),
        Arc::new(IpcSpillStore::new()),
        SharedUsageTracker::new(),
        GraceAggregateConfig::new(),
    );
    let outputs = drive(&mut op, batches.clone(), |_| {})?;
    assert_eq!(collect_int_counts(&outputs), expected);

    // pressured enough to spill and repartition
    let tracker = SharedUsageTracker::new();
    tracker.set_usage(600_000);
    let mut op = make_operator(
        int_count_schema(),
        Arc::new(IpcSpillStore::new()),
        tracker.clone(),
        GraceAggregateConfig::new()
            .with_max_memory(1 << 20)
            .with_max_buckets(16),
    );
    let relax = {
        let tracker = tracker.clone();
        move |pushed: usize| {
            if pushed == 3 {
                tracker.set_usage(32_000);
            }
        }
    };
    let outputs = drive(&mut op, batches, relax)?;
    assert_eq!(collect_int_counts(&outputs), expected);
    assert!(op.metrics().spill_bytes.value() > 0);
    Ok(())
}

#[test]
fn bucket_count_is_monotonic_and_buckets_finalize_in_order() -> Result<()> {
    let tracker = SharedUsageTracker::new();
    tracker.set_usage(600_000);

    let batches: Vec<RecordBatch> = (0..8)
        .map(|i| int_count_batch((i * 250..(i + 1) * 250).collect()))
        .collect();

    let mut op = make_operator(
        int_count_schema(),
        Arc::new(IpcSpillStore::new()),
        tracker.clone(),
        GraceAggregateConfig::new()
            .with_max_memory(1 << 20)
            .with_max_buckets(16),
    );

    let mut inputs = batches.into_iter();
    let mut pushed = 0;
    let mut last_buckets = op.num_buckets();
    let mut last_current = op.current_bucket();
    loop {
        let status = op.prepare()?;
        // bucket count only grows, stays a power of two, honors the cap
        let buckets = op.num_buckets();
        assert!(buckets >= last_buckets);
        assert!(buckets.is_power_of_two());
        assert!(buckets <= 16);
        last_buckets = buckets;
        // the bucket cursor never moves backwards
        let current = op.current_bucket();
        assert!(current >= last_current);
        last_current = current;

        match status {
            OperatorStatus::NeedData => match inputs.next() {
                Some(batch) => {
                    op.input_mut().push(TaggedBatch::untagged(batch));
                    pushed += 1;
                    if pushed == 3 {
                        tracker.set_usage(32_000);
                    }
                }
                None => op.input_mut().finish(),
            },
            OperatorStatus::PortFull => {
                op.output_mut().pull();
            }
            OperatorStatus::Ready => op.work()?,
            OperatorStatus::Finished => break,
        }
    }
    // every bucket was finalized exactly once
    assert_eq!(op.current_bucket(), op.num_buckets());
    Ok(())
}

fn files_under(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }
    Ok(files)
}
