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

//! Single-slot input and output ports connecting the operator to the
//! pipeline scheduler.
//!
//! The scheduler alternates [`prepare`] and [`work`] on the operator.
//! `prepare` is cheap and non-blocking: it moves batches across the
//! ports and reports what the operator needs next. `work` does the
//! actual merging and may perform spill I/O.
//!
//! [`prepare`]: crate::operator::GraceMergingAggregate::prepare
//! [`work`]: crate::operator::GraceMergingAggregate::work

use crate::batch::TaggedBatch;
use crate::error::{GraceError, Result};
use crate::internal_err;
use arrow::record_batch::RecordBatch;

/// What the operator needs from the scheduler after a `prepare` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorStatus {
    /// Upstream must push a batch (or finish) before progress is possible
    NeedData,
    /// Downstream must drain the output port before progress is possible
    PortFull,
    /// A `work` call will make progress
    Ready,
    /// The operator is done; neither port will move again
    Finished,
}

/// Upstream-facing port holding at most one batch (or one pending error)
#[derive(Debug, Default)]
pub struct InputPort {
    slot: Option<Result<TaggedBatch>>,
    finished: bool,
    closed: bool,
    needed: bool,
}

impl InputPort {
    /// True if the operator is waiting for data and the slot is free
    pub fn is_needed(&self) -> bool {
        self.needed && !self.closed && self.slot.is_none()
    }

    /// Push the next batch. The caller must only push into a free slot.
    pub fn push(&mut self, batch: TaggedBatch) {
        debug_assert!(self.slot.is_none(), "input port already holds a batch");
        self.slot = Some(Ok(batch));
    }

    /// Propagate an upstream error through the port
    pub fn push_err(&mut self, err: GraceError) {
        debug_assert!(self.slot.is_none(), "input port already holds a batch");
        self.slot = Some(Err(err));
    }

    /// Signal that upstream will produce no more batches
    pub fn finish(&mut self) {
        self.finished = true;
    }

    pub(crate) fn set_needed(&mut self) {
        self.needed = true;
    }

    pub(crate) fn has_data(&self) -> bool {
        self.slot.is_some()
    }

    /// Upstream finished (or the port was closed) and nothing is pending
    pub(crate) fn is_finished(&self) -> bool {
        (self.finished || self.closed) && self.slot.is_none()
    }

    pub(crate) fn pull(&mut self) -> Result<TaggedBatch> {
        match self.slot.take() {
            Some(result) => result,
            None => internal_err!("pulled from an empty input port"),
        }
    }

    /// Stop accepting input; any pending batch is dropped
    pub(crate) fn close(&mut self) {
        self.closed = true;
        self.needed = false;
        self.slot = None;
    }
}

/// Downstream-facing port holding at most one finalized batch
#[derive(Debug, Default)]
pub struct OutputPort {
    slot: Option<RecordBatch>,
    finished: bool,
    closed: bool,
}

impl OutputPort {
    pub(crate) fn can_push(&self) -> bool {
        !self.closed && self.slot.is_none()
    }

    pub(crate) fn push(&mut self, batch: RecordBatch) {
        debug_assert!(self.can_push(), "output port is not ready for a push");
        self.slot = Some(batch);
    }

    /// Mark the output as complete; no more batches will be pushed
    pub(crate) fn finish(&mut self) {
        self.finished = true;
    }

    /// True once downstream has cancelled consumption
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Downstream signals it will not consume any more output
    pub fn close(&mut self) {
        self.closed = true;
        self.slot = None;
    }

    /// Take the pending output batch, if any
    pub fn pull(&mut self) -> Option<RecordBatch> {
        self.slot.take()
    }

    /// The operator finished and every pushed batch has been pulled
    pub fn is_finished(&self) -> bool {
        self.finished && self.slot.is_none()
    }
}
