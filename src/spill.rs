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

//! Temporary spill streams for buckets that do not fit in memory.
//!
//! A [`SpillStream`] is an append-only sequence of record batches backed
//! by temporary storage: write batches, call [`SpillStream::finish_writing`]
//! once, then read them back in order. [`IpcSpillStore`] is the supplied
//! implementation, writing Arrow IPC Stream files into a lazily created
//! temporary directory. Stream format is used because it supports plain
//! sequential access and dictionary replacement; random access is not
//! needed.
//!
//! Each stream owns its file: the file is deleted when the last handle
//! to it is dropped, so cancellation cannot leak spill files.

use std::fmt::{self, Debug};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use log::debug;
use parking_lot::Mutex;
use tempfile::{Builder, NamedTempFile, TempDir};

use crate::error::{GraceError, Result};
use crate::internal_err;

/// Creates spill streams for the operator's buckets.
///
/// A store may be shared by several operators; every stream it hands out
/// is owned exclusively by the caller.
pub trait SpillStore: Debug + Send + Sync {
    fn create_stream(&self, schema: SchemaRef) -> Result<Box<dyn SpillStream>>;
}

/// An append-only batch stream on temporary storage.
///
/// The lifecycle is write* → finish_writing → read*; reading before the
/// stream is finished is an error.
pub trait SpillStream: Debug + Send {
    /// Append a batch to the stream
    fn write(&mut self, batch: &RecordBatch) -> Result<()>;

    /// Seal the stream for reading. Idempotent.
    fn finish_writing(&mut self) -> Result<()>;

    /// Read the next batch, `None` once the stream is exhausted
    fn read(&mut self) -> Result<Option<RecordBatch>>;
}

/// A [`NamedTempFile`] that keeps its parent temporary directory alive
///
/// The file is removed when this handle drops; the directory is removed
/// when the last file in it drops its reference.
#[derive(Debug)]
struct RefCountedTempFile {
    _parent_temp_dir: Arc<TempDir>,
    tempfile: NamedTempFile,
}

impl RefCountedTempFile {
    fn path(&self) -> &Path {
        self.tempfile.path()
    }
}

/// [`SpillStore`] writing Arrow IPC Stream files to a temporary directory.
///
/// The directory is created on the first spill, either under the
/// OS-chosen temp location or under a caller-specified base directory.
#[derive(Debug, Default)]
pub struct IpcSpillStore {
    /// created on first use
    local_dir: Mutex<Option<Arc<TempDir>>>,
    /// explicit location for the spill directory, if any
    base_dir: Option<PathBuf>,
}

impl IpcSpillStore {
    /// Spill into a directory chosen by the OS
    pub fn new() -> Self {
        Self::default()
    }

    /// Spill into a fresh directory created under `base_dir`
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            local_dir: Mutex::new(None),
            base_dir: Some(base_dir.into()),
        }
    }

    fn create_tmp_file(&self) -> Result<RefCountedTempFile> {
        let mut guard = self.local_dir.lock();
        if guard.is_none() {
            let tempdir = match &self.base_dir {
                Some(base) => Builder::new().prefix("grace-agg-").tempdir_in(base),
                None => tempfile::tempdir(),
            }
            .map_err(GraceError::IoError)?;
            debug!("created spill directory {:?}", tempdir.path());
            *guard = Some(Arc::new(tempdir));
        }
        let dir = match guard.as_ref() {
            Some(dir) => Arc::clone(dir),
            None => unreachable!("spill directory was just created"),
        };
        let tempfile = Builder::new()
            .tempfile_in(dir.path())
            .map_err(GraceError::IoError)?;
        Ok(RefCountedTempFile {
            _parent_temp_dir: dir,
            tempfile,
        })
    }
}

impl SpillStore for IpcSpillStore {
    fn create_stream(&self, schema: SchemaRef) -> Result<Box<dyn SpillStream>> {
        let file = self.create_tmp_file()?;
        Ok(Box::new(IpcSpillStream::try_new(file, schema)?))
    }
}

/// One spill file: an IPC stream writer that turns into a sequential
/// reader after [`SpillStream::finish_writing`].
struct IpcSpillStream {
    file: RefCountedTempFile,
    writer: Option<StreamWriter<File>>,
    /// initialized lazily on the first read
    reader: Option<StreamReader<BufReader<File>>>,
    finished: bool,
    num_batches: usize,
    num_rows: usize,
}

impl IpcSpillStream {
    fn try_new(file: RefCountedTempFile, schema: SchemaRef) -> Result<Self> {
        let handle = File::create(file.path())?;
        let writer = StreamWriter::try_new(handle, schema.as_ref())?;
        Ok(Self {
            file,
            writer: Some(writer),
            reader: None,
            finished: false,
            num_batches: 0,
            num_rows: 0,
        })
    }
}

impl Debug for IpcSpillStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpcSpillStream")
            .field("path", &self.file.path())
            .field("finished", &self.finished)
            .field("num_batches", &self.num_batches)
            .field("num_rows", &self.num_rows)
            .finish()
    }
}

impl SpillStream for IpcSpillStream {
    fn write(&mut self, batch: &RecordBatch) -> Result<()> {
        let writer = match self.writer.as_mut() {
            Some(writer) => writer,
            None => {
                return internal_err!(
                    "wrote to spill stream {:?} after finish_writing",
                    self.file.path()
                )
            }
        };
        writer.write(batch)?;
        self.num_batches += 1;
        self.num_rows += batch.num_rows();
        Ok(())
    }

    fn finish_writing(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.finish()?;
            self.finished = true;
            debug!(
                "sealed spill file {:?}: {} batches, {} rows",
                self.file.path(),
                self.num_batches,
                self.num_rows
            );
        }
        Ok(())
    }

    fn read(&mut self) -> Result<Option<RecordBatch>> {
        if !self.finished {
            return internal_err!(
                "read from spill stream {:?} before finish_writing",
                self.file.path()
            );
        }
        if self.reader.is_none() {
            let handle = File::open(self.file.path())?;
            let reader = StreamReader::try_new(BufReader::new(handle), None)?;
            self.reader = Some(reader);
        }
        match self.reader.as_mut() {
            Some(reader) => match reader.next() {
                Some(Ok(batch)) => Ok(Some(batch)),
                Some(Err(e)) => Err(e.into()),
                None => Ok(None),
            },
            None => unreachable!("reader was just initialized"),
        }
    }
}
