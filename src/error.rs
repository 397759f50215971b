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

//! [`GraceError`] and the [`Result`] alias used throughout the crate.

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io;
use std::result;

use arrow::error::ArrowError;

/// Result type for operations that could result in a [`GraceError`]
pub type Result<T, E = GraceError> = result::Result<T, E>;

/// Errors surfaced by the grace merging aggregator.
#[derive(Debug)]
pub enum GraceError {
    /// Error returned by arrow
    ArrowError(ArrowError),
    /// Error when an I/O operation fails, e.g. while writing or reading a
    /// spill file
    IoError(io::Error),
    /// Error during execution due to malformed input
    Execution(String),
    /// Error for invalid or unsupported configuration options
    Configuration(String),
    /// Detected violation of an internal invariant, suggesting a bug
    Internal(String),
    /// The operator cannot acquire the resources needed to make progress,
    /// e.g. the bucket count would exceed its configured bound
    ResourcesExhausted(String),
}

impl Display for GraceError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            GraceError::ArrowError(desc) => write!(f, "Arrow error: {desc}"),
            GraceError::IoError(desc) => write!(f, "IO error: {desc}"),
            GraceError::Execution(desc) => write!(f, "Execution error: {desc}"),
            GraceError::Configuration(desc) => {
                write!(f, "Invalid or Unsupported Configuration: {desc}")
            }
            GraceError::Internal(desc) => {
                write!(
                    f,
                    "Internal error: {desc}.\nThis was likely caused by a bug, \
                     please report it"
                )
            }
            GraceError::ResourcesExhausted(desc) => {
                write!(f, "Resources exhausted: {desc}")
            }
        }
    }
}

impl Error for GraceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            GraceError::ArrowError(e) => Some(e),
            GraceError::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ArrowError> for GraceError {
    fn from(e: ArrowError) -> Self {
        GraceError::ArrowError(e)
    }
}

impl From<io::Error> for GraceError {
    fn from(e: io::Error) -> Self {
        GraceError::IoError(e)
    }
}

/// Returns `Err(GraceError::Internal(..))` from the formatted message
#[macro_export]
macro_rules! internal_err {
    ($($args:expr),* $(,)?) => {
        Err($crate::error::GraceError::Internal(format!($($args),*)))
    };
}

/// Returns `Err(GraceError::Execution(..))` from the formatted message
#[macro_export]
macro_rules! exec_err {
    ($($args:expr),* $(,)?) => {
        Err($crate::error::GraceError::Execution(format!($($args),*)))
    };
}

/// Returns `Err(GraceError::Configuration(..))` from the formatted message
#[macro_export]
macro_rules! config_err {
    ($($args:expr),* $(,)?) => {
        Err($crate::error::GraceError::Configuration(format!($($args),*)))
    };
}

/// Returns `Err(GraceError::ResourcesExhausted(..))` from the formatted message
#[macro_export]
macro_rules! resources_err {
    ($($args:expr),* $(,)?) => {
        Err($crate::error::GraceError::ResourcesExhausted(format!($($args),*)))
    };
}
