// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for every stage of the pipeline.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// A time-bucket pattern could not be compiled.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("time pattern is empty")]
    Empty,
    #[error("unsupported pattern letter '{letter}' at offset {offset}")]
    UnsupportedLetter { letter: char, offset: usize },
    #[error("unsupported run of {count} '{letter}' at offset {offset}")]
    UnsupportedWidth {
        letter: char,
        count: usize,
        offset: usize,
    },
    #[error("unterminated quoted literal starting at offset {0}")]
    UnterminatedQuote(usize),
    #[error("time pattern renders the path segment {0:?}, which is empty or relative")]
    InvalidSegment(String),
}

/// Failure of a single write into a rotating file.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("payload of {size} bytes exceeds the rotation limit of {max} bytes")]
    PayloadTooLarge { size: u64, max: u64 },
    #[error("local I/O failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The writer was evicted from its registry; callers should fetch a fresh one.
    #[error("writer has been retired")]
    Retired,
    #[error("writer registry is shutting down")]
    ShuttingDown,
}

impl WriteError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read local file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("object store rejected {key}: {source}")]
    ObjectStore {
        key: String,
        #[source]
        source: object_store::Error,
    },
    #[error("failed to build {kind} store: {source}")]
    Build {
        kind: &'static str,
        #[source]
        source: object_store::Error,
    },
    #[error("{0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{0} is not inside the staging root")]
    OutsideStagingRoot(PathBuf),
    #[error("failed to compress {path}: {source}")]
    Compress {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("compression task for {0} did not complete")]
    CompressTask(PathBuf),
    #[error("upload of {key} failed after {attempts} attempt(s): {source}")]
    Store {
        key: String,
        attempts: u32,
        #[source]
        source: StoreError,
    },
    #[error("failed to scan staging root {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out after {0:?} waiting for in-flight uploads")]
    WaitTimeout(Duration),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatcher is shutting down")]
    ShuttingDown,
    #[error("failed to serialize record for topic {topic}: {source}")]
    Serialize {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write record for topic {topic} to {partition}: {source}")]
    Write {
        topic: String,
        partition: String,
        #[source]
        source: WriteError,
    },
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open input {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read input: {0}")]
    Read(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid time pattern: {0}")]
    Pattern(#[from] PatternError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self::Load(Box::new(e))
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error("failed to prepare staging root {path}: {source}")]
    StagingRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
