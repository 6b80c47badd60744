//! Error taxonomy for the loader
//!
//! | Error | Scope of the abort |
//! |---|---|
//! | [`ExtractionError`] | the malformed record (the producer in strict mode) |
//! | [`SchemaMismatchError`] | the offending stream |
//! | [`StageError`] | the offending stream's load job |
//! | [`LoadError`] | the offending load job |
//! | [`QueueError`] | the job being enqueued |
//! | [`ConfigError`] | the run, before anything is staged |

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// A source record that could not be turned into a [`crate::Record`]
#[derive(Debug, Clone, Error)]
#[error("malformed record in {subtype}/{stream}: {message}")]
pub struct ExtractionError {
    pub subtype: String,
    pub stream: String,
    /// 1-based line in the source file, when known
    pub line: Option<u64>,
    pub message: String,
}

impl ExtractionError {
    pub fn new(
        subtype: impl Into<String>,
        stream: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            subtype: subtype.into(),
            stream: stream.into(),
            line: None,
            message: message.into(),
        }
    }

    pub fn at_line(mut self, line: u64) -> Self {
        self.line = Some(line);
        self
    }
}

/// A stream whose records do not agree on one schema
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchemaMismatchError {
    #[error("record {row} of stream '{template}' has keys {found:?}, expected {expected:?}")]
    KeyMismatch {
        template: String,
        row: usize,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("stream '{template}' lacks columns {missing:?} bound by its mutation")]
    MissingColumns {
        template: String,
        missing: Vec<String>,
    },

    #[error("batch carries {streams} streams for {templates} templates")]
    StreamCount { streams: usize, templates: usize },
}

/// Failure to turn a stream into a staged file
#[derive(Debug, Error)]
pub enum StageError {
    #[error("failed to write staged file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize staged file {}: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error(transparent)]
    Schema(#[from] SchemaMismatchError),
}

/// Failure reported by a [`crate::GraphStore`]
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to connect to {uri}: {message}")]
    Connect { uri: String, message: String },

    #[error("chunk is missing column '{0}' bound by the mutation")]
    MissingColumn(String),

    #[error("store rejected chunk: {0}")]
    Rejected(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Why a load job stopped short of committing its whole file
#[derive(Debug, Error)]
pub enum LoadFailure {
    #[error("could not read staged file: {0}")]
    Read(#[from] csv::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("job exceeded its {0:?} timeout")]
    Timeout(Duration),

    #[error("worker task aborted: {0}")]
    Aborted(String),
}

/// A load job that reached the `Failed` state
#[derive(Debug, Error)]
#[error(
    "load job #{sequence_no} ({template}) failed at chunk {chunk_index} of {}: {kind}",
    .path.display()
)]
pub struct LoadError {
    pub template: String,
    pub path: PathBuf,
    pub sequence_no: u64,
    /// 0-based index of the chunk that was being committed
    pub chunk_index: usize,
    #[source]
    pub kind: LoadFailure,
}

/// Enqueue/dequeue failures on the dispatch queue
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("enqueue blocked for more than {0:?}")]
    CapacityTimeout(Duration),

    #[error("dispatch queue is closed")]
    Closed,

    #[error("run was cancelled")]
    Cancelled,
}

/// Invalid loader settings
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Env(#[from] bdp_common::BdpError),

    #[error("{0} must be greater than 0")]
    NotPositive(&'static str),

    #[error("{0} is too large")]
    TooLarge(&'static str),

    #[error("cannot prepare staging directory {}: {source}", .path.display())]
    StagingDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Invalid or unreadable template descriptors
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("invalid identifier '{0}': expected [A-Za-z_][A-Za-z0-9_]*")]
    InvalidIdentifier(String),

    #[error("template '{0}' must have commit_size > 0")]
    ZeroCommitSize(String),

    #[error("template '{id}' file pattern '{pattern}' must contain {{subtype}}, {{template}} and {{sequence}}")]
    FilePattern { id: String, pattern: String },

    #[error("template '{id}' statement uses ${placeholder} but binds {params} parameters")]
    StatementArity {
        id: String,
        placeholder: usize,
        params: usize,
    },

    #[error("duplicate template id '{0}'")]
    Duplicate(String),

    #[error("failed to read template manifest {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse template manifest {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
