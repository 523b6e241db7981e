//! Structural errors.
//!
//! Per-candidate problems (missing fields, unresolvable evidence, low confidence) are
//! *values* routed to the review queue and never show up here. A `KbError` means an
//! input file could not be read or decoded at all, and aborts the run before any write.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KbError {
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed JSONL record in {} (line {line}): {source}", path.display())]
    JsonLine {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("record in {} (line {line}) is not a JSON object", path.display())]
    NotAnObject { path: PathBuf, line: usize },

    #[error("invalid record ({context}): {message}")]
    InvalidRecord { context: String, message: String },

    #[error("malformed CSV in {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl KbError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        KbError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type KbResult<T> = Result<T, KbError>;
