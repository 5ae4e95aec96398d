use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure reported by a metrics backend call.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("backend returned HTTP {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("backend error ({error_type}): {message}")]
    Api { error_type: String, message: String },
    #[error("failed to decode backend response: {0}")]
    Decode(String),
    #[error("query timed out after {0:?}")]
    Timeout(Duration),
    #[error("query cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ReplicatorError {
    #[error("failed to get result for query `{query}`: {source}")]
    BackendQuery {
        query: String,
        #[source]
        source: BackendError,
    },
    #[error("unexpected result shape for query `{query}`: expected {expected}, got {actual}")]
    UnexpectedResultShape {
        query: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("query `{query}` returned no samples")]
    EmptyResult { query: String },
    #[error("failed to encode {what}: {message}")]
    Serialization { what: String, message: String },
    #[error("failed to write {}: {source}", path.display())]
    SinkWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("window {window}: {source}")]
    Window {
        window: String,
        #[source]
        source: Box<ReplicatorError>,
    },
}

/// Error family, independent of how much context was wrapped around it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BackendQuery,
    UnexpectedResultShape,
    EmptyResult,
    Serialization,
    SinkWrite,
    Config,
}

impl ReplicatorError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn backend(query: impl Into<String>, source: BackendError) -> Self {
        Self::BackendQuery {
            query: query.into(),
            source,
        }
    }

    pub fn in_window(self, window: impl Into<String>) -> Self {
        Self::Window {
            window: window.into(),
            source: Box::new(self),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BackendQuery { .. } => ErrorKind::BackendQuery,
            Self::UnexpectedResultShape { .. } => ErrorKind::UnexpectedResultShape,
            Self::EmptyResult { .. } => ErrorKind::EmptyResult,
            Self::Serialization { .. } => ErrorKind::Serialization,
            Self::SinkWrite { .. } => ErrorKind::SinkWrite,
            Self::Config(_) => ErrorKind::Config,
            Self::Window { source, .. } => source.kind(),
        }
    }
}

pub type ReplicatorResult<T> = Result<T, ReplicatorError>;
