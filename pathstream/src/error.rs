//! Error types for path streams and the remote path service.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::token::ConsistencyToken;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, StreamError>;

/// Remote operation that produced a service error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    RangeRead,
    Append,
    Flush,
    GetProperties,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::RangeRead => "range read",
            Operation::Append => "append",
            Operation::Flush => "flush",
            Operation::GetProperties => "get properties",
        };
        f.write_str(name)
    }
}

/// Errors reported by a [`RemotePathService`](crate::service::RemotePathService).
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("path not found: {0}")]
    NotFound(String),

    /// A conditional request (`If-Match`, `If-None-Match`) did not hold.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("invalid offset {offset} for {path}: {reason}")]
    InvalidOffset {
        path: String,
        offset: u64,
        reason: String,
    },

    #[error("conflict on {path}: {reason}")]
    Conflict { path: String, reason: String },

    /// The service does not accept this path name.
    #[error("invalid path {path}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<io::Error> for ServiceError {
    fn from(err: io::Error) -> Self {
        ServiceError::Io(err.to_string())
    }
}

/// Caller-facing stream error.
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    /// The token a read stream is pinned to no longer matches the remote path.
    #[error(
        "consistency violation on {path}: pinned to {expected}, service reports {}",
        display_token(.actual)
    )]
    ConsistencyViolation {
        path: String,
        expected: ConsistencyToken,
        actual: Option<ConsistencyToken>,
    },

    #[error("precondition failed on {path}")]
    PreconditionFailed {
        path: String,
        #[source]
        source: ServiceError,
    },

    #[error("invalid range (offset {offset}, count {count:?}): {reason}")]
    InvalidRange {
        offset: u64,
        count: Option<u64>,
        reason: &'static str,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{op} failed on {path}")]
    TransportFailure {
        op: Operation,
        path: String,
        #[source]
        source: ServiceError,
    },

    #[error("transfer to {path} incomplete: {acknowledged} of {expected} bytes acknowledged")]
    IncompleteTransfer {
        path: String,
        expected: u64,
        acknowledged: u64,
    },

    #[error("not a file: {0}")]
    NotAFile(String),

    #[error("stream is closed")]
    Closed,

    #[error("config error: {0}")]
    Config(String),

    #[error("runtime error: {0}")]
    Runtime(String),
}

fn display_token(token: &Option<ConsistencyToken>) -> String {
    match token {
        Some(t) => t.to_string(),
        None => "a different version".to_string(),
    }
}

impl StreamError {
    /// Maps a service failure into the caller-facing kind: precondition
    /// failures keep their identity, rejected path names are invalid
    /// arguments, everything else is a transport failure.
    pub fn from_service(op: Operation, path: &str, source: ServiceError) -> Self {
        match source {
            ServiceError::PreconditionFailed(_) => StreamError::PreconditionFailed {
                path: path.to_string(),
                source,
            },
            ServiceError::InvalidPath { .. } => StreamError::InvalidArgument(source.to_string()),
            source => StreamError::TransportFailure {
                op,
                path: path.to_string(),
                source,
            },
        }
    }

    /// True for errors raised by local validation, before any I/O.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            StreamError::InvalidRange { .. }
                | StreamError::InvalidArgument(_)
                | StreamError::Config(_)
        )
    }
}

impl From<StreamError> for io::Error {
    fn from(err: StreamError) -> Self {
        let kind = match &err {
            StreamError::InvalidRange { .. } | StreamError::InvalidArgument(_) => {
                io::ErrorKind::InvalidInput
            }
            StreamError::NotAFile(_) => io::ErrorKind::InvalidInput,
            StreamError::TransportFailure {
                source: ServiceError::NotFound(_),
                ..
            } => io::ErrorKind::NotFound,
            StreamError::Closed => io::ErrorKind::BrokenPipe,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precondition_keeps_identity() {
        let err = StreamError::from_service(
            Operation::Flush,
            "a/b",
            ServiceError::PreconditionFailed("exists".into()),
        );
        assert!(matches!(err, StreamError::PreconditionFailed { .. }));
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("exists"));
    }

    #[test]
    fn test_other_service_errors_are_transport() {
        let err = StreamError::from_service(
            Operation::Append,
            "a/b",
            ServiceError::Transport("reset".into()),
        );
        assert!(matches!(
            err,
            StreamError::TransportFailure {
                op: Operation::Append,
                ..
            }
        ));
        assert_eq!(err.to_string(), "append failed on a/b");
    }

    #[test]
    fn test_rejected_path_is_validation() {
        let err = StreamError::from_service(
            Operation::Append,
            ".pathstream/x",
            ServiceError::InvalidPath {
                path: ".pathstream/x".into(),
                reason: "reserved".into(),
            },
        );
        assert!(matches!(err, StreamError::InvalidArgument(_)));
        assert!(err.is_validation());
    }

    #[test]
    fn test_violation_message() {
        let err = StreamError::ConsistencyViolation {
            path: "f".into(),
            expected: ConsistencyToken::new("\"0x1\""),
            actual: None,
        };
        assert!(err.to_string().contains("a different version"));
    }

    #[test]
    fn test_io_error_kind() {
        let io_err: io::Error = StreamError::InvalidArgument("block size".into()).into();
        assert_eq!(io_err.kind(), io::ErrorKind::InvalidInput);
    }
}
