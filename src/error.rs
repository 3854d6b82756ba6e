//! Error types for the distributed LSH engine.
//!
//! Every failure in the crate is reported through one flat error value that
//! carries its kind, the rank it originated on (when known) and a message.
//! Aggregated kernel failures additionally keep each individual message.

use std::fmt;
use thiserror::Error;

use crate::comm::CommCode;
use crate::types::Rank;

/// Classification of an [`LshError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A collective or point-to-point operation failed, timed out or was aborted.
    CommunicationFailure,
    /// A remotely accessible resource was invalid or could not be queried.
    RemoteResourceFailure,
    /// One or more asynchronously submitted kernels failed.
    ComputeFailure,
    /// The requested family or configuration is not supported.
    NotImplemented,
    /// The caller violated the protocol (e.g. queried before build).
    UsageError,
    /// A configuration value or argument failed a sanity check.
    InvalidArgument,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::CommunicationFailure => write!(f, "COMMUNICATION_FAILURE"),
            ErrorKind::RemoteResourceFailure => write!(f, "REMOTE_RESOURCE_FAILURE"),
            ErrorKind::ComputeFailure => write!(f, "COMPUTE_FAILURE"),
            ErrorKind::NotImplemented => write!(f, "NOT_IMPLEMENTED"),
            ErrorKind::UsageError => write!(f, "USAGE_ERROR"),
            ErrorKind::InvalidArgument => write!(f, "INVALID_ARGUMENT"),
        }
    }
}

/// Main error type for distributed LSH operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub struct LshError {
    kind: ErrorKind,
    rank: Option<Rank>,
    message: String,
    failures: Vec<String>,
}

impl LshError {
    /// Create a new error with the given kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            rank: None,
            message: message.into(),
            failures: Vec::new(),
        }
    }

    /// Attach the originating rank.
    pub fn with_rank(mut self, rank: Rank) -> Self {
        self.rank = Some(rank);
        self
    }

    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Rank the error originated on, if known.
    pub fn rank(&self) -> Option<Rank> {
        self.rank
    }

    /// Get the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Individual failure messages of an aggregated compute failure.
    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    // Convenience constructors

    /// Create a communication failure from a communicator error code.
    ///
    /// The message is the code's error string followed by the context.
    pub fn communication(rank: Rank, code: CommCode, context: impl AsRef<str>) -> Self {
        let context = context.as_ref();
        let message = if context.is_empty() {
            code.error_string().to_string()
        } else {
            format!("{}: {}", context, code.error_string())
        };
        Self::new(ErrorKind::CommunicationFailure, message).with_rank(rank)
    }

    /// Create a remote resource failure.
    pub fn remote_resource(rank: Rank, msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::RemoteResourceFailure, msg).with_rank(rank)
    }

    /// Aggregate kernel failure messages into a single compute failure.
    pub fn compute(rank: Rank, failures: Vec<String>) -> Self {
        let message = match failures.len() {
            1 => format!("kernel failed: {}", failures[0]),
            n => format!("{} kernels failed", n),
        };
        Self {
            kind: ErrorKind::ComputeFailure,
            rank: Some(rank),
            message,
            failures,
        }
    }

    /// Create a not-implemented error.
    pub fn not_implemented(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotImplemented, msg)
    }

    /// Create a usage error.
    pub fn usage(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::UsageError, msg)
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, msg)
    }
}

impl fmt::Display for LshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rank {
            Some(rank) => write!(f, "{} on rank {}: {}", self.kind, rank, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

/// Result type alias for distributed LSH operations.
pub type Result<T> = std::result::Result<T, LshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = LshError::invalid_argument("w must be positive");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(err.message(), "w must be positive");
        assert_eq!(err.rank(), None);
    }

    #[test]
    fn test_error_display() {
        let err = LshError::usage("query before build").with_rank(3);
        let display = format!("{}", err);
        assert!(display.contains("USAGE_ERROR"));
        assert!(display.contains("rank 3"));
        assert!(display.contains("query before build"));
    }

    #[test]
    fn test_communication_uses_error_string() {
        let err = LshError::communication(1, CommCode::Timeout, "barrier");
        assert!(err.is(ErrorKind::CommunicationFailure));
        assert_eq!(err.rank(), Some(1));
        assert!(err.message().starts_with("barrier: "));
        assert!(err.message().contains(CommCode::Timeout.error_string()));
    }

    #[test]
    fn test_compute_aggregates() {
        let err = LshError::compute(0, vec!["a".into(), "b".into()]);
        assert_eq!(err.kind(), ErrorKind::ComputeFailure);
        assert_eq!(err.failures().len(), 2);
        assert!(err.message().contains("2 kernels"));

        let single = LshError::compute(0, vec!["oops".into()]);
        assert!(single.message().contains("oops"));
    }
}
