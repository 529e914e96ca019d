//! Redo log error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during redo log operations.
#[derive(Debug, Error)]
pub enum RedoError {
    #[error("redo log writer is stopped")]
    Stopped,

    #[error("operation cancelled")]
    Cancelled,

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to {op} '{}': {source}", path.display())]
    FileOperation {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid read window: start ts {start_ts} must be below end ts {end_ts}")]
    InvalidWindow { start_ts: u64, end_ts: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("record corrupted at offset {offset}: CRC mismatch (expected {expected:#x}, got {actual:#x})")]
    CorruptedRecord {
        offset: u64,
        expected: u32,
        actual: u32,
    },

    #[error("invalid record header at offset {offset}: {reason}")]
    InvalidHeader { offset: u64, reason: String },

    #[error("truncated record at offset {offset}: {available} of {needed} bytes present")]
    TruncatedRecord {
        offset: u64,
        available: usize,
        needed: usize,
    },

    #[error("record too large: {size} bytes (max {max})")]
    RecordTooLarge { size: usize, max: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("external storage error: {0}")]
    Storage(String),

    #[error("{} errors: {}", .0.len(), join_errors(.0))]
    Multiple(Vec<RedoError>),
}

fn join_errors(errors: &[RedoError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl RedoError {
    /// Wraps an I/O error with the operation and path that produced it.
    pub fn file_op(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RedoError::FileOperation {
            op,
            path: path.into(),
            source,
        }
    }

    /// Returns whether this error is retryable by the caller.
    pub fn is_retryable(&self) -> bool {
        match self {
            RedoError::FileOperation { .. } | RedoError::Storage(_) => true,
            RedoError::Multiple(errors) => errors.iter().all(|e| e.is_retryable()),
            _ => false,
        }
    }

    /// Returns whether this error means persisted data could not be decoded.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            RedoError::CorruptedRecord { .. }
                | RedoError::InvalidHeader { .. }
                | RedoError::TruncatedRecord { .. }
                | RedoError::RecordTooLarge { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RedoError::NotFound(_))
    }

    /// Folds a list of errors into a single result.
    pub fn collect(mut errors: Vec<RedoError>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(RedoError::Multiple(errors)),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RedoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_errors() {
        assert!(RedoError::collect(Vec::new()).is_ok());

        let single = RedoError::collect(vec![RedoError::Stopped]).unwrap_err();
        assert!(matches!(single, RedoError::Stopped));

        let many = RedoError::collect(vec![RedoError::Stopped, RedoError::Cancelled]).unwrap_err();
        match many {
            RedoError::Multiple(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_error_classification() {
        let io = RedoError::file_op(
            "rename",
            "/tmp/x",
            std::io::Error::new(std::io::ErrorKind::Other, "boom"),
        );
        assert!(io.is_retryable());
        assert!(io.to_string().contains("rename"));

        let truncated = RedoError::TruncatedRecord {
            offset: 10,
            available: 3,
            needed: 24,
        };
        assert!(truncated.is_corruption());
        assert!(!truncated.is_retryable());

        assert!(RedoError::NotFound("meta".into()).is_not_found());
        assert!(!RedoError::Stopped.is_retryable());
    }
}
