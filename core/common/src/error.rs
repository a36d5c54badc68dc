//! Common error types for Tideline.

use thiserror::Error;

/// Top-level error type for Tideline operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Network failure that may succeed on retry.
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// A remote call did not complete within its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The bearer credential was rejected (usually expired).
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// The server rejected a write for good (schema, permission).
    #[error("Rejected by server: {0}")]
    PermanentRejection(String),

    /// Conflict detected.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Persisted state for a single document could not be decoded.
    #[error("Storage corruption for {key}: {reason}")]
    StorageCorruption { key: String, reason: String },

    /// The change log refused to grow any further.
    #[error("Change log capacity exceeded ({0} entries)")]
    CapacityExceeded(usize),

    /// Local storage backend failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation was cancelled before completing.
    #[error("Cancelled")]
    Cancelled,
}

impl Error {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::TransientNetwork(_) | Error::Timeout(_) | Error::Io(_)
        )
    }

    /// Build a corruption error for one document key.
    pub fn corruption(key: impl ToString, reason: impl ToString) -> Self {
        Error::StorageCorruption {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::TransientNetwork("reset".into()).is_transient());
        assert!(Error::Timeout("push".into()).is_transient());
        assert!(!Error::PermanentRejection("schema".into()).is_transient());
        assert!(!Error::Unauthenticated("expired".into()).is_transient());
        assert!(!Error::CapacityExceeded(10).is_transient());
    }

    #[test]
    fn test_corruption_display() {
        let err = Error::corruption("plant/1", "bad json");
        assert_eq!(err.to_string(), "Storage corruption for plant/1: bad json");
    }
}
