//! Common error types for PlotSync.

use thiserror::Error;

/// Top-level error type for PlotSync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The network could not be reached (connection refused, DNS, reset).
    #[error("Network error: {0}")]
    Network(String),

    /// An operation did not complete within its time budget.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The remote backend answered with an error status.
    #[error("Backend error ({status}): {message}")]
    Backend { status: u16, message: String },

    /// The remote backend refused the write (validation or permission).
    #[error("Rejected by backend: {0}")]
    Rejected(String),

    /// Local cache or queue storage failed.
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

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Conflict detected.
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl Error {
    /// Whether the failure may succeed if attempted again later.
    ///
    /// Transport failures, timeouts, server-side errors (5xx), request
    /// timeouts (408) and rate limiting (429) are transient. Everything the
    /// backend rejected on its merits is permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network(_) | Error::Timeout(_) => true,
            Error::Backend { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }

    /// Whether the failure came from the local cache or queue store.
    pub fn is_local_storage(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Io(_))
    }

    /// Build an error from an HTTP status and response body.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            404 => Error::NotFound(message),
            409 => Error::Conflict(message),
            408 | 429 => Error::Backend { status, message },
            400..=499 => Error::Rejected(message),
            _ => Error::Backend { status, message },
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
        assert!(Error::Network("reset".into()).is_transient());
        assert!(Error::Timeout("probe".into()).is_transient());
        assert!(Error::from_status(503, "unavailable").is_transient());
        assert!(Error::from_status(429, "slow down").is_transient());
        assert!(Error::from_status(408, "request timeout").is_transient());
    }

    #[test]
    fn test_permanent_classification() {
        assert!(!Error::from_status(400, "bad payload").is_transient());
        assert!(!Error::from_status(403, "row level security").is_transient());
        assert!(matches!(Error::from_status(403, "rls"), Error::Rejected(_)));
        assert!(matches!(Error::from_status(404, "gone"), Error::NotFound(_)));
        assert!(!Error::Storage("disk full".into()).is_transient());
    }

    #[test]
    fn test_local_storage_classification() {
        assert!(Error::Storage("locked".into()).is_local_storage());
        assert!(!Error::Rejected("nope".into()).is_local_storage());
    }
}
