//! Error types for drift-core

use thiserror::Error;

/// Result type alias using drift-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in drift-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(reqwest::Error),

    /// Request exceeded its deadline; callers may retry
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// No bearer token available, or the server rejected the session
    #[error("Not authenticated")]
    Unauthenticated,

    /// Non-success response from the sync API
    #[error("Sync API error ({status}): {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Human-readable message from the response body
        message: String,
    },

    /// The requested document or conflict does not exist on the server
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Whether retrying the failed call later could plausibly succeed.
    ///
    /// Timeouts, connection failures, rate limiting, and 5xx responses are
    /// transient; everything else will keep failing identically.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Http(error) => error.is_timeout() || error.is_connect() || error.is_request(),
            Self::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Convert a reqwest error, surfacing timeouts as their own variant so
    /// callers can distinguish "retry later" from a permanent rejection.
    pub(crate) fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout(error.to_string())
        } else {
            Self::Http(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_transient() {
        let error = Error::Api {
            status: 503,
            message: "unavailable".to_string(),
        };
        assert!(error.is_transient());

        let rate_limited = Error::Api {
            status: 429,
            message: "slow down".to_string(),
        };
        assert!(rate_limited.is_transient());
    }

    #[test]
    fn validation_and_auth_errors_are_permanent() {
        let validation = Error::Api {
            status: 422,
            message: "bad payload".to_string(),
        };
        assert!(!validation.is_transient());
        assert!(!Error::Unauthenticated.is_transient());
        assert!(!Error::InvalidInput("x".to_string()).is_transient());
    }

    #[test]
    fn timeouts_are_transient() {
        assert!(Error::Timeout("deadline exceeded".to_string()).is_transient());
    }
}
