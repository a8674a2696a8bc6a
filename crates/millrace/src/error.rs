//! Error types for the engine.
//!
//! Provides granular error classification so workers can decide what to do
//! at the cycle boundary:
//! - Retriable errors (connection, timeout, pool exhausted) are logged and
//!   retried on the next cycle.
//! - Non-retriable errors (configuration, invalid arguments) are fatal at
//!   startup or surface through projection metadata.

use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Engine errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (missing DSN, non-positive interval).
    #[error("configuration error: {0}")]
    Config(String),

    /// An operation was called with an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Connection establishment or authentication failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// Query or statement execution failure.
    #[error("query error: {0}")]
    Query(String),

    /// Transaction control failure (begin/commit/rollback).
    #[error("transaction error: {0}")]
    Transaction(String),

    /// Embedded analytical engine failure.
    #[error("analytics engine error: {0}")]
    Engine(#[from] duckdb::Error),

    /// Connection pool exhausted or shut down.
    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    /// Timed out waiting on an external call.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A spawned background task failed or panicked.
    #[error("background task failed: {0}")]
    Task(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid-argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a query error.
    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    /// Create a transaction error.
    pub fn transaction(msg: impl Into<String>) -> Self {
        Self::Transaction(msg.into())
    }

    /// Create a timeout error.
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Whether a retry on the next worker cycle may succeed.
    ///
    /// Transient connectivity failures are retriable; configuration and
    /// argument errors are not, and neither are query errors, which would
    /// fail identically when replayed.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Connection(_) | Self::PoolExhausted(_) | Self::Timeout(_) => true,
            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }
            Self::Config(_)
            | Self::InvalidArgument(_)
            | Self::Query(_)
            | Self::Transaction(_)
            | Self::Engine(_)
            | Self::Task(_) => false,
        }
    }
}

impl From<tiberius::error::Error> for Error {
    fn from(err: tiberius::error::Error) -> Self {
        match &err {
            tiberius::error::Error::Io { .. }
            | tiberius::error::Error::Tls(_)
            | tiberius::error::Error::Routing { .. } => Self::Connection(err.to_string()),
            _ => Self::Query(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::config("SOURCE_DSN is required");
        assert!(err.to_string().contains("configuration error"));
        assert!(err.to_string().contains("SOURCE_DSN"));
    }

    #[test]
    fn test_retriable_classification() {
        assert!(Error::connection("refused").is_retriable());
        assert!(Error::timeout("5s").is_retriable());
        assert!(Error::PoolExhausted("closed".into()).is_retriable());

        assert!(!Error::config("bad").is_retriable());
        assert!(!Error::invalid_argument("empty captures").is_retriable());
        assert!(!Error::query("syntax").is_retriable());
        assert!(!Error::transaction("already committed").is_retriable());
    }

    #[test]
    fn test_io_retriable_by_kind() {
        let reset = Error::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(reset.is_retriable());
        let missing = Error::Io(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(!missing.is_retriable());
    }
}
