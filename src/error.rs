//! Error types for mail-triage.

use std::fmt;
use std::io;

/// Main error type for triage operations.
#[derive(Debug)]
pub enum Error {
    /// I/O errors (network listeners, file operations)
    Io(io::Error),
    /// `SQLite` database errors
    Database(String),
    /// Mail provider errors
    Provider(ProviderError),
    /// Rejected caller input (bad dates, bad caps, unknown tabs)
    InvalidInput(String),
    /// Referenced ticket, message or entry does not exist
    NotFound(String),
    /// Another sync already holds the mailbox
    SyncInProgress(String),
    /// A raw provider thread could not be mapped to a ticket
    Malformed(String),
    /// Configuration errors
    Config(String),
}

/// Mail provider failures, classified for retry decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Provider asked us to slow down (HTTP 429)
    RateLimited,
    /// Network failure or provider-side 5xx
    Transient(String),
    /// The stored history id is too old to compute a delta from
    HistoryExpired,
    /// Thread, message or attachment no longer exists
    NotFound(String),
    /// Credentials rejected or token refresh failed
    Auth(String),
    /// Any other non-success response
    Api { status: u16, body: String },
    /// Response body did not match the expected schema
    Decode(String),
}

impl ProviderError {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Transient(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Database(msg) => write!(f, "database error: {msg}"),
            Self::Provider(e) => write!(f, "mail provider error: {e}"),
            Self::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Self::NotFound(what) => write!(f, "{what} not found"),
            Self::SyncInProgress(mailbox) => {
                write!(f, "a sync is already running for mailbox {mailbox}")
            }
            Self::Malformed(msg) => write!(f, "malformed thread: {msg}"),
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited => write!(f, "rate limited"),
            Self::Transient(msg) => write!(f, "transient failure: {msg}"),
            Self::HistoryExpired => write!(f, "history id expired"),
            Self::NotFound(what) => write!(f, "{what} not found"),
            Self::Auth(msg) => write!(f, "authorization failed: {msg}"),
            Self::Api { status, body } => write!(f, "status {status}: {body}"),
            Self::Decode(msg) => write!(f, "unexpected response: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Provider(e) => Some(e),
            _ => None,
        }
    }
}

impl std::error::Error for ProviderError {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ProviderError> for Error {
    fn from(e: ProviderError) -> Self {
        Self::Provider(e)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(io_err) => io_err,
            other => Self::other(other.to_string()),
        }
    }
}

/// Result type alias for mail-triage operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rate_limits_and_transient_failures_retry() {
        assert!(ProviderError::RateLimited.is_transient());
        assert!(ProviderError::Transient("reset".into()).is_transient());
        assert!(!ProviderError::HistoryExpired.is_transient());
        assert!(!ProviderError::NotFound("thread t1".into()).is_transient());
        assert!(!ProviderError::Api {
            status: 400,
            body: "bad".into()
        }
        .is_transient());
    }

    #[test]
    fn converts_into_io_error_for_main() {
        let err: io::Error = Error::Config("missing mailbox".into()).into();
        assert_eq!(err.kind(), io::ErrorKind::Other);
        assert!(err.to_string().contains("missing mailbox"));
    }
}
