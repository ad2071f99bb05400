//! Client error types.

use thiserror::Error;
use tntdb_protocol::{ProtocolError, UnknownIterator};

/// Client errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("operation timed out")]
    Timeout,

    /// The connection is closed. Carries the terminal cause when the
    /// connection went down with one.
    #[error("connection closed{}", display_cause(.0))]
    Closed(Option<String>),

    #[error("server error: {0}")]
    Server(String),

    #[error("bad argument: {0}")]
    BadArgument(String),

    #[error("name not resolved: {0}")]
    NotResolved(String),
}

fn display_cause(cause: &Option<String>) -> String {
    match cause {
        Some(cause) => format!(" ({cause})"),
        None => String::new(),
    }
}

impl From<UnknownIterator> for Error {
    fn from(err: UnknownIterator) -> Self {
        Error::BadArgument(err.to_string())
    }
}

impl Error {
    /// Returns whether retrying the operation on a fresh connection could
    /// succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Timeout | Error::Closed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_display() {
        assert_eq!(Error::Closed(None).to_string(), "connection closed");
        assert_eq!(
            Error::Closed(Some("read timed out".to_owned())).to_string(),
            "connection closed (read timed out)"
        );
    }

    #[test]
    fn test_unknown_iterator_is_bad_argument() {
        let err: Error = UnknownIterator("!=".to_owned()).into();
        assert!(matches!(err, Error::BadArgument(_)));
    }

    #[test]
    fn test_retryable() {
        assert!(Error::Timeout.is_retryable());
        assert!(Error::Closed(None).is_retryable());
        assert!(!Error::Server("boom".to_owned()).is_retryable());
        assert!(!Error::NotResolved("space".to_owned()).is_retryable());
    }
}
