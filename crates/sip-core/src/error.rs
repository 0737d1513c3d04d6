use thiserror::Error;

use crate::transaction::TransactionId;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the SIP substrate
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The bytes on the wire could not be framed as a SIP message.
    #[error("Parse error: {0}")]
    Parse(String),

    /// A header required by the operation is absent.
    #[error("Missing header: {0}")]
    MissingHeader(&'static str),

    /// A header is present but its value cannot be interpreted.
    #[error("Invalid {name} header: {value}")]
    InvalidHeader {
        name: &'static str,
        value: String,
    },

    /// Invalid URI syntax.
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    /// No transaction is known under this id.
    #[error("Transaction not found: {0}")]
    TransactionNotFound(TransactionId),

    /// The operation is not legal in the transaction's current state.
    #[error("Invalid state for {tid}: {reason}")]
    InvalidState {
        tid: TransactionId,
        reason: String,
    },

    /// Other miscellaneous errors.
    #[error("Other error: {0}")]
    Other(String),
}

impl Error {
    /// Shorthand for an [`Error::InvalidHeader`].
    pub fn invalid_header(name: &'static str, value: impl Into<String>) -> Self {
        Error::InvalidHeader {
            name,
            value: value.into(),
        }
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}
