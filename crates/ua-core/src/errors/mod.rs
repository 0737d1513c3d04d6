//! Error types for ua-core
//!
//! Every public entry point returns [`Result`]. A failed call has mutated
//! nothing and emitted no event; protocol failures (4xx/5xx/6xx) are never
//! errors here, they travel as [`crate::Event`]s.

use thiserror::Error;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the user-agent core
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input to a builder (empty `to`, bad URI, bad status code).
    #[error("Bad argument: {0}")]
    BadArgument(String),

    /// No aggregate or transaction with this id.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i32 },

    /// The call or subscription has no usable dialog.
    #[error("No active dialog")]
    NoDialog,

    /// The request cannot be issued in the current transaction state.
    #[error("Wrong state: {0}")]
    WrongState(String),

    /// No credentials match the challenge.
    #[error("No credentials for user '{username}' in realm '{realm}'")]
    NoCredentials { username: String, realm: String },

    /// A 401/407 carried no usable challenge header.
    #[error("Response carries no authentication challenge")]
    MissingChallenge,

    /// A 3xx carried no Contact we can follow.
    #[error("No usable Contact in redirect response")]
    NoUsableContact,

    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// Socket level failure while sending or listening.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Passed through from the SIP substrate.
    #[error("SIP error: {0}")]
    Sip(#[from] sipua_sip_core::Error),

    /// The user agent has been shut down.
    #[error("User agent stopped")]
    Stopped,
}

impl Error {
    pub(crate) fn not_found(kind: &'static str, id: i32) -> Self {
        Error::NotFound { kind, id }
    }

    pub(crate) fn bad_argument(msg: impl Into<String>) -> Self {
        Error::BadArgument(msg.into())
    }

    pub(crate) fn wrong_state(msg: impl Into<String>) -> Self {
        Error::WrongState(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sip_error_converts() {
        let sip = sipua_sip_core::Error::MissingHeader("Call-ID");
        let err: Error = sip.into();
        assert!(matches!(err, Error::Sip(_)));
        assert!(err.to_string().contains("Call-ID"));
    }

    #[test]
    fn test_not_found_message() {
        assert_eq!(Error::not_found("call", 7).to_string(), "call 7 not found");
    }
}
