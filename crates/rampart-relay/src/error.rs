//! Error types for rampart-relay

use thiserror::Error;

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while talking to the relay
#[derive(Debug, Error)]
pub enum Error {
    #[error("network error: {0}")]
    Network(String),

    #[error("relay returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid relay URL: {0}")]
    InvalidUrl(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Error::Serialization(e.to_string())
        } else {
            Error::Network(e.to_string())
        }
    }
}

/// Every relay failure reaches the session manager as a transport error,
/// which it treats as transient.
impl From<Error> for rampart_core::Error {
    fn from(e: Error) -> Self {
        rampart_core::Error::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converts_to_transient_core_error() {
        let err: rampart_core::Error = Error::Status {
            status: 503,
            body: "overloaded".into(),
        }
        .into();
        assert_eq!(
            err,
            rampart_core::Error::Transport("relay returned 503: overloaded".into())
        );
        assert!(err.is_transient());
    }
}
