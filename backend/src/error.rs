//! # error
//!
//! The error vocabulary shared by every client and state machine in the
//! backend. The sensor state machine treats `Backend`, `TimedOut`,
//! `Communication` and `Algorithmic` identically (log, back to Query, let
//! the pacing interval tick); `InvalidArgument` and `NotSet` are programmer
//! or configuration mistakes and are always surfaced.

use std::time::Duration;

use thiserror::Error;

use seis_types::WireError;

#[derive(Debug, Error)]
pub enum Error {
    /// A call's input violates a documented precondition.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A required attribute was read before being set.
    #[error("required attribute not set: {0}")]
    NotSet(&'static str),

    /// A service replied with a non-success return code.
    #[error("backend error code {code}: {context}")]
    Backend { code: i32, context: String },

    /// An RPC did not reply within its bounded wait.
    #[error("request timed out after {0:?}")]
    TimedOut(Duration),

    /// Transport-level failure: disconnect, malformed frame, or a generic
    /// failure reply from the service.
    #[error("communication error: {0}")]
    Communication(String),

    /// A service reported an internal algorithmic failure.
    #[error("algorithmic failure: {0}")]
    Algorithmic(String),
}

impl From<WireError> for Error {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Invalid(message) => Error::InvalidArgument(message),
            other => Error::Communication(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_validation_maps_to_invalid_argument() {
        let e: Error = WireError::Invalid("no arrivals".to_string()).into();
        assert!(matches!(e, Error::InvalidArgument(_)));
    }

    #[test]
    fn wire_transport_maps_to_communication() {
        let e: Error = WireError::Malformed("truncated header".to_string()).into();
        assert!(matches!(e, Error::Communication(_)));
    }
}
