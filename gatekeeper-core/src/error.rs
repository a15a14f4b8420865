// SPDX-License-Identifier: MIT
//
// GateKeeper: Remotely-Controlled Firewall Gatekeeper
//
// https://github.com/gatekeeper-fw/gatekeeper

//! Error types for the GateKeeper system
//!
//! Provides a unified error taxonomy using `thiserror`. Failure kinds are
//! internal to the process; the wire never carries typed errors.

pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for GateKeeper operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration validation failed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Framing or parse violation, overflow, illegal port, missing field
    #[error("Malformed input: {0}")]
    Malformed(String),

    /// Bad login digest
    #[error("Authentication failed")]
    Authentication,

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Login watchdog or client reply timeout
    #[error("Operation timed out")]
    Timeout,

    /// Driver returned an error
    #[error("Driver error: {0}")]
    Driver(String),

    /// Argument outside the accepted domain (e.g. port below 10)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Socket I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer closed the connection
    #[error("Connection closed by peer")]
    Closed,

    /// Unexpected fault inside a handler
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check whether this failure counts as a socket error for the
    /// abuse guard (protocol errors, timeouts, transport failures).
    pub fn counts_as_socket_error(&self) -> bool {
        matches!(
            self,
            Error::Malformed(_) | Error::Timeout | Error::Io(_) | Error::Crypto(_)
        )
    }

    /// Check if error indicates authentication failure
    pub fn is_auth_error(&self) -> bool {
        matches!(self, Error::Authentication)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_error_classification() {
        assert!(Error::Malformed("bad frame".into()).counts_as_socket_error());
        assert!(Error::Timeout.counts_as_socket_error());
        assert!(!Error::Authentication.counts_as_socket_error());
        assert!(!Error::Driver("boom".into()).counts_as_socket_error());
    }
}
