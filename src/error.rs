//! Error types for Portway

use std::time::Duration;

use thiserror::Error;

/// Main error type for Portway
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bad handshake: {0}")]
    BadHandshake(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Unsupported command 0x{0:02x}")]
    UnsupportedCommand(u8),

    #[error("Dial failed: {0}")]
    DialFailed(#[from] DialError),

    #[error("Upstream closed")]
    UpstreamClosed,

    #[error("Client closed")]
    ClientClosed,

    #[error("Idle timeout")]
    IdleTimeout,

    #[error("Handshake timeout")]
    HandshakeTimeout,

    #[error("Shutting down")]
    Shutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Endings a session reaches in normal operation; logged at debug
    /// level, everything else at warn.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            Error::UpstreamClosed | Error::ClientClosed | Error::IdleTimeout | Error::Shutdown
        )
    }
}

/// Reasons an upstream dial can fail
#[derive(Error, Debug)]
pub enum DialError {
    #[error("DNS lookup failed for {0}")]
    Dns(String),

    #[error("connection refused by {0}")]
    Refused(String),

    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0} unreachable")]
    Unreachable(String),
}

/// Result type alias for Portway
pub type Result<T> = std::result::Result<T, Error>;
