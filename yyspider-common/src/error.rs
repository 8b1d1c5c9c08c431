//! Common error types for yyspider

use thiserror::Error;

use crate::auth::HandshakeError;

/// Common result type for yyspider operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the server and the workers
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Declared frame length exceeds the configured maximum
    #[error("Frame too large: declared {len} bytes, limit {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// Payload could not be encoded as MessagePack
    #[error("Encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Payload could not be decoded as a known message
    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Request data did not match the schema of its action
    #[error("Invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// Handshake rejected or malformed
    #[error("Authentication failed: {0}")]
    Auth(#[from] HandshakeError),

    /// Outgoing message rejected locally before any byte was written
    #[error("Message not sendable: {0}")]
    Unsendable(String),

    /// Peer sent something the protocol does not allow in this state
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Peer closed the connection
    #[error("Connection closed")]
    ConnectionClosed,

    /// Operation did not complete in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Backing store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for failures that end the current connection but may succeed after a reconnect
    ///
    /// `FrameTooLarge` here is an inbound frame; an outgoing one is reported
    /// as [`Error::Unsendable`] and leaves the connection usable.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::FrameTooLarge { .. }
                | Error::Decode(_)
                | Error::Protocol(_)
                | Error::ConnectionClosed
                | Error::Timeout(_)
                | Error::Auth(_)
        )
    }
}
