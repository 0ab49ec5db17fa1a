use std::io;

use thiserror::Error;

/// Errors raised by connections and sockets.
#[derive(Debug, Error)]
pub enum Error {
    /// The endpoint string could not be parsed into an address.
    #[error("invalid address {0:?}")]
    AddressParse(String),

    /// The passive listener could not be set up.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The local address we tried to bind.
        addr: String,
        /// Transport error.
        source: io::Error,
    },

    /// Session or stream establishment towards a peer failed.
    #[error("failed to dial {addr}: {source}")]
    Dial {
        /// The remote address we tried to reach.
        addr: String,
        /// Transport error.
        source: io::Error,
    },

    /// The listener or the accepted session failed.
    #[error("accept failed: {0}")]
    Accept(io::Error),

    /// Operation on a connection that has been closed.
    #[error("connection is closed")]
    ClosedConnection,

    /// Write on a connection that has no stream yet.
    #[error("connection has no stream attached")]
    NotConnected,

    /// A length-prefixed message was truncated or oversized.
    #[error("framing error: {0}")]
    Framing(String),

    /// The handshake packet could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The stream preamble did not match what the caller expected.
    #[error("handshake error: {0}")]
    Handshake(String),

    /// A connection can own a single stream.
    #[error("connection already has a stream attached")]
    StreamAttached,

    /// The socket has no bootstrap connection.
    #[error("socket is not listening")]
    NotListening,

    /// `listen` was already called successfully on this socket.
    #[error("socket is already listening")]
    AlreadyListening,

    /// An accept loop is already running for this socket.
    #[error("accept loop already armed")]
    AlreadyArmed,

    /// No connection constructor registered for the tag.
    #[error("unknown connection kind {0:?}")]
    UnknownKind(String),

    /// Transport read/write error, passed through unchanged.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<bincode::error::EncodeError> for Error {
    fn from(e: bincode::error::EncodeError) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for Error {
    fn from(e: bincode::error::DecodeError) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
