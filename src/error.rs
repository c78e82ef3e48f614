//! Error types for the clustered cache.

use crate::types::NodeId;
use std::io;
use thiserror::Error;

/// Result type alias for clustered cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the clustered cache.
#[derive(Error, Debug)]
pub enum Error {
    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The view never reached the configured initial cluster size.
    #[error("cluster formation timed out: expected {expected} members, have {actual}")]
    ClusterFormationTimeout { expected: usize, actual: usize },

    /// No owner of the key acknowledged a write.
    #[error("no owner available for key {key:?}")]
    NoOwnerAvailable { key: String },

    /// The peer could not be reached, or left the view before replying.
    #[error("peer unreachable: {0}")]
    PeerUnreachable(NodeId),

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// The value loader returned an error.
    #[error("value loader failed: {0}")]
    LoaderFailed(String),

    /// The value loader (or the wait for it) exceeded its deadline.
    #[error("value loader timed out")]
    LoaderTimeout,

    /// The peer's inbound queue was full.
    #[error("peer overloaded")]
    Overloaded,

    /// A value or frame could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Entries for newly owned segments could not be pulled in time.
    #[error("state transfer failed: {0}")]
    StateTransferFailed(String),

    /// The cluster refused the join request.
    #[error("join rejected: {0}")]
    Rejected(String),

    /// Error reported by a remote node.
    #[error("remote error: {0}")]
    Remote(String),

    /// The node has been shut down.
    #[error("node is shut down")]
    Shutdown,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Errors that make a read fall through to the next owner.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Error::PeerUnreachable(_) | Error::Network(_) | Error::Remote(_))
    }

    /// Errors that a read treats as a miss.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Timeout | Error::Overloaded)
    }
}

/// Network communication errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Frame exceeds the configured maximum.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Peer speaks a different protocol version.
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: u8 },

    /// The reply did not match the request.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Address parse or resolution error.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Network(NetworkError::Io(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::PeerUnreachable(NodeId::random()).is_unreachable());
        assert!(Error::Network(NetworkError::ConnectionClosed).is_unreachable());
        assert!(Error::Timeout.is_transient());
        assert!(Error::Overloaded.is_transient());
        assert!(!Error::Timeout.is_unreachable());
        assert!(!Error::LoaderTimeout.is_transient());
    }

    #[test]
    fn test_bincode_error_maps_to_serialization() {
        let err: Error = bincode::deserialize::<String>(&[0xff]).unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
