//! Error types for peerwire.

use thiserror::Error;

use crate::protocol::FrameId;

/// Main error type for all peerwire operations.
#[derive(Debug, Error)]
pub enum PeerwireError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error (configuration loading).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Body could not be encoded or decoded by the tagged codec.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Protocol error (undecodable frame, oversized body, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The name exchange failed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The name exchange did not finish in time.
    #[error("Handshake timed out")]
    HandshakeTimeout,

    /// No peer is registered under the given name.
    #[error("Not connected to peer {0:?}")]
    NotConnected(String),

    /// The connection has no live socket attached.
    #[error("Socket is not connected")]
    NoSocket,

    /// A receptive send did not get a reply before its deadline.
    #[error("Request timed out")]
    Timeout,

    /// The connection was torn down while the request was pending.
    #[error("Socket has been disconnected")]
    Disconnected,

    /// The writer task is gone.
    #[error("Connection closed")]
    ConnectionClosed,

    /// `listen` was called on a node that is already listening.
    #[error("Node is already listening")]
    AlreadyListening,

    /// A target string is not `host:port`, `:port` or a bare port.
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// A broadcast filter pattern did not compile.
    #[error("Invalid broadcast filter: {0}")]
    InvalidFilter(#[from] regex::Error),

    /// A request with this frame id is already pending.
    #[error("Request {0} is already pending")]
    DuplicateRequest(FrameId),
}

impl PeerwireError {
    /// Whether this error came from a request deadline elapsing.
    pub fn is_timeout(&self) -> bool {
        matches!(self, PeerwireError::Timeout | PeerwireError::HandshakeTimeout)
    }
}

/// Result type alias using PeerwireError.
pub type Result<T> = std::result::Result<T, PeerwireError>;
