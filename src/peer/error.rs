use thiserror::Error;

use crate::scheduler::RequestIndex;

/// Errors that can occur during peer communication.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent an invalid handshake.
    #[error("invalid handshake")]
    InvalidHandshake,

    /// The peer's info hash doesn't match ours.
    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// Received a malformed or out-of-spec message; closes the connection.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Received an unknown message ID.
    #[error("unknown message id: {0}")]
    UnknownMessageId(u8),

    /// A fast-extension message arrived but the extension wasn't negotiated.
    #[error("fast extension message without negotiation: id {0}")]
    FastExtensionDisabled(u8),

    /// A Reject arrived for a request that is neither outstanding nor
    /// cancelled. Surfaced to the caller; the connection stays usable.
    #[error("reject for request we don't track: {0}")]
    InvalidReject(RequestIndex),

    /// The connection was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// Operation timed out.
    #[error("timeout")]
    Timeout,

    /// Error decoding bencode in extension messages.
    #[error("extension error: {0}")]
    Extension(String),

    /// A defensive fault: an internal invariant did not hold. Loud in
    /// testing, logged and ignored in production.
    #[error("internal invariant breached: {0}")]
    InternalInvariant(String),
}
