//! Shared error types for the overlay.

use crate::address::Address;
use thiserror::Error;

/// Top-level error type for the overlay node and its wire protocol.
#[derive(Error, Debug)]
pub enum VonError {
    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A packet could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A message lacks a required identity, address or position.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// A connection already identified as one peer claimed to be another.
    #[error("Connection already identified as {bound}, cannot rebind to {claimed}")]
    AlreadyBound {
        /// The address the connection is bound to.
        bound: Address,
        /// The address the offending message claimed.
        claimed: Address,
    },

    /// A second connection was opened to an address that already has one.
    #[error("Connection to {0} already exists")]
    DuplicateConnection(Address),

    /// The node tried to open a connection to its own address.
    #[error("Refusing to connect to own address {0}")]
    SelfConnection(Address),

    /// Point forwarding was asked to leave a node that has no neighbors.
    #[error("No neighbors available for point forwarding")]
    NoNeighbors,

    /// The given address is not a current enclosing neighbor.
    #[error("Unknown neighbor: {0}")]
    UnknownNeighbor(Address),

    /// A peer did not reply within the configured timeout.
    #[error("Timed out waiting for {request} reply from {peer}")]
    Timeout {
        /// The request that went unanswered.
        request: &'static str,
        /// The silent peer.
        peer: String,
    },

    /// The connection was closed before the operation completed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A frame exceeded the configured size limit.
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },

    /// The peer answered with an INVALID message.
    #[error("Peer rejected message as invalid: {reason}")]
    Invalid { reason: String },

    /// A reply of the wrong kind arrived for an outstanding request.
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An address string could not be parsed.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

impl VonError {
    /// Protocol violations are fatal for the connection that detected them.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            VonError::AlreadyBound { .. } | VonError::DuplicateConnection(_)
        )
    }
}

/// Alias for Result with VonError.
pub type VonResult<T> = Result<T, VonError>;
