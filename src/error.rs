//! Error types for the grid asset cache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the asset cache.
///
/// A missing asset is reported as `None` everywhere, never as an error.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Request rejected before any lookup was attempted
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // =========================================================================
    // Peer Errors
    // =========================================================================
    /// Peer connection error
    #[error("Peer transport error: {0}")]
    PeerTransport(#[source] reqwest::Error),

    /// Peer did not answer within its time budget
    #[error("Peer {peer} timed out")]
    PeerTimeout { peer: String },

    /// Peer answered with an unexpected HTTP status
    #[error("Peer {peer} answered with status {status}")]
    PeerStatus { peer: String, status: u16 },

    /// Peer answered with content we could not decode
    #[error("Malformed peer response: {0}")]
    MalformedPeerResponse(String),

    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    /// Persistent asset store failure
    #[error("Asset store error: {0}")]
    Store(String),

    /// Client transport hand-off failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error is a transient I/O failure (retrying later may succeed).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::PeerTransport(_) | Error::PeerTimeout { .. } | Error::Store(_)
        )
    }
}
