//! Error types for the networking layer.

/// Errors produced by framing, transport and connection handling.
///
/// Every variant is scoped to a single connection. Callers disconnect the
/// offending connection and keep serving everything else.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Underlying socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The byte stream ended inside a frame header or payload.
    #[error("frame truncated mid-read")]
    IncompleteFrame,

    /// A frame header declared a payload larger than the configured cap.
    /// Raised before any payload bytes are read or allocated.
    #[error("frame of {length} bytes exceeds limit of {max}")]
    FrameTooLarge { length: usize, max: usize },

    /// The transport refused the packet; the peer is gone or the send path
    /// is torn down. The connection must be treated as suspect.
    #[error("send failed: connection unavailable")]
    SendFailed,

    /// Operation attempted on a connection that has already been closed.
    #[error("connection closed")]
    ConnectionClosed,
}
