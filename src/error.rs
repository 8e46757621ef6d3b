//! Error types for newtdock.
//!
//! Local recovery inside the link layer (CRC drops, duplicate frames) never
//! surfaces through these variants to the session layer; they exist so the
//! lower layers can report what happened to the engine that owns them.

use thiserror::Error;

use crate::protocol::Tag;

/// Main error type for all dock operations.
#[derive(Debug, Error)]
pub enum DockError {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON configuration could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration is inconsistent.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Buffer storage could not be allocated.
    #[error("Out of memory")]
    OutOfMemory,

    /// No byte could be stored; drain the buffer and retry.
    #[error("Buffer full")]
    BufferFull,

    /// The marker ring is saturated; drain records before producing more.
    #[error("Markers full")]
    MarkersFull,

    /// Nothing is buffered.
    #[error("Buffer empty")]
    BufferEmpty,

    /// A record boundary was requested but none is queued.
    #[error("No marker queued")]
    NoMarker,

    /// Frame trailer did not match the computed checksum.
    #[error("CRC mismatch: expected {expected:#06x}, got {got:#06x}")]
    CrcMismatch { expected: u16, got: u16 },

    /// A link transfer arrived out of sequence.
    #[error("Sequence error: expected {expected}, got {got}")]
    SequenceError { expected: u8, got: u8 },

    /// Event header identifiers do not belong to the toolkit protocol.
    #[error("Protocol mismatch: class {class}, id {id}")]
    ProtocolMismatch { class: Tag, id: Tag },

    /// Malformed header, oversize payload or other framing violation.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The peer never acknowledged the outstanding frame.
    #[error("Link timed out after {retries} retransmissions")]
    LinkTimeout { retries: u32 },

    /// The link or endpoint is closed.
    #[error("Disconnected")]
    Disconnected,

    /// No event arrived before the receive deadline.
    #[error("Timed out waiting for event")]
    Timeout,

    /// Backpressure timeout - outbound queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,
}

impl DockError {
    /// Whether the error ends the link rather than a single operation.
    pub fn is_link_fatal(&self) -> bool {
        matches!(
            self,
            DockError::LinkTimeout { .. } | DockError::Disconnected | DockError::Io(_)
        )
    }
}

/// Result type alias using DockError.
pub type Result<T> = std::result::Result<T, DockError>;
