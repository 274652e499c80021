//! Protocol error types

use thiserror::Error;

/// Wire codec errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Transfer payload exceeds what a single frame can carry
    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Zero-length frame where a tag byte was required
    #[error("Empty frame")]
    EmptyFrame,

    /// Request kind tag outside SETUP/IN/OUT
    #[error("Unknown request kind: {0:#04x}")]
    UnknownKind(u8),

    /// Reply status tag outside OK/NAK/STALL
    #[error("Unknown reply status: {0:#04x}")]
    UnknownStatus(u8),

    /// Frame shorter than its fixed header
    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// I/O error while reading fixed-width fields
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
