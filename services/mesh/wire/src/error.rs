//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Datagram shorter than the fixed header
    #[error("incomplete header: {0} bytes")]
    Incomplete(usize),

    /// Magic does not identify a bridge datagram
    #[error("bad magic: {0:#010x}")]
    Magic(u32),

    /// Unsupported protocol version
    #[error("version unsupported: {0}")]
    Version(u8),

    /// Declared payload length disagrees with the datagram
    #[error("length mismatch: declared {declared}, actual {actual}")]
    Length {
        /// payload_len from the header
        declared: usize,
        /// Bytes actually following the header
        actual: usize,
    },

    /// Payload checksum mismatch
    #[error("checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    Checksum {
        /// Checksum carried in the header
        expected: u16,
        /// Checksum recomputed over the payload
        actual: u16,
    },

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),
}

impl WireError {
    /// Whether the datagram belongs to some other protocol rather than being
    /// a damaged bridge datagram.
    pub fn is_foreign(&self) -> bool {
        matches!(self, WireError::Incomplete(_) | WireError::Magic(_))
    }
}
