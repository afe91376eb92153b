use thiserror::Error;

/// Errors that can occur while encoding or decoding device protocol data
#[derive(Error, Debug)]
pub enum BandlinkError {
    /// A required TLV tag was not present in the tree
    #[error("TLV tag 0x{tag:02X} not present")]
    MissingTag {
        /// The tag that was looked up
        tag: u8,
    },

    /// A TLV value's stored width does not match the requested type
    #[error("TLV tag 0x{tag:02X} holds {actual} byte(s), expected {expected}")]
    TypeMismatch {
        /// The tag that was looked up
        tag: u8,
        /// Description of the requested value kind
        expected: &'static str,
        /// Number of bytes actually stored
        actual: usize,
    },

    /// A declared length runs past the end of the buffer
    #[error("Truncated buffer: need {needed} byte(s), {remaining} remaining")]
    Truncated {
        /// Bytes required by the declared length
        needed: usize,
        /// Bytes actually left in the buffer
        remaining: usize,
    },

    /// A reassembled payload is shorter than the fixed header allows
    #[error("Payload length {len} is too short")]
    PayloadTooShort {
        /// Observed payload length in bytes
        len: usize,
    },

    /// The trailing CRC32 of a reassembled payload does not match
    #[error("Checksum mismatch: got {actual:08X}, expected {expected:08X}")]
    ChecksumMismatch {
        /// CRC32 declared in the payload trailer
        expected: u32,
        /// CRC32 computed over the payload
        actual: u32,
    },

    /// No decoder is registered for a recorded-data file kind
    #[error("No decoder registered for file kind 0x{kind:02X}")]
    UnknownDecoder {
        /// The unrecognized file kind byte
        kind: u8,
    },

    /// A record's internal structure could not be decoded
    #[error("Failed to decode record: {0}")]
    RecordDecode(String),

    /// A string value was not valid UTF-8
    #[error("Invalid UTF-8 in string value for tag 0x{tag:02X}")]
    InvalidString {
        /// The tag holding the malformed string
        tag: u8,
    },

    /// The encryption collaborator rejected a payload
    #[error("Cipher error: {0}")]
    Cipher(String),

    /// A received frame violates the framing contract
    #[error("Framing error: {0}")]
    Framing(String),

    /// Acting on a response before all of its chunks/fields were consumed
    #[error("Response is not complete")]
    Incomplete,

    /// Other protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Result type for bandlink operations
pub type Result<T> = std::result::Result<T, BandlinkError>;

impl BandlinkError {
    /// Check whether the fetch loop should skip this file and advance
    ///
    /// Malformed payloads, checksum failures, unknown file kinds, and decoder
    /// failures are all data problems confined to a single file: the queue
    /// keeps draining. Anything else aborts the surrounding request cycle.
    #[must_use]
    pub const fn is_skippable(&self) -> bool {
        matches!(
            self,
            Self::PayloadTooShort { .. }
                | Self::ChecksumMismatch { .. }
                | Self::UnknownDecoder { .. }
                | Self::RecordDecode(_)
        )
    }

    /// Check if this error indicates a malformed TLV structure
    #[must_use]
    pub const fn is_tlv_error(&self) -> bool {
        matches!(
            self,
            Self::MissingTag { .. }
                | Self::TypeMismatch { .. }
                | Self::Truncated { .. }
                | Self::InvalidString { .. }
        )
    }
}
