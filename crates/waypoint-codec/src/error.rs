//! Codec error kinds

use thiserror::Error;

use waypoint_core::EidError;

/// Precise wire-format error kinds
///
/// `Truncated` means the input ran out mid-value and more bytes might
/// rescue the parse; everything else is a hard protocol error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Input exhausted before the value was complete
    #[error("truncated input")]
    Truncated,

    /// An SDNV wider than 64 bits
    #[error("SDNV overflows 64 bits")]
    Overflow,

    /// Structurally invalid data
    #[error("malformed {0}")]
    Malformed(&'static str),

    /// A dictionary offset pointing outside the dictionary
    #[error("dictionary offset {offset} out of range (dictionary length {dict_len})")]
    DictionaryOutOfRange { offset: u64, dict_len: usize },

    /// Bundle protocol version we do not speak
    #[error("unsupported bundle protocol version {version}")]
    UnsupportedVersion { version: u8 },

    /// A block type with no registered interpretation
    ///
    /// The caller consults the block's discard flag to decide what to do.
    #[error("unknown block type {block_type:#04x}")]
    UnknownBlockType { block_type: u8 },

    /// An administrative record type nibble we do not recognize
    #[error("unknown administrative record type {admin_type:#03x}")]
    UnknownAdminType { admin_type: u8 },

    /// A dictionary entry or embedded EID failed to parse
    #[error("invalid endpoint id: {0}")]
    InvalidEid(#[from] EidError),
}
