//! # Waypoint Codec
//!
//! Byte-exact RFC 5050 wire-format codecs:
//!
//! - [`sdnv`]: self-delimiting numeric values
//! - [`primary`]: the primary block with its EID dictionary
//! - [`block`]: canonical (extension) block framing and the known block
//!   kinds - payload, previous-hop, custody-transfer-enhancement, age,
//!   and the security/query blocks carried opaquely
//! - [`admin`]: administrative record payloads - status reports, custody
//!   signals, and aggregate custody signals
//! - [`wire`]: whole-bundle encode/decode over the above
//!
//! Codecs return precise error kinds ([`CodecError`]); the caller decides
//! whether to drop a block, drop the bundle, or generate a status report.

pub mod admin;
pub mod block;
pub(crate) mod cursor;
pub mod error;
pub mod primary;
pub mod sdnv;
pub mod wire;

pub use admin::{
    AdminRecord, AggregateCustodySignal, CustodySignal, CustodySignalReason, StatusReport,
    StatusReason,
};
pub use block::{block_type, BlockData, BlockFlags, CtebData, RawBlock};
pub use error::CodecError;
pub use primary::{FragmentInfo, PrimaryBlock, ProcessingFlags, BP_VERSION};
pub use wire::{decode_bundle, encode_bundle, DecodedBundle};
