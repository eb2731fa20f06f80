//! Canonical block framing and known block kinds
//!
//! Every non-primary block shares the frame {type byte, processing flags
//! SDNV, optional EID-reference list, data length SDNV, data bytes}. The
//! known kinds decode further into [`BlockData`]; everything else is
//! carried as `Unknown` and the caller honors the block's
//! discard-if-unprocessed flag.

use bytes::{BufMut, Bytes, BytesMut};

use waypoint_core::{CarriedBlock, EndpointId};

use crate::cursor::Cursor;
use crate::error::CodecError;
use crate::sdnv;

/// Known block type codes
pub mod block_type {
    /// Payload block
    pub const PAYLOAD: u8 = 0x01;
    /// Bundle authentication (carried opaquely)
    pub const BUNDLE_AUTHENTICATION: u8 = 0x02;
    /// Payload integrity (carried opaquely)
    pub const PAYLOAD_INTEGRITY: u8 = 0x03;
    /// Payload confidentiality (carried opaquely)
    pub const PAYLOAD_CONFIDENTIALITY: u8 = 0x04;
    /// Previous hop insertion
    pub const PREVIOUS_HOP: u8 = 0x05;
    /// Extension security (carried opaquely)
    pub const EXTENSION_SECURITY: u8 = 0x09;
    /// Custody transfer enhancement
    pub const CUSTODY_TRANSFER_ENHANCEMENT: u8 = 0x0a;
    /// Bundle query (carried opaquely)
    pub const QUERY: u8 = 0x0b;
    /// Bundle age
    pub const AGE: u8 = 0x14;
}

/// Block processing flags (the SDNV after the type byte)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockFlags(pub u64);

impl BlockFlags {
    /// Replicate this block in every fragment
    pub const REPLICATE: u64 = 1 << 0;
    /// Transmit a status report if the block can't be processed
    pub const REPORT_IF_UNPROCESSED: u64 = 1 << 1;
    /// Delete the bundle if the block can't be processed
    pub const DELETE_BUNDLE_IF_UNPROCESSED: u64 = 1 << 2;
    /// This is the last block of the bundle
    pub const LAST_BLOCK: u64 = 1 << 3;
    /// Discard this block if it can't be processed
    pub const DISCARD_IF_UNPROCESSED: u64 = 1 << 4;
    /// The block was forwarded without being processed
    pub const FORWARDED_UNPROCESSED: u64 = 1 << 5;
    /// The block carries EID references
    pub const HAS_EID_REFS: u64 = 1 << 6;

    /// Whether `mask` is set
    pub fn contains(&self, mask: u64) -> bool {
        self.0 & mask != 0
    }

    /// Return a copy with `mask` set or cleared
    pub fn with(mut self, mask: u64, on: bool) -> Self {
        if on {
            self.0 |= mask;
        } else {
            self.0 &= !mask;
        }
        self
    }
}

/// A framed block: type, flags, EID refs, and opaque data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBlock {
    /// Block type code
    pub block_type: u8,
    /// Block processing flags
    pub flags: BlockFlags,
    /// (scheme offset, ssp offset) dictionary references
    pub eid_refs: Vec<(u64, u64)>,
    /// Block type-specific data
    pub data: Bytes,
}

impl RawBlock {
    /// Frame a block with no EID references
    pub fn new(block_type: u8, flags: BlockFlags, data: Bytes) -> Self {
        Self {
            block_type,
            flags,
            eid_refs: Vec::new(),
            data,
        }
    }

    /// Append the encoded block to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.block_type);
        let flags = self
            .flags
            .with(BlockFlags::HAS_EID_REFS, !self.eid_refs.is_empty());
        sdnv::encode(flags.0, buf);
        if !self.eid_refs.is_empty() {
            sdnv::encode(self.eid_refs.len() as u64, buf);
            for (scheme, ssp) in &self.eid_refs {
                sdnv::encode(*scheme, buf);
                sdnv::encode(*ssp, buf);
            }
        }
        sdnv::encode(self.data.len() as u64, buf);
        buf.put_slice(&self.data);
    }

    /// Decode a block from the front of `buf`
    ///
    /// Returns the block and the bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        let mut cur = Cursor::new(buf);
        let block_type = cur.read_u8()?;
        let flags = BlockFlags(cur.read_sdnv()?);

        let mut eid_refs = Vec::new();
        if flags.contains(BlockFlags::HAS_EID_REFS) {
            let count = cur.read_sdnv()?;
            if count > 64 {
                return Err(CodecError::Malformed("implausible EID reference count"));
            }
            for _ in 0..count {
                let scheme = cur.read_sdnv()?;
                let ssp = cur.read_sdnv()?;
                eid_refs.push((scheme, ssp));
            }
        }

        let data_len = cur.read_sdnv()? as usize;
        let data = Bytes::copy_from_slice(cur.read_bytes(data_len)?);

        Ok((
            Self {
                block_type,
                flags,
                eid_refs,
                data,
            },
            cur.pos(),
        ))
    }

    /// Convert to the opaque form carried on a bundle
    pub fn to_carried(&self) -> CarriedBlock {
        CarriedBlock {
            block_type: self.block_type,
            flags: self.flags.0,
            data: self.data.clone(),
        }
    }

    /// Rebuild from the opaque carried form
    pub fn from_carried(block: &CarriedBlock) -> Self {
        Self {
            block_type: block.block_type,
            flags: BlockFlags(block.flags),
            eid_refs: Vec::new(),
            data: block.data.clone(),
        }
    }
}

/// Custody transfer enhancement block contents
///
/// The previous custodian's node-local custody id plus the custodian EID
/// that allocated it. The block is only honored when the embedded EID
/// matches the primary block's custodian verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtebData {
    /// Custody id allocated by the block's creator
    pub custody_id: u64,
    /// The creator's custodian EID string
    pub custodian: String,
}

impl CtebData {
    /// Encode: custody id SDNV, then the EID string filling the block
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        sdnv::encode(self.custody_id, &mut buf);
        buf.put_slice(self.custodian.as_bytes());
        buf.freeze()
    }

    /// Decode from block data
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut cur = Cursor::new(data);
        let custody_id = cur.read_sdnv()?;
        let rest = cur.read_bytes(cur.remaining())?;
        let custodian = std::str::from_utf8(rest)
            .map_err(|_| CodecError::Malformed("non-utf8 CTEB custodian"))?
            .to_string();
        if custodian.is_empty() {
            return Err(CodecError::Malformed("empty CTEB custodian"));
        }
        Ok(Self {
            custody_id,
            custodian,
        })
    }
}

/// Interpreted contents of a known block
#[derive(Debug, Clone, PartialEq)]
pub enum BlockData {
    /// The payload block's bytes
    Payload(Bytes),
    /// The previous hop's endpoint
    PreviousHop(EndpointId),
    /// Custody transfer enhancement contents
    CustodyTransferEnhancement(CtebData),
    /// Accumulated bundle age in seconds
    Age(u64),
    /// Anything we carry without interpreting
    Unknown { block_type: u8, data: Bytes },
}

impl BlockData {
    /// Interpret a framed block
    ///
    /// Security and query blocks come back as `Unknown` on purpose: the
    /// node carries them, it does not process them.
    pub fn parse(raw: &RawBlock) -> Result<Self, CodecError> {
        match raw.block_type {
            block_type::PAYLOAD => Ok(BlockData::Payload(raw.data.clone())),
            block_type::PREVIOUS_HOP => Ok(BlockData::PreviousHop(decode_prevhop(&raw.data)?)),
            block_type::CUSTODY_TRANSFER_ENHANCEMENT => Ok(BlockData::CustodyTransferEnhancement(
                CtebData::decode(&raw.data)?,
            )),
            block_type::AGE => {
                let (age, _) = sdnv::decode(&raw.data)?;
                Ok(BlockData::Age(age))
            }
            block_type::BUNDLE_AUTHENTICATION
            | block_type::PAYLOAD_INTEGRITY
            | block_type::PAYLOAD_CONFIDENTIALITY
            | block_type::EXTENSION_SECURITY
            | block_type::QUERY => Ok(BlockData::Unknown {
                block_type: raw.block_type,
                data: raw.data.clone(),
            }),
            other => Err(CodecError::UnknownBlockType { block_type: other }),
        }
    }

    /// Frame this block for transmission
    pub fn to_raw(&self, flags: BlockFlags) -> RawBlock {
        match self {
            BlockData::Payload(data) => {
                RawBlock::new(block_type::PAYLOAD, flags, data.clone())
            }
            BlockData::PreviousHop(eid) => {
                RawBlock::new(block_type::PREVIOUS_HOP, flags, encode_prevhop(eid))
            }
            BlockData::CustodyTransferEnhancement(cteb) => RawBlock::new(
                block_type::CUSTODY_TRANSFER_ENHANCEMENT,
                flags,
                cteb.encode(),
            ),
            BlockData::Age(age) => {
                let mut buf = BytesMut::new();
                sdnv::encode(*age, &mut buf);
                RawBlock::new(block_type::AGE, flags, buf.freeze())
            }
            BlockData::Unknown { block_type, data } => {
                RawBlock::new(*block_type, flags, data.clone())
            }
        }
    }
}

/// Previous-hop block data: scheme, NUL, ssp, NUL
fn encode_prevhop(eid: &EndpointId) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_slice(eid.scheme().as_bytes());
    buf.put_u8(0);
    buf.put_slice(eid.ssp().as_bytes());
    buf.put_u8(0);
    buf.freeze()
}

fn decode_prevhop(data: &[u8]) -> Result<EndpointId, CodecError> {
    let mut parts = data.split(|&b| b == 0);
    let scheme = parts.next().ok_or(CodecError::Malformed("empty previous-hop block"))?;
    let ssp = parts
        .next()
        .ok_or(CodecError::Malformed("previous-hop block missing ssp"))?;
    let scheme = std::str::from_utf8(scheme)
        .map_err(|_| CodecError::Malformed("non-utf8 previous-hop scheme"))?;
    let ssp = std::str::from_utf8(ssp)
        .map_err(|_| CodecError::Malformed("non-utf8 previous-hop ssp"))?;
    Ok(EndpointId::from_parts(scheme, ssp)?)
}
