//! Whole-bundle serialization
//!
//! A bundle on the wire is the primary block, zero or more extension
//! blocks, and the payload block flagged as the last block. Extension
//! blocks that should follow the payload never occur in this profile;
//! the payload terminates the bundle.

use bytes::{Bytes, BytesMut};

use crate::block::{block_type, BlockFlags, RawBlock};
use crate::error::CodecError;
use crate::primary::PrimaryBlock;

/// A fully decoded wire bundle
#[derive(Debug, Clone)]
pub struct DecodedBundle {
    /// The primary block
    pub primary: PrimaryBlock,
    /// Extension blocks, in wire order, payload excluded
    pub ext_blocks: Vec<RawBlock>,
    /// The payload block's bytes
    pub payload: Bytes,
}

/// Encode a bundle: primary block, extension blocks, payload block last
pub fn encode_bundle(
    primary: &PrimaryBlock,
    ext_blocks: &[RawBlock],
    payload: &Bytes,
) -> Bytes {
    let mut buf = BytesMut::new();
    primary.encode(&mut buf);
    for block in ext_blocks {
        // The payload terminates the bundle, so nothing earlier is last
        let mut block = block.clone();
        block.flags = block.flags.with(BlockFlags::LAST_BLOCK, false);
        block.encode(&mut buf);
    }
    let payload_block = RawBlock::new(
        block_type::PAYLOAD,
        BlockFlags(0).with(BlockFlags::LAST_BLOCK, true),
        payload.clone(),
    );
    payload_block.encode(&mut buf);
    buf.freeze()
}

/// Decode a bundle from `buf`, returning the bundle and bytes consumed
///
/// The decode stops at the block flagged as last. A bundle whose payload
/// block is missing, or that ends before the last block, is malformed.
pub fn decode_bundle(buf: &[u8]) -> Result<(DecodedBundle, usize), CodecError> {
    let (primary, mut pos) = PrimaryBlock::decode(buf)?;

    let mut ext_blocks = Vec::new();
    let mut payload: Option<Bytes> = None;

    loop {
        if pos >= buf.len() {
            return Err(CodecError::Truncated);
        }
        let (block, consumed) = RawBlock::decode(&buf[pos..])?;
        pos += consumed;
        let last = block.flags.contains(BlockFlags::LAST_BLOCK);

        if block.block_type == block_type::PAYLOAD {
            if payload.is_some() {
                return Err(CodecError::Malformed("duplicate payload block"));
            }
            payload = Some(block.data);
        } else {
            ext_blocks.push(block);
        }

        if last {
            break;
        }
    }

    let payload = payload.ok_or(CodecError::Malformed("bundle has no payload block"))?;

    Ok((
        DecodedBundle {
            primary,
            ext_blocks,
            payload,
        },
        pos,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockData;
    use crate::primary::ProcessingFlags;
    use waypoint_core::{CreationTimestamp, EndpointId, Priority, ReportFlags};

    fn make_primary() -> PrimaryBlock {
        PrimaryBlock {
            flags: ProcessingFlags::assemble(
                false,
                false,
                false,
                false,
                true,
                Priority::Normal,
                ReportFlags::default(),
            ),
            dest: EndpointId::parse("dtn://node-b/sink").unwrap(),
            source: EndpointId::parse("dtn://node-a/app").unwrap(),
            replyto: EndpointId::null(),
            custodian: EndpointId::null(),
            creation_ts: CreationTimestamp::new(800_000_000, 1),
            lifetime: 3600,
            fragment: None,
        }
    }

    #[test]
    fn test_bundle_round_trip() {
        let primary = make_primary();
        let prevhop =
            BlockData::PreviousHop(EndpointId::parse("dtn://relay-1").unwrap()).to_raw(
                BlockFlags(0),
            );
        let payload = Bytes::from_static(b"the payload bytes");

        let wire = encode_bundle(&primary, &[prevhop.clone()], &payload);
        let (decoded, consumed) = decode_bundle(&wire).unwrap();

        assert_eq!(consumed, wire.len());
        assert_eq!(decoded.primary, primary);
        assert_eq!(decoded.payload, payload);
        assert_eq!(decoded.ext_blocks.len(), 1);
        assert_eq!(decoded.ext_blocks[0].data, prevhop.data);
    }

    #[test]
    fn test_bundle_without_ext_blocks() {
        let wire = encode_bundle(&make_primary(), &[], &Bytes::from_static(b"x"));
        let (decoded, _) = decode_bundle(&wire).unwrap();
        assert!(decoded.ext_blocks.is_empty());
        assert_eq!(decoded.payload, Bytes::from_static(b"x"));
    }

    #[test]
    fn test_truncated_bundle() {
        let wire = encode_bundle(&make_primary(), &[], &Bytes::from_static(b"full payload"));
        assert!(matches!(
            decode_bundle(&wire[..wire.len() - 4]),
            Err(CodecError::Truncated)
        ));
    }

    #[test]
    fn test_trailing_bytes_not_consumed() {
        let wire = encode_bundle(&make_primary(), &[], &Bytes::from_static(b"p"));
        let mut framed = wire.to_vec();
        framed.extend_from_slice(b"next-bundle-bytes");

        let (_, consumed) = decode_bundle(&framed).unwrap();
        assert_eq!(consumed, wire.len());
    }
}
