//! Self-delimiting numeric values
//!
//! The variable-length unsigned integer encoding used throughout the
//! bundle protocol. Each byte carries seven payload bits, most significant
//! group first; the high bit is set on every byte except the last. A
//! 64-bit value therefore needs at most ten bytes.

use bytes::BufMut;

use crate::error::CodecError;

/// Longest encoding of a 64-bit value
pub const MAX_SDNV_LEN: usize = 10;

/// Number of bytes `encode` will produce for `val`
pub fn encoding_len(mut val: u64) -> usize {
    let mut len = 1;
    val >>= 7;
    while val > 0 {
        len += 1;
        val >>= 7;
    }
    len
}

/// Append the SDNV encoding of `val` to `buf`, returning the byte count
pub fn encode(val: u64, buf: &mut impl BufMut) -> usize {
    let len = encoding_len(val);
    for i in (0..len).rev() {
        let mut byte = ((val >> (7 * i)) & 0x7f) as u8;
        if i != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
    }
    len
}

/// Decode an SDNV from the front of `buf`
///
/// Returns the value and the number of bytes consumed. Fails with
/// [`CodecError::Overflow`] when the encoding does not fit in 64 bits
/// (including a tenth byte that still has its continuation bit set) and
/// [`CodecError::Truncated`] when the buffer ends mid-value.
pub fn decode(buf: &[u8]) -> Result<(u64, usize), CodecError> {
    let mut val: u64 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if i >= MAX_SDNV_LEN {
            return Err(CodecError::Overflow);
        }
        // The next seven bits must not shift significant bits off the top
        if val >> 57 != 0 {
            return Err(CodecError::Overflow);
        }
        val = (val << 7) | (byte & 0x7f) as u64;
        if byte & 0x80 == 0 {
            return Ok((val, i + 1));
        }
    }
    if buf.len() >= MAX_SDNV_LEN {
        Err(CodecError::Overflow)
    } else {
        Err(CodecError::Truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn round_trip(val: u64) -> (Vec<u8>, u64, usize) {
        let mut buf = BytesMut::new();
        let written = encode(val, &mut buf);
        assert_eq!(written, buf.len());
        let (decoded, consumed) = decode(&buf).unwrap();
        (buf.to_vec(), decoded, consumed)
    }

    #[test]
    fn test_round_trip_at_powers_of_128() {
        for (val, expect_len) in [
            (0u64, 1usize),
            (127, 1),
            (128, 2),
            (16383, 2),
            (16384, 3),
            (u64::MAX, 10),
        ] {
            let (bytes, decoded, consumed) = round_trip(val);
            assert_eq!(bytes.len(), expect_len, "length for {val}");
            assert_eq!(decoded, val);
            assert_eq!(consumed, expect_len);
            assert_eq!(encoding_len(val), expect_len);
        }
    }

    #[test]
    fn test_known_encodings() {
        let mut buf = BytesMut::new();
        encode(0x7f, &mut buf);
        assert_eq!(&buf[..], &[0x7f]);

        let mut buf = BytesMut::new();
        encode(0x80, &mut buf);
        assert_eq!(&buf[..], &[0x81, 0x00]);

        let mut buf = BytesMut::new();
        encode(0x1234, &mut buf);
        assert_eq!(&buf[..], &[0xa4, 0x34]);
    }

    #[test]
    fn test_decode_stops_at_terminator() {
        // Trailing garbage after the value is not consumed
        let bytes = [0x81, 0x00, 0xde, 0xad];
        let (val, consumed) = decode(&bytes).unwrap();
        assert_eq!(val, 0x80);
        assert_eq!(consumed, 2);
    }

    #[test]
    fn test_truncated() {
        assert_eq!(decode(&[]), Err(CodecError::Truncated));
        assert_eq!(decode(&[0x81]), Err(CodecError::Truncated));
        assert_eq!(decode(&[0xff, 0xff]), Err(CodecError::Truncated));
    }

    #[test]
    fn test_overflow_ten_bytes_with_continuation() {
        // Ten bytes, all with the continuation bit set
        let bytes = [0x80u8; 10];
        assert_eq!(decode(&bytes), Err(CodecError::Overflow));

        // Eleven-byte buffer also overflows rather than truncates
        let bytes = [0x80u8; 11];
        assert_eq!(decode(&bytes), Err(CodecError::Overflow));
    }

    #[test]
    fn test_overflow_value_past_64_bits() {
        // 2^64 needs 65 bits: first byte payload 2 with 9 continuation bytes
        let bytes = [0x82, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x00];
        assert_eq!(decode(&bytes), Err(CodecError::Overflow));
    }

    #[test]
    fn test_max_value_exact() {
        // u64::MAX is the largest decodable value
        let mut buf = BytesMut::new();
        encode(u64::MAX, &mut buf);
        assert_eq!(buf[0], 0x81);
        let (val, consumed) = decode(&buf).unwrap();
        assert_eq!(val, u64::MAX);
        assert_eq!(consumed, 10);
    }
}
