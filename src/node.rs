// Copyright (c) 2024-present, tide-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The universal node header
//!
//! Every persisted structure begins with the same 8-byte header, followed by
//! its payload, followed by zero padding to an 8-byte boundary:
//!
//! ```text
//! [0..3]  capacity in bytes, including the header (u24, big-endian)
//! [3]     reserved, zero
//! [4]     flag byte:
//!           0x80  inner B+-tree node
//!           0x40  payload slots hold refs or tagged values
//!           0x20  context flag, meaning depends on the container
//!           0x18  width type
//!           0x07  element width, encoded as log2
//! [5..8]  size in elements (u24, big-endian)
//! ```
//!
//! The header alone determines the byte length of a node, so a sequential
//! scan of the file can locate every allocated node for recovery.

/// Number of bytes used by the header
pub const HEADER_SIZE: usize = 8;

/// Maximum number of payload bytes a node can hold
pub const MAX_PAYLOAD_SIZE: usize = 0x00FF_FFFF;

const FLAG_INNER: u8 = 0x80;
const FLAG_HAS_REFS: u8 = 0x40;
const FLAG_CONTEXT: u8 = 0x20;

/// How the element width translates into payload bytes
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WidthType {
    /// Width is the number of bits each element occupies
    Bits = 0,

    /// Width is the number of bytes each element occupies
    Multiply = 1,

    /// Each element occupies one byte, the width field is ignored
    Ignore = 2,
}

impl WidthType {
    fn from_bits(value: u8) -> Self {
        match value & 0b11 {
            0 => Self::Bits,
            1 => Self::Multiply,
            _ => Self::Ignore,
        }
    }
}

/// Decoded form of the 8-byte node header
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Header {
    /// Allocated bytes, including the header itself
    pub capacity: usize,

    /// Node is an inner B+-tree node
    pub is_inner: bool,

    /// Payload slots are refs, or odd tagged integers
    pub has_refs: bool,

    /// Free flag whose meaning depends on the container
    pub context_flag: bool,

    /// Interpretation of `width`
    pub width_type: WidthType,

    /// Element width in bits (`Bits`) or bytes (`Multiply`); one of
    /// 0, 1, 2, 4, 8, 16, 32, 64
    pub width: u8,

    /// Number of elements currently stored
    pub size: usize,
}

impl Header {
    /// Decodes a header from the first 8 bytes of a node.
    #[must_use]
    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Self {
        let flags = bytes[4];

        Self {
            capacity: read_u24(bytes[0], bytes[1], bytes[2]),
            is_inner: (flags & FLAG_INNER) != 0,
            has_refs: (flags & FLAG_HAS_REFS) != 0,
            context_flag: (flags & FLAG_CONTEXT) != 0,
            width_type: WidthType::from_bits((flags >> 3) & 0b11),
            width: decode_width(flags & 0b111),
            size: read_u24(bytes[5], bytes[6], bytes[7]),
        }
    }

    /// Encodes the header into its on-disk form.
    ///
    /// The reserved byte is always written as zero so that recovery scans
    /// see a deterministic header image.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        debug_assert!(self.capacity <= MAX_PAYLOAD_SIZE);
        debug_assert!(self.size <= MAX_PAYLOAD_SIZE);

        let mut flags = encode_width(self.width);
        flags |= (self.width_type as u8) << 3;

        if self.is_inner {
            flags |= FLAG_INNER;
        }
        if self.has_refs {
            flags |= FLAG_HAS_REFS;
        }
        if self.context_flag {
            flags |= FLAG_CONTEXT;
        }

        [
            (self.capacity >> 16) as u8,
            (self.capacity >> 8) as u8,
            self.capacity as u8,
            0,
            flags,
            (self.size >> 16) as u8,
            (self.size >> 8) as u8,
            self.size as u8,
        ]
    }

    /// Bytes currently in use by the node, header included.
    ///
    /// Always a multiple of 8; this is exactly the number of bytes a
    /// non-recursive serialization of the node writes.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        calc_byte_size(self.width_type, self.size, self.width)
    }
}

/// Computes the used byte length of a node from its header fields.
#[must_use]
pub fn calc_byte_size(width_type: WidthType, size: usize, width: u8) -> usize {
    debug_assert!(size <= MAX_PAYLOAD_SIZE);

    let num_bytes = match width_type {
        WidthType::Bits => (size * usize::from(width) + 7) >> 3,
        WidthType::Multiply => size * usize::from(width),
        WidthType::Ignore => size,
    };

    // Pad to 8-byte alignment, then account for the header
    ((num_bytes + 7) & !7) + HEADER_SIZE
}

/// Unpacks the 3-bit log2 width encoding: 0..=7 -> 0,1,2,4,8,16,32,64
fn decode_width(encoded: u8) -> u8 {
    ((1u16 << encoded) >> 1) as u8
}

fn encode_width(width: u8) -> u8 {
    let mut w = 0u8;
    let mut value = width;
    while value != 0 {
        w += 1;
        value >>= 1;
    }
    debug_assert!(w < 8, "element width out of range");
    w
}

fn read_u24(hi: u8, mid: u8, lo: u8) -> usize {
    (usize::from(hi) << 16) | (usize::from(mid) << 8) | usize::from(lo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn header_roundtrip() {
        let header = Header {
            capacity: 128,
            is_inner: true,
            has_refs: true,
            context_flag: false,
            width_type: WidthType::Bits,
            width: 8,
            size: 3,
        };

        let bytes = header.encode();

        // NOTE: Header bytes are file format and must be stable
        assert_eq!([0, 0, 0x80, 0, 0xC4, 0, 0, 3], bytes);

        assert_eq!(header, Header::decode(&bytes));
    }

    #[test]
    fn header_width_encoding() {
        for width in [0u8, 1, 2, 4, 8, 16, 32, 64] {
            let header = Header {
                capacity: 64,
                is_inner: false,
                has_refs: false,
                context_flag: false,
                width_type: WidthType::Bits,
                width,
                size: 0,
            };
            assert_eq!(width, Header::decode(&header.encode()).width);
        }
    }

    #[test]
    fn header_reserved_byte_is_zero() {
        let header = Header {
            capacity: MAX_PAYLOAD_SIZE,
            is_inner: false,
            has_refs: true,
            context_flag: true,
            width_type: WidthType::Ignore,
            width: 0,
            size: MAX_PAYLOAD_SIZE,
        };
        assert_eq!(0, header.encode()[3]);
    }

    #[test]
    fn byte_size_bits() {
        // 3 elements of 8 bits = 3 bytes -> padded to 8, plus header
        assert_eq!(16, calc_byte_size(WidthType::Bits, 3, 8));

        // 64 one-bit elements = 8 bytes exactly
        assert_eq!(16, calc_byte_size(WidthType::Bits, 64, 1));

        // Width 0 holds only zeros and occupies no payload at all
        assert_eq!(8, calc_byte_size(WidthType::Bits, 1000, 0));
    }

    #[test]
    fn byte_size_multiply_and_ignore() {
        assert_eq!(8 + 24, calc_byte_size(WidthType::Multiply, 3, 8));
        assert_eq!(8 + 8, calc_byte_size(WidthType::Ignore, 5, 0));
    }
}
