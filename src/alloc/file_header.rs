// Copyright (c) 2024-present, tide-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{alloc::Ref, Error};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Write};

pub const MAGIC_BYTES: [u8; 4] = [b'T', b'-', b'D', b'B'];

/// On-disk file format version
pub const FORMAT_VERSION: u16 = 1;

/// Size of the file header in bytes
pub const FILE_HEADER_SIZE: usize = 24;

/// The 24-byte header at offset 0 of every database file
///
/// Two top-ref slots plus a selector bit make the commit publish atomic:
/// a new top ref is first written into the inactive slot, then the selector
/// bit is flipped with a single aligned byte write.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FileHeader {
    /// The two candidate top refs
    pub top_refs: [Ref; 2],

    /// File format version
    pub format_version: u16,

    /// Bit 0 selects `top_refs[1]` when set, `top_refs[0]` when clear
    pub flags: u8,
}

impl FileHeader {
    /// Header of a freshly created, empty database file.
    #[must_use]
    pub fn new() -> Self {
        Self {
            top_refs: [0, 0],
            format_version: FORMAT_VERSION,
            flags: 0,
        }
    }

    /// Index of the currently live top-ref slot.
    #[must_use]
    pub fn live_slot(&self) -> usize {
        usize::from(self.flags & 1)
    }

    /// The currently live top ref; 0 means the file holds an empty database.
    #[must_use]
    pub fn live_top_ref(&self) -> Ref {
        self.top_refs[self.live_slot()]
    }

    pub fn decode(bytes: &[u8; FILE_HEADER_SIZE]) -> crate::Result<Self> {
        let mut reader = Cursor::new(&bytes[..]);

        let top_a = reader.read_u64::<LittleEndian>()?;
        let top_b = reader.read_u64::<LittleEndian>()?;

        let mut magic = [0u8; MAGIC_BYTES.len()];
        std::io::Read::read_exact(&mut reader, &mut magic)?;

        if magic != MAGIC_BYTES {
            return Err(Error::Corrupt("file header magic mismatch"));
        }

        let format_version = reader.read_u16::<LittleEndian>()?;

        if format_version != FORMAT_VERSION {
            return Err(Error::InvalidVersion(format_version));
        }

        let _reserved = reader.read_u8()?;
        let flags = reader.read_u8()?;

        if (top_a | top_b) & 7 != 0 {
            return Err(Error::Corrupt("top ref not 8-byte aligned"));
        }

        Ok(Self {
            top_refs: [top_a, top_b],
            format_version,
            flags,
        })
    }

    #[must_use]
    pub fn encode(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut bytes = [0u8; FILE_HEADER_SIZE];
        let mut writer = Cursor::new(&mut bytes[..]);

        writer
            .write_u64::<LittleEndian>(self.top_refs[0])
            .expect("cannot fail");
        writer
            .write_u64::<LittleEndian>(self.top_refs[1])
            .expect("cannot fail");
        writer.write_all(&MAGIC_BYTES).expect("cannot fail");
        writer
            .write_u16::<LittleEndian>(self.format_version)
            .expect("cannot fail");
        writer.write_u8(0).expect("cannot fail");
        writer.write_u8(self.flags).expect("cannot fail");

        bytes
    }
}

impl Default for FileHeader {
    fn default() -> Self {
        Self::new()
    }
}
