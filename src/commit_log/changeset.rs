// Copyright (c) 2024-present, tide-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The changeset container
//!
//! One commit log entry holds one changeset: the byte regions the commit
//! wrote, plus the resulting top ref, logical file size and version.
//! Replaying a changeset onto a copy of the previous version reproduces
//! the next version byte for byte, which is what sync replication feeds
//! on. Instruction-level merge semantics live outside the core.

use crate::{
    alloc::{file_header::FileHeader, Ref, FILE_HEADER_SIZE},
    Error,
};
use std::io::{Read, Seek, SeekFrom, Write};
use varint_rs::{VarintReader, VarintWriter};

/// One written file region
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Patch {
    pub offset: u64,
    pub bytes: Vec<u8>,
}

/// The byte-level delta of a single commit
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Changeset {
    /// Version this changeset produces
    pub new_version: u64,

    /// Top ref to publish after the patches are applied
    pub new_top_ref: Ref,

    /// Logical file size after the commit
    pub new_logical_size: u64,

    /// Written regions, in allocation order
    pub patches: Vec<Patch>,
}

impl Changeset {
    /// Serializes into one log entry payload.
    pub fn encode_into_vec(&self) -> Vec<u8> {
        let mut v = Vec::new();

        v.write_u64_varint(self.new_version).expect("cannot fail");
        v.write_u64_varint(self.new_top_ref).expect("cannot fail");
        v.write_u64_varint(self.new_logical_size)
            .expect("cannot fail");
        v.write_usize_varint(self.patches.len()).expect("cannot fail");

        for patch in &self.patches {
            v.write_u64_varint(patch.offset).expect("cannot fail");
            v.write_usize_varint(patch.bytes.len()).expect("cannot fail");
            v.write_all(&patch.bytes).expect("cannot fail");
        }

        v
    }

    pub fn decode_from<R: Read>(reader: &mut R) -> crate::Result<Self> {
        let new_version = reader.read_u64_varint()?;
        let new_top_ref = reader.read_u64_varint()?;
        let new_logical_size = reader.read_u64_varint()?;
        let patch_count = reader.read_usize_varint()?;

        let mut patches = Vec::with_capacity(patch_count.min(1024));

        for _ in 0..patch_count {
            let offset = reader.read_u64_varint()?;
            let len = reader.read_usize_varint()?;

            let mut bytes = vec![0; len];
            reader.read_exact(&mut bytes)?;

            patches.push(Patch { offset, bytes });
        }

        Ok(Self {
            new_version,
            new_top_ref,
            new_logical_size,
            patches,
        })
    }

    /// Replays this changeset onto the database file at `path`, which must
    /// hold the version directly preceding [`Changeset::new_version`].
    ///
    /// Applies every patch, then publishes the new top ref through the
    /// regular inactive-slot-then-selector-flip protocol.
    pub fn apply_to_file(&self, path: &std::path::Path) -> crate::Result<()> {
        let mut file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;

        if file.metadata()?.len() < self.new_logical_size {
            file.set_len(self.new_logical_size)?;
        }

        for patch in &self.patches {
            if patch.offset < FILE_HEADER_SIZE as u64 {
                return Err(Error::Corrupt("changeset patches the file header"));
            }
            file.seek(SeekFrom::Start(patch.offset))?;
            file.write_all(&patch.bytes)?;
        }

        // Publish: new top ref into the inactive slot, then flip
        let mut header_bytes = [0u8; FILE_HEADER_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header_bytes)?;

        let mut header = FileHeader::decode(&header_bytes)?;
        let inactive = 1 - header.live_slot();
        header.top_refs[inactive] = self.new_top_ref;

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.encode())?;
        file.sync_data()?;

        header.flags ^= 1;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.encode())?;
        file.sync_data()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn changeset_roundtrip() -> crate::Result<()> {
        let changeset = Changeset {
            new_version: 7,
            new_top_ref: 4096,
            new_logical_size: 8192,
            patches: vec![
                Patch {
                    offset: 24,
                    bytes: vec![1, 2, 3],
                },
                Patch {
                    offset: 4096,
                    bytes: vec![0; 128],
                },
            ],
        };

        let bytes = changeset.encode_into_vec();
        let decoded = Changeset::decode_from(&mut &bytes[..])?;

        assert_eq!(changeset, decoded);

        Ok(())
    }

    #[test]
    fn changeset_empty_roundtrip() -> crate::Result<()> {
        let changeset = Changeset {
            new_version: 2,
            new_top_ref: 24,
            new_logical_size: 4096,
            patches: vec![],
        };

        let bytes = changeset.encode_into_vec();
        assert_eq!(changeset, Changeset::decode_from(&mut &bytes[..])?);

        Ok(())
    }
}
