// Copyright (c) 2024-present, tide-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Raw byte sequence leaf
//!
//! A blob is a node whose payload is an uninterpreted byte run (one
//! element per byte). All mutation funnels through [`ArrayBlob::replace`],
//! which splices a byte range the way the long string leaf and binary
//! columns need.

use crate::{
    alloc::{Mapping, Ref, SlabAlloc},
    array::INITIAL_CAPACITY,
    node::{calc_byte_size, Header, WidthType, HEADER_SIZE, MAX_PAYLOAD_SIZE},
    Error,
};

/// Accessor for a byte-sequence node
#[derive(Clone, Debug)]
pub struct ArrayBlob {
    ref_: Ref,
    size: usize,
    capacity: usize,
}

impl ArrayBlob {
    pub fn create_empty(alloc: &mut SlabAlloc) -> crate::Result<Self> {
        let ref_ = alloc.alloc(INITIAL_CAPACITY)?;

        let header = Header {
            capacity: INITIAL_CAPACITY,
            is_inner: false,
            has_refs: false,
            context_flag: false,
            width_type: WidthType::Ignore,
            width: 0,
            size: 0,
        };

        let bytes = alloc.write_slice(ref_, INITIAL_CAPACITY);
        bytes.fill(0);
        bytes[..HEADER_SIZE].copy_from_slice(&header.encode());

        Ok(Self {
            ref_,
            size: 0,
            capacity: INITIAL_CAPACITY,
        })
    }

    pub fn attach(mapping: &Mapping, ref_: Ref) -> crate::Result<Self> {
        let header = mapping.node_header(ref_)?;

        if header.width_type != WidthType::Ignore {
            return Err(Error::Corrupt("expected byte-sequence node"));
        }

        Ok(Self {
            ref_,
            size: header.size,
            capacity: header.capacity,
        })
    }

    pub fn ref_(&self) -> Ref {
        self.ref_
    }

    /// Length in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// The whole payload.
    pub fn bytes<'a>(&self, mapping: &'a Mapping) -> &'a [u8] {
        mapping.slice(self.ref_ + HEADER_SIZE as u64, self.size)
    }

    /// The byte range `[start, end)`.
    pub fn get<'a>(&self, mapping: &'a Mapping, start: usize, end: usize) -> &'a [u8] {
        debug_assert!(start <= end && end <= self.size);
        &self.bytes(mapping)[start..end]
    }

    pub fn add(&mut self, alloc: &mut SlabAlloc, data: &[u8]) -> crate::Result<()> {
        self.replace(alloc, self.size, self.size, data)
    }

    pub fn insert(&mut self, alloc: &mut SlabAlloc, pos: usize, data: &[u8]) -> crate::Result<()> {
        self.replace(alloc, pos, pos, data)
    }

    pub fn erase_range(&mut self, alloc: &mut SlabAlloc, start: usize, end: usize) -> crate::Result<()> {
        self.replace(alloc, start, end, &[])
    }

    pub fn clear(&mut self, alloc: &mut SlabAlloc) -> crate::Result<()> {
        self.replace(alloc, 0, self.size, &[])
    }

    /// Splices the byte range `[start, end)` to hold `data`, shifting the
    /// tail and reallocating as needed.
    pub fn replace(
        &mut self,
        alloc: &mut SlabAlloc,
        start: usize,
        end: usize,
        data: &[u8],
    ) -> crate::Result<()> {
        debug_assert!(start <= end);
        debug_assert!(end <= self.size);

        let gap = end - start;
        let new_size = self.size - gap + data.len();

        if calc_byte_size(WidthType::Ignore, new_size, 0) > MAX_PAYLOAD_SIZE {
            return Err(Error::Logic("blob exceeds maximum node payload"));
        }

        self.copy_on_write(alloc)?;
        self.ensure_capacity(alloc, calc_byte_size(WidthType::Ignore, new_size, 0))?;

        let payload = alloc.write_slice(self.ref_ + HEADER_SIZE as u64, self.capacity - HEADER_SIZE);

        // Move the tail into place, unless we splice at the very end
        if end != self.size && gap != data.len() {
            payload.copy_within(end..self.size, start + data.len());
        }
        payload[start..start + data.len()].copy_from_slice(data);

        self.size = new_size;
        self.write_header(alloc);

        Ok(())
    }

    pub fn destroy(self, alloc: &mut SlabAlloc) {
        alloc.free(self.ref_, self.capacity);
    }

    fn write_header(&self, alloc: &mut SlabAlloc) {
        let header = Header {
            capacity: self.capacity,
            is_inner: false,
            has_refs: false,
            context_flag: false,
            width_type: WidthType::Ignore,
            width: 0,
            size: self.size,
        };
        alloc
            .write_slice(self.ref_, HEADER_SIZE)
            .copy_from_slice(&header.encode());
    }

    fn copy_on_write(&mut self, alloc: &mut SlabAlloc) -> crate::Result<()> {
        if !alloc.is_read_only(self.ref_) {
            return Ok(());
        }

        let byte_size = calc_byte_size(WidthType::Ignore, self.size, 0);
        let bytes = alloc.mapping().slice(self.ref_, byte_size).to_vec();

        let capacity = (byte_size + 64)
            .clamp(INITIAL_CAPACITY, MAX_PAYLOAD_SIZE)
            .max(byte_size);
        let new_ref = alloc.alloc(capacity)?;

        let target = alloc.write_slice(new_ref, capacity);
        target.fill(0);
        target[..byte_size].copy_from_slice(&bytes);

        alloc.free(self.ref_, self.capacity);

        self.ref_ = new_ref;
        self.capacity = capacity;
        self.write_header(alloc);

        Ok(())
    }

    fn ensure_capacity(&mut self, alloc: &mut SlabAlloc, needed: usize) -> crate::Result<()> {
        if needed <= self.capacity {
            return Ok(());
        }

        let new_capacity = needed
            .max(self.capacity * 2)
            .min(MAX_PAYLOAD_SIZE)
            .max(needed);
        let byte_size = calc_byte_size(WidthType::Ignore, self.size, 0);
        let bytes = alloc.mapping().slice(self.ref_, byte_size).to_vec();

        let new_ref = alloc.alloc(new_capacity)?;
        let target = alloc.write_slice(new_ref, new_capacity);
        target.fill(0);
        target[..byte_size].copy_from_slice(&bytes);

        alloc.free(self.ref_, self.capacity);

        self.ref_ = new_ref;
        self.capacity = new_capacity;
        self.write_header(alloc);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use test_log::test;

    fn open_alloc(dir: &tempfile::TempDir) -> crate::Result<SlabAlloc> {
        let mut alloc = SlabAlloc::open(&Config::new(dir.path().join("test.tdb")))?;
        alloc.begin_transaction(1, 0);
        Ok(alloc)
    }

    #[test]
    fn blob_add_and_get() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut alloc = open_alloc(&dir)?;

        let mut blob = ArrayBlob::create_empty(&mut alloc)?;
        blob.add(&mut alloc, b"hello, ")?;
        blob.add(&mut alloc, b"world")?;

        assert_eq!(b"hello, world", blob.bytes(alloc.mapping()));
        assert_eq!(b"world", blob.get(alloc.mapping(), 7, 12));

        Ok(())
    }

    #[test]
    fn blob_replace_grows_and_shrinks() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut alloc = open_alloc(&dir)?;

        let mut blob = ArrayBlob::create_empty(&mut alloc)?;
        blob.add(&mut alloc, b"abcdef")?;

        blob.replace(&mut alloc, 2, 4, b"XYZW")?;
        assert_eq!(b"abXYZWef", blob.bytes(alloc.mapping()));

        blob.replace(&mut alloc, 0, 6, b"")?;
        assert_eq!(b"ef", blob.bytes(alloc.mapping()));

        blob.erase_range(&mut alloc, 0, 2)?;
        assert!(blob.is_empty());

        Ok(())
    }

    #[test]
    fn blob_large_payload_reallocates() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut alloc = open_alloc(&dir)?;

        let mut blob = ArrayBlob::create_empty(&mut alloc)?;
        let big = vec![0xAB_u8; 10_000];
        blob.add(&mut alloc, &big)?;

        assert_eq!(10_000, blob.size());
        assert_eq!(&big[..], blob.bytes(alloc.mapping()));

        Ok(())
    }
}
