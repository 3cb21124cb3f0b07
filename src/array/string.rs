// Copyright (c) 2024-present, tide-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! String and binary leaves
//!
//! Two leaf forms exist. The short form is a single node of fixed-stride
//! entries, used while no entry exceeds [`MAX_SHORT_STRING_SIZE`] bytes.
//! The long form composes an offsets array with a blob of concatenated
//! payloads. The forms are chosen per leaf; a leaf upgrades in place the
//! first time a long value arrives, without touching its siblings.

use crate::{
    alloc::{Mapping, Ref, SlabAlloc},
    array::{blob::ArrayBlob, Array, NodeKind, INITIAL_CAPACITY},
    node::{calc_byte_size, Header, WidthType, HEADER_SIZE, MAX_PAYLOAD_SIZE},
    Error,
};
use enum_dispatch::enum_dispatch;

/// Longest value a short-form leaf can hold
///
/// One byte of every stride slot encodes the entry length, so a 64-byte
/// stride carries at most 63 payload bytes.
pub const MAX_SHORT_STRING_SIZE: usize = 63;

/// Operations shared by both leaf forms
#[enum_dispatch]
pub trait StringLeafOps {
    fn ref_(&self) -> Ref;

    fn node_size(&self) -> usize;

    fn set(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: &[u8]) -> crate::Result<()>;

    fn insert(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: &[u8]) -> crate::Result<()>;

    fn erase(&mut self, alloc: &mut SlabAlloc, ndx: usize) -> crate::Result<()>;
}

/// A string leaf in whichever form it currently has
#[enum_dispatch(StringLeafOps)]
#[derive(Clone, Debug)]
pub enum StringLeaf {
    Short(ShortStringLeaf),
    Long(LongStringLeaf),
}

impl StringLeaf {
    pub fn attach(mapping: &Mapping, ref_: Ref) -> crate::Result<Self> {
        let header = mapping.node_header(ref_)?;

        if header.has_refs {
            Ok(Self::Long(LongStringLeaf::attach(mapping, ref_)?))
        } else {
            Ok(Self::Short(ShortStringLeaf::attach(mapping, ref_)?))
        }
    }

    /// True if `value` can go into this leaf without changing its form.
    pub fn fits(&self, value: &[u8]) -> bool {
        match self {
            Self::Short(_) => value.len() <= MAX_SHORT_STRING_SIZE,
            Self::Long(_) => true,
        }
    }

    pub fn get<'a>(&self, mapping: &'a Mapping, ndx: usize) -> &'a [u8] {
        match self {
            Self::Short(leaf) => leaf.get(mapping, ndx),
            Self::Long(leaf) => leaf.get(mapping, ndx),
        }
    }

    pub fn destroy(self, alloc: &mut SlabAlloc) -> crate::Result<()> {
        match self {
            Self::Short(leaf) => leaf.destroy(alloc),
            Self::Long(leaf) => leaf.destroy(alloc),
        }
    }

    /// Rewrites a short leaf into long form, preserving every entry.
    ///
    /// The old node is freed; the caller must store the new ref.
    pub fn upgrade(&mut self, alloc: &mut SlabAlloc) -> crate::Result<()> {
        let Self::Short(short) = self else {
            return Ok(());
        };

        let mut long = LongStringLeaf::create(alloc)?;
        for i in 0..short.node_size() {
            let value = short.get(alloc.mapping(), i).to_vec();
            long.insert(alloc, i, &value)?;
        }

        log::trace!(
            "Upgraded string leaf {} to long form ({} entries)",
            short.ref_(),
            short.node_size(),
        );

        alloc.free(short.ref_(), short.capacity);
        *self = Self::Long(long);

        Ok(())
    }
}

/// Short form: fixed-stride entries in a single node
///
/// Strides are powers of two up to 64. The last byte of each slot stores
/// `stride - 1 - len`, which doubles as the zero terminator for full-width
/// entries.
#[derive(Clone, Debug)]
pub struct ShortStringLeaf {
    ref_: Ref,
    size: usize,
    /// Entry stride in bytes; 0 while every entry is empty
    stride: u8,
    capacity: usize,
}

impl ShortStringLeaf {
    pub fn create(alloc: &mut SlabAlloc) -> crate::Result<Self> {
        let ref_ = alloc.alloc(INITIAL_CAPACITY)?;

        let header = Header {
            capacity: INITIAL_CAPACITY,
            is_inner: false,
            has_refs: false,
            context_flag: false,
            width_type: WidthType::Multiply,
            width: 0,
            size: 0,
        };

        let bytes = alloc.write_slice(ref_, INITIAL_CAPACITY);
        bytes.fill(0);
        bytes[..HEADER_SIZE].copy_from_slice(&header.encode());

        Ok(Self {
            ref_,
            size: 0,
            stride: 0,
            capacity: INITIAL_CAPACITY,
        })
    }

    pub fn attach(mapping: &Mapping, ref_: Ref) -> crate::Result<Self> {
        let header = mapping.node_header(ref_)?;

        if header.width_type != WidthType::Multiply || header.has_refs {
            return Err(Error::Corrupt("expected short string node"));
        }

        Ok(Self {
            ref_,
            size: header.size,
            stride: header.width,
            capacity: header.capacity,
        })
    }

    fn payload<'a>(&self, mapping: &'a Mapping) -> &'a [u8] {
        mapping.slice(self.ref_ + HEADER_SIZE as u64, self.capacity - HEADER_SIZE)
    }

    fn write_header(&self, alloc: &mut SlabAlloc) {
        let header = Header {
            capacity: self.capacity,
            is_inner: false,
            has_refs: false,
            context_flag: false,
            width_type: WidthType::Multiply,
            width: self.stride,
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

        let byte_size = calc_byte_size(WidthType::Multiply, self.size, self.stride);
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
        let byte_size = calc_byte_size(WidthType::Multiply, self.size, self.stride);
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

    /// Rewrites every entry at a wider stride.
    fn ensure_stride(&mut self, alloc: &mut SlabAlloc, value_len: usize) -> crate::Result<()> {
        let needed = stride_for(value_len);
        if needed <= self.stride {
            return Ok(());
        }

        let entries: Vec<Vec<u8>> = (0..self.size)
            .map(|i| self.get(alloc.mapping(), i).to_vec())
            .collect();

        self.ensure_capacity(
            alloc,
            calc_byte_size(WidthType::Multiply, self.size, needed),
        )?;
        self.stride = needed;
        self.write_header(alloc);

        let stride = usize::from(needed);
        let payload = alloc.write_slice(self.ref_ + HEADER_SIZE as u64, self.capacity - HEADER_SIZE);

        for (i, entry) in entries.iter().enumerate() {
            write_entry(&mut payload[i * stride..(i + 1) * stride], entry);
        }

        Ok(())
    }

    fn entry_slot<'a>(&self, alloc: &'a mut SlabAlloc, ndx: usize) -> &'a mut [u8] {
        let stride = usize::from(self.stride);
        let off = self.ref_ + HEADER_SIZE as u64 + (ndx * stride) as u64;
        alloc.write_slice(off, stride)
    }
}

impl ShortStringLeaf {
    pub fn get<'a>(&self, mapping: &'a Mapping, ndx: usize) -> &'a [u8] {
        debug_assert!(ndx < self.size);

        if self.stride == 0 {
            return &[];
        }

        let stride = usize::from(self.stride);
        let entry = &self.payload(mapping)[ndx * stride..(ndx + 1) * stride];
        let len = stride - 1 - usize::from(entry[stride - 1]);
        &entry[..len]
    }

    pub fn destroy(self, alloc: &mut SlabAlloc) -> crate::Result<()> {
        alloc.free(self.ref_, self.capacity);
        Ok(())
    }
}

impl StringLeafOps for ShortStringLeaf {
    fn ref_(&self) -> Ref {
        self.ref_
    }

    fn node_size(&self) -> usize {
        self.size
    }

    fn set(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: &[u8]) -> crate::Result<()> {
        debug_assert!(ndx < self.size);
        debug_assert!(value.len() <= MAX_SHORT_STRING_SIZE);

        self.copy_on_write(alloc)?;
        self.ensure_stride(alloc, value.len())?;

        if self.stride != 0 {
            write_entry(self.entry_slot(alloc, ndx), value);
        }
        Ok(())
    }

    fn insert(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: &[u8]) -> crate::Result<()> {
        debug_assert!(ndx <= self.size);
        debug_assert!(value.len() <= MAX_SHORT_STRING_SIZE);

        self.copy_on_write(alloc)?;
        self.ensure_stride(alloc, value.len())?;

        let stride = usize::from(self.stride);
        self.ensure_capacity(
            alloc,
            calc_byte_size(WidthType::Multiply, self.size + 1, self.stride),
        )?;

        if stride != 0 {
            let payload =
                alloc.write_slice(self.ref_ + HEADER_SIZE as u64, self.capacity - HEADER_SIZE);
            payload.copy_within(ndx * stride..self.size * stride, (ndx + 1) * stride);
            write_entry(&mut payload[ndx * stride..(ndx + 1) * stride], value);
        }

        self.size += 1;
        self.write_header(alloc);
        Ok(())
    }

    fn erase(&mut self, alloc: &mut SlabAlloc, ndx: usize) -> crate::Result<()> {
        debug_assert!(ndx < self.size);

        self.copy_on_write(alloc)?;

        let stride = usize::from(self.stride);
        if stride != 0 {
            let payload =
                alloc.write_slice(self.ref_ + HEADER_SIZE as u64, self.capacity - HEADER_SIZE);
            payload.copy_within((ndx + 1) * stride..self.size * stride, ndx * stride);
        }

        self.size -= 1;
        self.write_header(alloc);
        Ok(())
    }
}

/// Long form: a has-refs node holding an offsets array and a blob
///
/// Entry `k` occupies `offsets[k-1]..offsets[k]` of the blob; `offsets` is
/// nondecreasing and its last element equals the blob length.
#[derive(Clone, Debug)]
pub struct LongStringLeaf {
    top: Array,
    offsets: Array,
    blob: ArrayBlob,
}

impl LongStringLeaf {
    pub fn create(alloc: &mut SlabAlloc) -> crate::Result<Self> {
        let offsets = Array::create_empty(alloc, NodeKind::Normal, false)?;
        let blob = ArrayBlob::create_empty(alloc)?;

        let mut top = Array::create_empty(alloc, NodeKind::HasRefs, false)?;
        top.add(alloc, offsets.ref_() as i64)?;
        top.add(alloc, blob.ref_() as i64)?;

        Ok(Self { top, offsets, blob })
    }

    pub fn attach(mapping: &Mapping, ref_: Ref) -> crate::Result<Self> {
        let top = Array::attach(mapping, ref_)?;

        if !top.has_refs() || top.size() != 2 {
            return Err(Error::Corrupt("malformed long string node"));
        }

        let offsets = Array::attach(mapping, top.get_as_ref(mapping, 0))?;
        let blob = ArrayBlob::attach(mapping, top.get_as_ref(mapping, 1))?;

        if offsets.size() > 0
            && offsets.back(mapping) as usize != blob.size()
        {
            return Err(Error::Corrupt("string offsets do not match blob length"));
        }

        Ok(Self { top, offsets, blob })
    }

    pub fn get<'a>(&self, mapping: &'a Mapping, ndx: usize) -> &'a [u8] {
        debug_assert!(ndx < self.node_size());

        let start = self.start(mapping, ndx);
        let end = self.offsets.get(mapping, ndx) as usize;
        self.blob.get(mapping, start, end)
    }

    pub fn destroy(self, alloc: &mut SlabAlloc) -> crate::Result<()> {
        self.top.destroy_deep(alloc)
    }

    fn start(&self, mapping: &Mapping, ndx: usize) -> usize {
        if ndx == 0 {
            0
        } else {
            self.offsets.get(mapping, ndx - 1) as usize
        }
    }

    /// Re-points the top node at children that moved under copy-on-write.
    fn update_children(&mut self, alloc: &mut SlabAlloc) -> crate::Result<()> {
        if self.top.get_as_ref(alloc.mapping(), 0) != self.offsets.ref_() {
            let new_ref = self.offsets.ref_() as i64;
            self.top.set(alloc, 0, new_ref)?;
        }
        if self.top.get_as_ref(alloc.mapping(), 1) != self.blob.ref_() {
            let new_ref = self.blob.ref_() as i64;
            self.top.set(alloc, 1, new_ref)?;
        }
        Ok(())
    }
}

impl StringLeafOps for LongStringLeaf {
    fn ref_(&self) -> Ref {
        self.top.ref_()
    }

    fn node_size(&self) -> usize {
        self.offsets.size()
    }

    fn set(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: &[u8]) -> crate::Result<()> {
        debug_assert!(ndx < self.node_size());

        let start = self.start(alloc.mapping(), ndx);
        let end = self.offsets.get(alloc.mapping(), ndx) as usize;

        self.blob.replace(alloc, start, end, value)?;

        let delta = value.len() as i64 - (end - start) as i64;
        if delta != 0 {
            self.offsets
                .adjust_range(alloc, ndx, self.offsets.size(), delta)?;
        }

        self.update_children(alloc)
    }

    fn insert(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: &[u8]) -> crate::Result<()> {
        debug_assert!(ndx <= self.node_size());

        let start = self.start(alloc.mapping(), ndx);

        self.blob.insert(alloc, start, value)?;
        self.offsets
            .insert(alloc, ndx, (start + value.len()) as i64)?;
        self.offsets
            .adjust_range(alloc, ndx + 1, self.offsets.size(), value.len() as i64)?;

        self.update_children(alloc)
    }

    fn erase(&mut self, alloc: &mut SlabAlloc, ndx: usize) -> crate::Result<()> {
        debug_assert!(ndx < self.node_size());

        let start = self.start(alloc.mapping(), ndx);
        let end = self.offsets.get(alloc.mapping(), ndx) as usize;

        self.blob.erase_range(alloc, start, end)?;
        self.offsets.erase(alloc, ndx)?;
        self.offsets
            .adjust_range(alloc, ndx, self.offsets.size(), -((end - start) as i64))?;

        self.update_children(alloc)
    }
}

/// Smallest legal stride (power of two, one length byte included) for a
/// value of `len` bytes.
fn stride_for(len: usize) -> u8 {
    debug_assert!(len <= MAX_SHORT_STRING_SIZE);

    if len == 0 {
        return 0;
    }

    let mut stride = 1usize;
    while stride < len + 1 {
        stride *= 2;
    }
    stride as u8
}

fn write_entry(slot: &mut [u8], value: &[u8]) {
    let stride = slot.len();
    slot[..value.len()].copy_from_slice(value);
    slot[value.len()..].fill(0);
    slot[stride - 1] = (stride - 1 - value.len()) as u8;
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
    fn short_leaf_roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut alloc = open_alloc(&dir)?;

        let mut leaf = ShortStringLeaf::create(&mut alloc)?;
        leaf.insert(&mut alloc, 0, b"banana")?;
        leaf.insert(&mut alloc, 0, b"apple")?;
        leaf.insert(&mut alloc, 2, b"cherry")?;

        assert_eq!(3, leaf.node_size());
        assert_eq!(b"apple", leaf.get(alloc.mapping(), 0));
        assert_eq!(b"banana", leaf.get(alloc.mapping(), 1));
        assert_eq!(b"cherry", leaf.get(alloc.mapping(), 2));

        leaf.set(&mut alloc, 1, b"blueberry")?;
        assert_eq!(b"blueberry", leaf.get(alloc.mapping(), 1));

        leaf.erase(&mut alloc, 0)?;
        assert_eq!(b"blueberry", leaf.get(alloc.mapping(), 0));

        Ok(())
    }

    #[test]
    fn short_leaf_stride_grows() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut alloc = open_alloc(&dir)?;

        let mut leaf = ShortStringLeaf::create(&mut alloc)?;
        leaf.insert(&mut alloc, 0, b"")?;
        assert_eq!(b"", leaf.get(alloc.mapping(), 0));

        // Empty entries occupy no payload until a wider value arrives
        leaf.insert(&mut alloc, 1, b"0123456789")?;

        assert_eq!(b"", leaf.get(alloc.mapping(), 0));
        assert_eq!(b"0123456789", leaf.get(alloc.mapping(), 1));

        let max = [b'x'; MAX_SHORT_STRING_SIZE];
        leaf.insert(&mut alloc, 2, &max)?;
        assert_eq!(&max[..], leaf.get(alloc.mapping(), 2));
        assert_eq!(b"0123456789", leaf.get(alloc.mapping(), 1));

        Ok(())
    }

    #[test]
    fn long_leaf_roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut alloc = open_alloc(&dir)?;

        let mut leaf = LongStringLeaf::create(&mut alloc)?;
        let big = vec![b'a'; 200];

        leaf.insert(&mut alloc, 0, &big)?;
        leaf.insert(&mut alloc, 1, b"tiny")?;
        leaf.insert(&mut alloc, 1, b"middle")?;

        assert_eq!(&big[..], leaf.get(alloc.mapping(), 0));
        assert_eq!(b"middle", leaf.get(alloc.mapping(), 1));
        assert_eq!(b"tiny", leaf.get(alloc.mapping(), 2));

        leaf.set(&mut alloc, 1, b"?")?;
        assert_eq!(b"?", leaf.get(alloc.mapping(), 1));
        assert_eq!(b"tiny", leaf.get(alloc.mapping(), 2));

        leaf.erase(&mut alloc, 0)?;
        assert_eq!(b"?", leaf.get(alloc.mapping(), 0));
        assert_eq!(2, leaf.node_size());

        Ok(())
    }

    #[test]
    fn leaf_upgrade_preserves_entries() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut alloc = open_alloc(&dir)?;

        let mut leaf = StringLeaf::Short(ShortStringLeaf::create(&mut alloc)?);
        for i in 0..10 {
            leaf.insert(&mut alloc, i, b"short")?;
        }

        let big = vec![b'z'; 200];
        assert!(!leaf.fits(&big));

        leaf.upgrade(&mut alloc)?;
        assert!(matches!(leaf, StringLeaf::Long(_)));

        leaf.insert(&mut alloc, 10, &big)?;

        for i in 0..10 {
            assert_eq!(b"short", leaf.get(alloc.mapping(), i));
        }
        assert_eq!(&big[..], leaf.get(alloc.mapping(), 10));

        Ok(())
    }
}
