// Copyright (c) 2024-present, tide-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Packed-bit integer arrays
//!
//! The [`Array`] is the workhorse leaf: a sequence of signed integers
//! packed at the smallest power-of-two bit width that losslessly holds
//! every current element. Inserting a value that does not fit triggers a
//! width upgrade, which rewrites the payload.
//!
//! An `Array` is a transient accessor over a ref. Mutations go through
//! copy-on-write: a node inside the committed file image is cloned into a
//! fresh allocation first, and the accessor's ref changes. Whoever holds
//! the parent slot must write the new ref back after any mutating call.

pub mod blob;
pub mod string;

use crate::{
    alloc::{Mapping, Ref, SlabAlloc},
    binary_search::partition_point,
    node::{calc_byte_size, Header, WidthType, HEADER_SIZE, MAX_PAYLOAD_SIZE},
    Error,
};

/// The total size in bytes (including the header) of a new empty node
pub(crate) const INITIAL_CAPACITY: usize = 128;

/// What kind of node an array is created as
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NodeKind {
    /// Plain sequence of integers
    Normal,

    /// Slots hold refs to subarrays, or odd tagged integers
    HasRefs,

    /// Main array of a B+-tree inner node (implies refs)
    Inner,
}

/// Search condition for [`Array::find_first_cond`]
#[derive(Copy, Clone, Debug)]
pub enum Cond {
    Equal(i64),
    NotEqual(i64),
    Less(i64),
    Greater(i64),
    /// Inclusive range
    Between(i64, i64),
}

impl Cond {
    fn matches(self, v: i64) -> bool {
        match self {
            Self::Equal(t) => v == t,
            Self::NotEqual(t) => v != t,
            Self::Less(t) => v < t,
            Self::Greater(t) => v > t,
            Self::Between(lo, hi) => v >= lo && v <= hi,
        }
    }
}

/// Accessor for a packed-bit integer node
#[derive(Clone, Debug)]
pub struct Array {
    ref_: Ref,
    size: usize,
    width: u8,
    capacity: usize,
    is_inner: bool,
    has_refs: bool,
    context_flag: bool,
}

impl Array {
    /// Creates a new array node holding `size` copies of `value`.
    pub fn create(
        alloc: &mut SlabAlloc,
        kind: NodeKind,
        context_flag: bool,
        size: usize,
        value: i64,
    ) -> crate::Result<Self> {
        let width = if value == 0 { 0 } else { bit_width(value) };
        let byte_size = calc_byte_size(WidthType::Bits, size, width);
        let capacity = byte_size.max(INITIAL_CAPACITY);

        let ref_ = alloc.alloc(capacity)?;

        let header = Header {
            capacity,
            is_inner: kind == NodeKind::Inner,
            has_refs: kind != NodeKind::Normal,
            context_flag,
            width_type: WidthType::Bits,
            width,
            size,
        };

        let bytes = alloc.write_slice(ref_, capacity);
        bytes.fill(0);
        bytes[..HEADER_SIZE].copy_from_slice(&header.encode());

        let mut array = Self {
            ref_,
            size,
            width,
            capacity,
            is_inner: header.is_inner,
            has_refs: header.has_refs,
            context_flag,
        };

        if value != 0 {
            let data = array.payload_mut(alloc);
            for i in 0..size {
                set_direct(data, width, i, value);
            }
        }

        Ok(array)
    }

    /// Creates a new empty array node.
    pub fn create_empty(
        alloc: &mut SlabAlloc,
        kind: NodeKind,
        context_flag: bool,
    ) -> crate::Result<Self> {
        Self::create(alloc, kind, context_flag, 0, 0)
    }

    /// Attaches an accessor to the node at `ref_`.
    pub fn attach(mapping: &Mapping, ref_: Ref) -> crate::Result<Self> {
        let header = mapping.node_header(ref_)?;

        if header.width_type != WidthType::Bits {
            return Err(Error::Corrupt("expected packed-bit node"));
        }

        Ok(Self {
            ref_,
            size: header.size,
            width: header.width,
            capacity: header.capacity,
            is_inner: header.is_inner,
            has_refs: header.has_refs,
            context_flag: header.context_flag,
        })
    }

    pub fn ref_(&self) -> Ref {
        self.ref_
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn is_inner(&self) -> bool {
        self.is_inner
    }

    pub fn has_refs(&self) -> bool {
        self.has_refs
    }

    pub fn context_flag(&self) -> bool {
        self.context_flag
    }

    pub(crate) fn width(&self) -> u8 {
        self.width
    }

    /// Bytes in use, header included.
    pub fn byte_size(&self) -> usize {
        calc_byte_size(WidthType::Bits, self.size, self.width)
    }

    fn payload<'a>(&self, mapping: &'a Mapping) -> &'a [u8] {
        mapping.slice(self.ref_ + HEADER_SIZE as u64, self.capacity - HEADER_SIZE)
    }

    fn payload_mut<'a>(&self, alloc: &'a mut SlabAlloc) -> &'a mut [u8] {
        alloc.write_slice(self.ref_ + HEADER_SIZE as u64, self.capacity - HEADER_SIZE)
    }

    pub fn get(&self, mapping: &Mapping, ndx: usize) -> i64 {
        debug_assert!(ndx < self.size);
        get_direct(self.payload(mapping), self.width, ndx)
    }

    pub fn back(&self, mapping: &Mapping) -> i64 {
        debug_assert!(self.size > 0);
        self.get(mapping, self.size - 1)
    }

    /// Reads a slot that holds either a ref or a tagged integer; returns
    /// 0 for tagged values.
    pub fn get_as_ref(&self, mapping: &Mapping, ndx: usize) -> Ref {
        debug_assert!(self.has_refs);
        let v = self.get(mapping, ndx);
        if v & 1 == 1 {
            0
        } else {
            v as Ref
        }
    }

    /// Reads a tagged integer slot: `(x << 1) | 1` decodes to `x`.
    pub fn get_tagged(&self, mapping: &Mapping, ndx: usize) -> u64 {
        let v = self.get(mapping, ndx);
        debug_assert!(v & 1 == 1, "slot does not hold a tagged value");
        (v as u64) >> 1
    }

    pub fn set_tagged(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: u64) -> crate::Result<()> {
        debug_assert!(value < (1 << 62));
        self.set(alloc, ndx, ((value << 1) | 1) as i64)
    }

    pub fn set(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: i64) -> crate::Result<()> {
        debug_assert!(ndx < self.size);

        self.copy_on_write(alloc)?;
        self.ensure_width(alloc, value)?;

        set_direct(self.payload_mut(alloc), self.width, ndx, value);
        Ok(())
    }

    pub fn add(&mut self, alloc: &mut SlabAlloc, value: i64) -> crate::Result<()> {
        self.insert(alloc, self.size, value)
    }

    pub fn insert(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: i64) -> crate::Result<()> {
        debug_assert!(ndx <= self.size);

        self.copy_on_write(alloc)?;
        self.ensure_width(alloc, value)?;

        let needed = calc_byte_size(WidthType::Bits, self.size + 1, self.width);
        self.ensure_capacity(alloc, needed)?;

        let width = self.width;
        let data = self.payload_mut(alloc);

        // Shift tail one slot to the right
        for i in (ndx..self.size).rev() {
            let v = get_direct(data, width, i);
            set_direct(data, width, i + 1, v);
        }
        set_direct(data, width, ndx, value);

        self.set_size(alloc, self.size + 1);
        Ok(())
    }

    pub fn erase(&mut self, alloc: &mut SlabAlloc, ndx: usize) -> crate::Result<()> {
        debug_assert!(ndx < self.size);

        self.copy_on_write(alloc)?;

        let width = self.width;
        let data = self.payload_mut(alloc);

        for i in ndx..self.size - 1 {
            let v = get_direct(data, width, i + 1);
            set_direct(data, width, i, v);
        }

        self.set_size(alloc, self.size - 1);
        Ok(())
    }

    pub fn truncate(&mut self, alloc: &mut SlabAlloc, new_size: usize) -> crate::Result<()> {
        debug_assert!(new_size <= self.size);

        self.copy_on_write(alloc)?;
        self.set_size(alloc, new_size);
        Ok(())
    }

    /// Adds `diff` to every element in `[from, to)`.
    pub fn adjust_range(
        &mut self,
        alloc: &mut SlabAlloc,
        from: usize,
        to: usize,
        diff: i64,
    ) -> crate::Result<()> {
        debug_assert!(to <= self.size);

        for i in from..to {
            let v = self.get(alloc.mapping(), i);
            self.set(alloc, i, v + diff)?;
        }
        Ok(())
    }

    pub fn adjust(&mut self, alloc: &mut SlabAlloc, ndx: usize, diff: i64) -> crate::Result<()> {
        let v = self.get(alloc.mapping(), ndx);
        self.set(alloc, ndx, v + diff)
    }

    /// Widens the payload so that `value` fits without a later rewrite.
    pub fn ensure_minimum_width(&mut self, alloc: &mut SlabAlloc, value: i64) -> crate::Result<()> {
        self.copy_on_write(alloc)?;
        self.ensure_width(alloc, value)
    }

    pub fn set_context_flag(&mut self, alloc: &mut SlabAlloc, value: bool) -> crate::Result<()> {
        self.copy_on_write(alloc)?;
        self.context_flag = value;
        self.write_header(alloc);
        Ok(())
    }

    /// Forces the node out of the committed image so callers may write its
    /// payload directly. Used by the hash index's packed bucket slots.
    pub(crate) fn make_writable(&mut self, alloc: &mut SlabAlloc) -> crate::Result<()> {
        self.copy_on_write(alloc)
    }

    /// Frees this node only.
    pub fn destroy(self, alloc: &mut SlabAlloc) {
        alloc.free(self.ref_, self.capacity);
    }

    /// Frees this node and, for ref-bearing nodes, every node reachable
    /// from its slots.
    pub fn destroy_deep(self, alloc: &mut SlabAlloc) -> crate::Result<()> {
        destroy_deep_ref(alloc, self.ref_)
    }

    /// Deep-copies the subtree rooted at `ref_`, returning the ref of the
    /// copy. Child refs are re-targeted to the copied children.
    pub fn clone_deep(alloc: &mut SlabAlloc, ref_: Ref) -> crate::Result<Ref> {
        let header = alloc.mapping().node_header(ref_)?;
        let byte_size = header.byte_size();

        let bytes = alloc.mapping().slice(ref_, byte_size).to_vec();

        let new_ref = alloc.alloc(byte_size.max(INITIAL_CAPACITY))?;
        let capacity = byte_size.max(INITIAL_CAPACITY);

        let target = alloc.write_slice(new_ref, capacity);
        target.fill(0);
        target[..byte_size].copy_from_slice(&bytes);

        let mut new_header = header;
        new_header.capacity = capacity;
        alloc.write_slice(new_ref, HEADER_SIZE)[..].copy_from_slice(&new_header.encode());

        if header.has_refs {
            let mut copy = Self::attach(alloc.mapping(), new_ref)?;
            for i in 0..copy.size() {
                let child = copy.get_as_ref(alloc.mapping(), i);
                if child != 0 {
                    let new_child = Self::clone_deep(alloc, child)?;
                    copy.set(alloc, i, new_child as i64)?;
                }
            }
            // Re-targeting child refs may have widened (and moved) the copy
            return Ok(copy.ref_());
        }

        Ok(new_ref)
    }

    /* Searches */

    /// First index whose element is `>= value`; requires a sorted array.
    pub fn lower_bound(&self, mapping: &Mapping, value: i64) -> usize {
        let data = self.payload(mapping);
        partition_point(self.size, |i| get_direct(data, self.width, i) < value)
    }

    /// First index whose element is `> value`; requires a sorted array.
    pub fn upper_bound(&self, mapping: &Mapping, value: i64) -> usize {
        let data = self.payload(mapping);
        partition_point(self.size, |i| get_direct(data, self.width, i) <= value)
    }

    /// First index in `[begin, end)` holding exactly `value`; the array
    /// does not need to be sorted.
    pub fn find_first(&self, mapping: &Mapping, value: i64, begin: usize, end: usize) -> Option<usize> {
        self.find_first_cond(mapping, Cond::Equal(value), begin, end)
    }

    pub fn find_first_cond(
        &self,
        mapping: &Mapping,
        cond: Cond,
        begin: usize,
        end: usize,
    ) -> Option<usize> {
        let end = end.min(self.size);
        let data = self.payload(mapping);

        (begin..end).find(|&i| cond.matches(get_direct(data, self.width, i)))
    }

    /// Collects every index in `[begin, end)` holding `value`.
    pub fn find_all(
        &self,
        mapping: &Mapping,
        result: &mut Vec<usize>,
        value: i64,
        begin: usize,
        end: usize,
    ) {
        let end = end.min(self.size);
        let data = self.payload(mapping);

        for i in begin..end {
            if get_direct(data, self.width, i) == value {
                result.push(i);
            }
        }
    }

    /* Internals */

    fn write_header(&self, alloc: &mut SlabAlloc) {
        let header = Header {
            capacity: self.capacity,
            is_inner: self.is_inner,
            has_refs: self.has_refs,
            context_flag: self.context_flag,
            width_type: WidthType::Bits,
            width: self.width,
            size: self.size,
        };
        alloc
            .write_slice(self.ref_, HEADER_SIZE)
            .copy_from_slice(&header.encode());
    }

    fn set_size(&mut self, alloc: &mut SlabAlloc, new_size: usize) {
        self.size = new_size;
        self.write_header(alloc);
    }

    /// Clones the node out of the committed file image, if needed.
    ///
    /// Afterwards the node is writable in place and `ref_` points at the
    /// writable copy.
    fn copy_on_write(&mut self, alloc: &mut SlabAlloc) -> crate::Result<()> {
        if !alloc.is_read_only(self.ref_) {
            return Ok(());
        }

        let byte_size = self.byte_size();
        let bytes = alloc.mapping().slice(self.ref_, byte_size).to_vec();

        // A little headroom, so a clone-then-insert does not realloc again
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

    /// Reallocates the node if `needed` bytes (header included) exceed its
    /// capacity.
    fn ensure_capacity(&mut self, alloc: &mut SlabAlloc, needed: usize) -> crate::Result<()> {
        if needed <= self.capacity {
            return Ok(());
        }
        if needed > MAX_PAYLOAD_SIZE {
            return Err(Error::Logic("node payload limit exceeded"));
        }

        let new_capacity = needed
            .max(self.capacity * 2)
            .min(MAX_PAYLOAD_SIZE)
            .max(needed);
        let byte_size = self.byte_size();
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

    /// Rewrites the payload at a wider width if `value` does not fit.
    fn ensure_width(&mut self, alloc: &mut SlabAlloc, value: i64) -> crate::Result<()> {
        let needed = bit_width(value);
        if needed <= self.width {
            return Ok(());
        }

        let values: Vec<i64> = {
            let data = self.payload(alloc.mapping());
            (0..self.size).map(|i| get_direct(data, self.width, i)).collect()
        };

        let needed_bytes = calc_byte_size(WidthType::Bits, self.size, needed);
        self.ensure_capacity(alloc, needed_bytes)?;

        self.width = needed;
        self.write_header(alloc);

        let data = self.payload_mut(alloc);
        for (i, v) in values.iter().enumerate() {
            set_direct(data, needed, i, *v);
        }

        Ok(())
    }
}

/// Recursively frees the subtree rooted at `ref_`.
pub fn destroy_deep_ref(alloc: &mut SlabAlloc, ref_: Ref) -> crate::Result<()> {
    let header = alloc.mapping().node_header(ref_)?;

    if header.has_refs {
        let array = Array::attach(alloc.mapping(), ref_)?;
        for i in 0..array.size() {
            let child = array.get_as_ref(alloc.mapping(), i);
            if child != 0 {
                destroy_deep_ref(alloc, child)?;
            }
        }
    }

    alloc.free(ref_, header.capacity);
    Ok(())
}

/// Smallest power-of-two bit width that losslessly holds `value`.
///
/// Widths up to 4 bits hold small unsigned values; 8 bits and up are
/// signed two's complement.
pub(crate) fn bit_width(value: i64) -> u8 {
    if (0..2).contains(&value) {
        return if value == 0 { 0 } else { 1 };
    }
    if (0..4).contains(&value) {
        return 2;
    }
    if (0..16).contains(&value) {
        return 4;
    }
    if (-0x80..0x80).contains(&value) {
        return 8;
    }
    if (-0x8000..0x8000).contains(&value) {
        return 16;
    }
    if (-0x8000_0000..0x8000_0000).contains(&value) {
        return 32;
    }
    64
}

/// Reads element `ndx` of a packed payload at the given bit width.
pub(crate) fn get_direct(data: &[u8], width: u8, ndx: usize) -> i64 {
    match width {
        0 => 0,
        1 => i64::from((data[ndx >> 3] >> (ndx & 7)) & 1),
        2 => i64::from((data[ndx >> 2] >> ((ndx & 3) << 1)) & 3),
        4 => i64::from((data[ndx >> 1] >> ((ndx & 1) << 2)) & 15),
        8 => i64::from(data[ndx] as i8),
        16 => {
            let off = ndx * 2;
            i64::from(i16::from_le_bytes([data[off], data[off + 1]]))
        }
        32 => {
            let off = ndx * 4;
            i64::from(i32::from_le_bytes([
                data[off],
                data[off + 1],
                data[off + 2],
                data[off + 3],
            ]))
        }
        64 => {
            let off = ndx * 8;
            i64::from_le_bytes(data[off..off + 8].try_into().expect("slice length is 8"))
        }
        _ => unreachable!("invalid element width"),
    }
}

/// Writes element `ndx` of a packed payload at the given bit width.
pub(crate) fn set_direct(data: &mut [u8], width: u8, ndx: usize, value: i64) {
    match width {
        0 => debug_assert_eq!(0, value),
        1 => {
            debug_assert!((0..2).contains(&value));
            let byte = &mut data[ndx >> 3];
            let shift = ndx & 7;
            *byte = (*byte & !(1 << shift)) | ((value as u8) << shift);
        }
        2 => {
            debug_assert!((0..4).contains(&value));
            let byte = &mut data[ndx >> 2];
            let shift = (ndx & 3) << 1;
            *byte = (*byte & !(3 << shift)) | ((value as u8) << shift);
        }
        4 => {
            debug_assert!((0..16).contains(&value));
            let byte = &mut data[ndx >> 1];
            let shift = (ndx & 1) << 2;
            *byte = (*byte & !(15 << shift)) | ((value as u8) << shift);
        }
        8 => data[ndx] = value as i8 as u8,
        16 => {
            let off = ndx * 2;
            data[off..off + 2].copy_from_slice(&(value as i16).to_le_bytes());
        }
        32 => {
            let off = ndx * 4;
            data[off..off + 4].copy_from_slice(&(value as i32).to_le_bytes());
        }
        64 => {
            let off = ndx * 8;
            data[off..off + 8].copy_from_slice(&value.to_le_bytes());
        }
        _ => unreachable!("invalid element width"),
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
    fn array_add_get() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut alloc = open_alloc(&dir)?;

        let mut arr = Array::create_empty(&mut alloc, NodeKind::Normal, false)?;
        for i in 0..100 {
            arr.add(&mut alloc, i)?;
        }

        assert_eq!(100, arr.size());
        for i in 0..100 {
            assert_eq!(i as i64, arr.get(alloc.mapping(), i));
        }
        assert_eq!(99, arr.back(alloc.mapping()));

        Ok(())
    }

    #[test]
    fn array_width_upgrades_preserve_values() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut alloc = open_alloc(&dir)?;

        let mut arr = Array::create_empty(&mut alloc, NodeKind::Normal, false)?;

        // One value per width class: 0, 1, 2, 4, 8, 16, 32, 64 bits
        let probes = [0i64, 1, 3, 15, -100, 30_000, 2_000_000_000, i64::MIN];

        for (i, &v) in probes.iter().enumerate() {
            arr.add(&mut alloc, v)?;
            assert_eq!(bit_width(v).max(arr.width()), arr.width());

            // All previously added values survive the rewrite
            for (j, &earlier) in probes[..=i].iter().enumerate() {
                assert_eq!(earlier, arr.get(alloc.mapping(), j));
            }
        }

        assert_eq!(64, arr.width());

        Ok(())
    }

    #[test]
    fn array_insert_erase_shifts() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut alloc = open_alloc(&dir)?;

        let mut arr = Array::create_empty(&mut alloc, NodeKind::Normal, false)?;
        arr.add(&mut alloc, 10)?;
        arr.add(&mut alloc, 30)?;
        arr.insert(&mut alloc, 1, 20)?;

        assert_eq!(20, arr.get(alloc.mapping(), 1));
        assert_eq!(30, arr.get(alloc.mapping(), 2));

        arr.erase(&mut alloc, 0)?;
        assert_eq!(2, arr.size());
        assert_eq!(20, arr.get(alloc.mapping(), 0));

        Ok(())
    }

    #[test]
    fn array_copy_on_write_moves_node() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut alloc = open_alloc(&dir)?;

        let mut arr = Array::create_empty(&mut alloc, NodeKind::Normal, false)?;
        arr.add(&mut alloc, 7)?;

        // Simulate a commit: everything below the current end is sealed
        alloc.end_transaction();
        alloc.begin_transaction(2, 1);

        let old_ref = arr.ref_();
        arr.set(&mut alloc, 0, 8)?;

        assert_ne!(old_ref, arr.ref_());
        assert_eq!(8, arr.get(alloc.mapping(), 0));

        // The committed image still holds the old value
        let sealed = Array::attach(alloc.mapping(), old_ref)?;
        assert_eq!(7, sealed.get(alloc.mapping(), 0));

        Ok(())
    }

    #[test]
    fn array_bounds() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut alloc = open_alloc(&dir)?;

        let mut arr = Array::create_empty(&mut alloc, NodeKind::Normal, false)?;
        for v in [1, 3, 3, 5, 9] {
            arr.add(&mut alloc, v)?;
        }

        assert_eq!(1, arr.lower_bound(alloc.mapping(), 3));
        assert_eq!(3, arr.upper_bound(alloc.mapping(), 3));
        assert_eq!(0, arr.lower_bound(alloc.mapping(), 0));
        assert_eq!(5, arr.upper_bound(alloc.mapping(), 100));

        Ok(())
    }

    #[test]
    fn array_find() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut alloc = open_alloc(&dir)?;

        let mut arr = Array::create_empty(&mut alloc, NodeKind::Normal, false)?;
        for v in [4, 8, 4, 16, 4] {
            arr.add(&mut alloc, v)?;
        }

        assert_eq!(Some(2), arr.find_first(alloc.mapping(), 4, 1, 5));
        assert_eq!(None, arr.find_first(alloc.mapping(), 99, 0, 5));

        let mut hits = vec![];
        arr.find_all(alloc.mapping(), &mut hits, 4, 0, 5);
        assert_eq!(vec![0, 2, 4], hits);

        assert_eq!(
            Some(3),
            arr.find_first_cond(alloc.mapping(), Cond::Greater(8), 0, 5)
        );
        assert_eq!(
            Some(1),
            arr.find_first_cond(alloc.mapping(), Cond::Between(5, 9), 0, 5)
        );

        Ok(())
    }

    #[test]
    fn array_clone_deep_rewrites_child_refs() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut alloc = open_alloc(&dir)?;

        let mut child = Array::create_empty(&mut alloc, NodeKind::Normal, false)?;
        child.add(&mut alloc, 42)?;

        let mut parent = Array::create_empty(&mut alloc, NodeKind::HasRefs, false)?;
        parent.add(&mut alloc, child.ref_() as i64)?;
        parent.add(&mut alloc, (7 << 1) | 1)?;

        let copy_ref = Array::clone_deep(&mut alloc, parent.ref_())?;
        let copy = Array::attach(alloc.mapping(), copy_ref)?;

        assert_ne!(parent.ref_(), copy_ref);
        assert_ne!(child.ref_(), copy.get_as_ref(alloc.mapping(), 0));
        assert_eq!(7, copy.get_tagged(alloc.mapping(), 1));

        let child_copy = Array::attach(alloc.mapping(), copy.get_as_ref(alloc.mapping(), 0))?;
        assert_eq!(42, child_copy.get(alloc.mapping(), 0));

        Ok(())
    }

    #[test]
    fn array_adjust_range() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut alloc = open_alloc(&dir)?;

        let mut arr = Array::create_empty(&mut alloc, NodeKind::Normal, false)?;
        for v in [10, 20, 30] {
            arr.add(&mut alloc, v)?;
        }

        arr.adjust_range(&mut alloc, 1, 3, 5)?;

        assert_eq!(10, arr.get(alloc.mapping(), 0));
        assert_eq!(25, arr.get(alloc.mapping(), 1));
        assert_eq!(35, arr.get(alloc.mapping(), 2));

        Ok(())
    }
}
