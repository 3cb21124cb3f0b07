// Copyright (c) 2024-present, tide-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use memmap2::MmapRaw;

/// One memory-mapped span of the database file
///
/// The file is mapped in segments: the initial mapping covers the whole
/// file, and every growth maps just the newly added span. A segment is
/// never remapped or unmapped while the database is open, so slices into
/// it stay valid for the lifetime of the mapping snapshot that holds it.
///
/// Aliasing discipline: bytes at offsets below the committed baseline are
/// never written (copy-on-write), and bytes above it are written only by
/// the single writer, which holds the writer lock. Readers therefore never
/// observe a mutation of the bytes they can reach.
pub struct Segment {
    map: MmapRaw,

    /// Absolute file offset of the first mapped byte
    start: u64,

    /// Number of mapped bytes
    len: u64,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Segment({}..{})", self.start, self.start + self.len)
    }
}

impl Segment {
    pub fn new(map: MmapRaw, start: u64, len: u64) -> Self {
        debug_assert!(map.len() as u64 >= len);
        Self { map, start, len }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.start + self.len
    }

    pub fn contains(&self, offset: u64, len: usize) -> bool {
        offset >= self.start && offset + len as u64 <= self.end()
    }

    /// Immutable view of `len` bytes at absolute file offset `offset`.
    pub fn slice(&self, offset: u64, len: usize) -> &[u8] {
        debug_assert!(self.contains(offset, len));

        let rel = (offset - self.start) as usize;

        // SAFETY: The range is inside the mapping, the mapping lives as
        // long as `self`, and the aliasing discipline above guarantees
        // no concurrent writer touches committed bytes
        #[expect(unsafe_code, reason = "see safety")]
        unsafe {
            std::slice::from_raw_parts(self.map.as_ptr().add(rel), len)
        }
    }

    /// Mutable view of `len` bytes at absolute file offset `offset`.
    ///
    /// Only the single writer may call this, and only for offsets at or
    /// above the committed baseline (fresh allocations) or for the file
    /// header's publish protocol.
    #[allow(clippy::mut_from_ref)]
    pub fn slice_mut(&self, offset: u64, len: usize) -> &mut [u8] {
        debug_assert!(self.contains(offset, len));

        let rel = (offset - self.start) as usize;

        // SAFETY: Same range reasoning as `slice`; exclusivity is
        // guaranteed by the writer lock
        #[expect(unsafe_code, reason = "see safety")]
        unsafe {
            std::slice::from_raw_parts_mut(self.map.as_mut_ptr().add(rel), len)
        }
    }

    pub fn flush(&self) -> std::io::Result<()> {
        self.map.flush()
    }

    pub fn flush_range(&self, offset: u64, len: usize) -> std::io::Result<()> {
        debug_assert!(self.contains(offset, len));
        self.map.flush_range((offset - self.start) as usize, len)
    }
}
