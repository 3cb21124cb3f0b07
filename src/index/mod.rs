// Copyright (c) 2024-present, tide-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Secondary hash index
//!
//! Maps a typed key (an integer, or a string hashed to an integer) to the
//! set of row indices holding it, with O(1) average lookup.
//!
//! The structure is a shallow trie keyed by successive bytes of a 64-bit
//! hash, whose leaves are hash buckets. Every bucket holds a *condenser*
//! of 256 packed 16-bit slots - `(quick_key << 8) | (value_idx + 1)`,
//! zero meaning empty - and a parallel values array. A values slot is
//! either `(row << 1) | 1` for a single row, or a ref to a sorted array
//! of row indices.
//!
//! Every key gets two candidate hashes; four consecutive condenser slots
//! are probed for each. When all eight probes of a new key are occupied,
//! one of the residents is displaced to its other hash, hopscotch style;
//! after [`MAX_COLLISIONS`] unresolved displacements the whole table
//! doubles twice over and everything is re-inserted.

use crate::{
    alloc::{Mapping, Ref, SlabAlloc},
    array::{destroy_deep_ref, Array, NodeKind},
    column::{IntColumn, StringColumn},
    node::HEADER_SIZE,
    Error,
};

/// Unresolved displacements tolerated before the table grows
const MAX_COLLISIONS: usize = 20;

/// Bucket slots probed per candidate hash
const PROBE_WINDOW: u64 = 4;

/// Provides the indexed key of a row, for full-key verification
///
/// The condenser only stores 8 bits of the key, so every quick-key match
/// is confirmed against the column.
pub trait KeySource {
    fn key_value(&self, mapping: &Mapping, row: u64) -> crate::Result<i64>;
}

impl KeySource for IntColumn {
    fn key_value(&self, mapping: &Mapping, row: u64) -> crate::Result<i64> {
        self.get(mapping, row as usize)
    }
}

impl KeySource for StringColumn {
    fn key_value(&self, mapping: &Mapping, row: u64) -> crate::Result<i64> {
        Ok(string_to_key(self.get(mapping, row as usize)?))
    }
}

/// Hashes a string value to its 64-bit index key.
#[must_use]
pub fn string_to_key(value: &[u8]) -> i64 {
    xxhash_rust::xxh3::xxh3_64(value) as i64
}

/// The secondary index accessor
pub struct HashIndex {
    root: Ref,
    mask: u64,
    levels: u32,
    count: usize,
}

/// Outcome of probing a bucket for a key
enum Probe {
    /// A free condenser slot
    Empty(usize),

    /// The key is already present; carries its values-slot index
    Found(usize),

    /// All probed slots are taken by other keys
    Neither,
}

impl HashIndex {
    /// Creates an empty index (a single bucket; 256 hash values).
    pub fn create(alloc: &mut SlabAlloc) -> crate::Result<Self> {
        let mut index = Self {
            root: 0,
            mask: 0,
            levels: 0,
            count: 0,
        };
        index.init_capacity(alloc, 256)?;
        Ok(index)
    }

    /// Attaches to an existing index and rebuilds its in-memory geometry.
    pub fn attach(mapping: &Mapping, root: Ref) -> crate::Result<Self> {
        let levels = trie_depth(mapping, root, 0)?;

        let mask = if levels == 1 {
            0xFF
        } else {
            let top = Array::attach(mapping, root)?;
            let mut mask = top.size() as u64 - 1;
            for _ in 1..levels {
                mask = (mask << 8) | 0xFF;
            }
            mask
        };

        let mut index = Self {
            root,
            mask,
            levels,
            count: 0,
        };

        let mut count = 0;
        index.for_each_leaf(mapping, &mut |leaf| {
            count += leaf.values.size();
            Ok(())
        })?;
        index.count = count;

        Ok(index)
    }

    pub fn root_ref(&self) -> Ref {
        self.root
    }

    /// Number of indexed rows.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn init_capacity(&mut self, alloc: &mut SlabAlloc, capacity: u64) -> crate::Result<()> {
        let mut bits = 4;
        while (1u64 << bits) < capacity {
            bits += 1;
        }
        let real_capacity = 1u64 << bits;

        self.mask = real_capacity - 1;
        self.levels = ((bits - 1) >> 3) + 1;
        self.count = 0;

        if self.levels == 1 {
            self.root = Bucket::create(alloc)?;
        } else {
            let top_level_size = (real_capacity >> ((self.levels - 1) << 3)) as usize;
            let top = Array::create(alloc, NodeKind::HasRefs, true, top_level_size, 0)?;
            self.root = top.ref_();
        }

        Ok(())
    }

    /// Inserts `num_rows` rows starting at `row_ndx`, all holding `key`.
    ///
    /// For a non-append, the row indices of everything at or above
    /// `row_ndx` are shifted up first.
    pub fn insert(
        &mut self,
        alloc: &mut SlabAlloc,
        keys: &dyn KeySource,
        row_ndx: u64,
        key: i64,
        num_rows: u64,
        is_append: bool,
    ) -> crate::Result<()> {
        if !is_append {
            self.adjust_row_indexes(alloc, row_ndx, num_rows as i64)?;
        }

        for row in row_ndx..row_ndx + num_rows {
            self.insert_one(alloc, keys, row, key)?;

            if self.ready_to_grow() {
                self.grow_tree(alloc, keys)?;
            }
        }

        Ok(())
    }

    fn insert_one(
        &mut self,
        alloc: &mut SlabAlloc,
        keys: &dyn KeySource,
        row: u64,
        key: i64,
    ) -> crate::Result<()> {
        let mut shifted = ((row << 1) | 1) as i64;
        let mut key = key;

        let (mut h1, mut h2) = hash128(key, self.mask);
        let mut hash = h1;

        if self.bucket_insert_fresh(alloc, keys, hash, key, shifted)? {
            return Ok(());
        }

        // Both windows of h1 were unusable; alternate hashes, displacing
        // residents until something sticks
        let mut collision_count = 0;

        loop {
            hash = if hash == h1 { h2 } else { h1 };

            if self.bucket_insert_displacing(alloc, hash, key, &mut shifted)? {
                break;
            }

            // `shifted` now carries the displaced resident; re-derive its
            // key and move it to its other hash
            key = if shifted & 1 == 1 {
                keys.key_value(alloc.mapping(), (shifted >> 1) as u64)?
            } else {
                let rows = Array::attach(alloc.mapping(), shifted as Ref)?;
                let first = rows.get(alloc.mapping(), 0) as u64;
                keys.key_value(alloc.mapping(), first)?
            };

            (h1, h2) = hash128(key, self.mask);

            collision_count += 1;
            if collision_count == MAX_COLLISIONS {
                log::debug!("Hash index displacement chain too long; growing table");
                self.grow_tree_reinserting(alloc, keys, key, shifted)?;
                return Ok(());
            }
        }

        Ok(())
    }

    /// First insert attempt: probes the window of `hash` for an empty or
    /// equal slot. Returns false if neither is found.
    fn bucket_insert_fresh(
        &mut self,
        alloc: &mut SlabAlloc,
        keys: &dyn KeySource,
        hash: u64,
        key: i64,
        shifted: i64,
    ) -> crate::Result<bool> {
        let added = self.with_bucket_mut(alloc, hash, |bucket, alloc| {
            match bucket.probe(alloc.mapping(), Some(keys), hash, key)? {
                Probe::Neither => Ok(false),
                Probe::Empty(slot) => {
                    bucket.fill_slot(alloc, slot, key, shifted)?;
                    Ok(true)
                }
                Probe::Found(idx) => {
                    bucket.push_existing(alloc, idx, shifted)?;
                    Ok(true)
                }
            }
        })?;

        if added {
            self.count += 1;
        }
        Ok(added)
    }

    /// Displacement insert: takes any empty slot in the window, or evicts
    /// the resident of the first slot. The evicted value replaces
    /// `shifted`.
    fn bucket_insert_displacing(
        &mut self,
        alloc: &mut SlabAlloc,
        hash: u64,
        key: i64,
        shifted: &mut i64,
    ) -> crate::Result<bool> {
        let inserted = self.with_bucket_mut(alloc, hash, |bucket, alloc| {
            match bucket.find_empty(alloc.mapping(), hash) {
                Some(slot) => {
                    bucket.fill_slot(alloc, slot, key, *shifted)?;
                    Ok(true)
                }
                None => {
                    let slot = (hash & 0xFF) as usize;
                    *shifted = bucket.displace(alloc, slot, key, *shifted)?;
                    Ok(false)
                }
            }
        })?;

        if inserted {
            self.count += 1;
        }
        Ok(inserted)
    }

    /// Removes row `row_ndx`, which currently holds `key`.
    ///
    /// Unless the row was the last one, the remaining row indices above it
    /// are shifted down.
    pub fn erase(
        &mut self,
        alloc: &mut SlabAlloc,
        keys: &dyn KeySource,
        row_ndx: u64,
        is_last: bool,
    ) -> crate::Result<()> {
        let key = keys.key_value(alloc.mapping(), row_ndx)?;
        self.do_delete(alloc, keys, row_ndx, key)?;

        if !is_last {
            self.adjust_row_indexes(alloc, row_ndx, -1)?;
        }

        Ok(())
    }

    fn do_delete(
        &mut self,
        alloc: &mut SlabAlloc,
        keys: &dyn KeySource,
        row_ndx: u64,
        key: i64,
    ) -> crate::Result<()> {
        let shifted = ((row_ndx << 1) | 1) as i64;
        let (hash, idx) = self
            .locate_key(alloc.mapping(), keys, key)?
            .ok_or(Error::Logic("row is not present in the index"))?;

        self.with_bucket_mut(alloc, hash, |bucket, alloc| {
            bucket.erase_value(alloc, idx, shifted)
        })?;

        self.count -= 1;
        Ok(())
    }

    /// Re-points a key at a new row index (after a move within the
    /// column).
    pub fn update_ref(
        &mut self,
        alloc: &mut SlabAlloc,
        keys: &dyn KeySource,
        key: i64,
        old_row: u64,
        new_row: u64,
    ) -> crate::Result<()> {
        let (hash, idx) = self
            .locate_key(alloc.mapping(), keys, key)?
            .ok_or(Error::Logic("key is not present in the index"))?;

        self.with_bucket_mut(alloc, hash, |bucket, alloc| {
            bucket.update_value(alloc, idx, old_row, new_row)
        })?;

        Ok(())
    }

    /// Number of rows holding `key`.
    pub fn count(
        &self,
        mapping: &Mapping,
        keys: &dyn KeySource,
        key: i64,
    ) -> crate::Result<usize> {
        match self.locate_key(mapping, keys, key)? {
            Some((hash, idx)) => {
                let bucket = self
                    .bucket_for_hash(mapping, hash)?
                    .expect("locate_key found the bucket");
                bucket.count_at(mapping, idx)
            }
            None => Ok(0),
        }
    }

    /// Lowest row index holding `key`.
    pub fn find_first(
        &self,
        mapping: &Mapping,
        keys: &dyn KeySource,
        key: i64,
    ) -> crate::Result<Option<u64>> {
        match self.locate_key(mapping, keys, key)? {
            Some((hash, idx)) => {
                let bucket = self
                    .bucket_for_hash(mapping, hash)?
                    .expect("locate_key found the bucket");
                Ok(Some(bucket.first_value(mapping, idx)?))
            }
            None => Ok(None),
        }
    }

    /// Every row index holding `key`, sorted ascending.
    pub fn find_all(
        &self,
        mapping: &Mapping,
        keys: &dyn KeySource,
        key: i64,
    ) -> crate::Result<Vec<u64>> {
        match self.locate_key(mapping, keys, key)? {
            Some((hash, idx)) => {
                let bucket = self
                    .bucket_for_hash(mapping, hash)?
                    .expect("locate_key found the bucket");
                bucket.all_values(mapping, idx)
            }
            None => Ok(Vec::new()),
        }
    }

    /// First row of every distinct key.
    pub fn distinct(&self, mapping: &Mapping) -> crate::Result<Vec<u64>> {
        let mut rows = Vec::new();

        self.for_each_leaf(mapping, &mut |bucket| {
            for idx in 0..bucket.values.size() {
                rows.push(bucket.first_value(mapping, idx)?);
            }
            Ok(())
        })?;

        Ok(rows)
    }

    /// Shifts every indexed row `>= min_row` by `diff`.
    pub fn adjust_row_indexes(
        &mut self,
        alloc: &mut SlabAlloc,
        min_row: u64,
        diff: i64,
    ) -> crate::Result<()> {
        debug_assert!(diff > 0 || diff == -1);
        self.root = adjust_rows_recurse(alloc, self.root, min_row, diff)?;
        Ok(())
    }

    /// Drops every entry, resetting to a single empty bucket.
    pub fn clear(&mut self, alloc: &mut SlabAlloc) -> crate::Result<()> {
        destroy_deep_ref(alloc, self.root)?;
        self.init_capacity(alloc, 256)
    }

    pub fn destroy(self, alloc: &mut SlabAlloc) -> crate::Result<()> {
        destroy_deep_ref(alloc, self.root)
    }

    fn ready_to_grow(&self) -> bool {
        (self.count + (self.count >> 1)) as u64 > self.mask
    }

    /// Quadruples the table and re-inserts every entry.
    fn grow_tree(&mut self, alloc: &mut SlabAlloc, keys: &dyn KeySource) -> crate::Result<()> {
        let old_root = self.root;
        let new_capacity = 4 * (self.mask + 1) - 1;

        log::debug!(
            "Growing hash index from {} to {} buckets",
            self.mask + 1,
            new_capacity + 1,
        );

        // Collect the surviving rows, then rebuild from scratch
        let mut rows = Vec::with_capacity(self.count);
        self.for_each_leaf(alloc.mapping(), &mut |bucket| {
            for idx in 0..bucket.values.size() {
                rows.extend(bucket.all_values(alloc.mapping(), idx)?);
            }
            Ok(())
        })?;

        self.init_capacity(alloc, new_capacity)?;
        destroy_deep_ref(alloc, old_root)?;

        for row in rows {
            let key = keys.key_value(alloc.mapping(), row)?;
            self.insert_one(alloc, keys, row, key)?;
        }

        Ok(())
    }

    /// Grow triggered mid-displacement: the evicted entry in hand is
    /// re-inserted along with everything else.
    fn grow_tree_reinserting(
        &mut self,
        alloc: &mut SlabAlloc,
        keys: &dyn KeySource,
        key: i64,
        shifted: i64,
    ) -> crate::Result<()> {
        self.grow_tree(alloc, keys)?;

        if shifted & 1 == 1 {
            self.insert_one(alloc, keys, (shifted >> 1) as u64, key)?;
        } else {
            let rows = Array::attach(alloc.mapping(), shifted as Ref)?;
            let row_list: Vec<u64> = (0..rows.size())
                .map(|i| rows.get(alloc.mapping(), i) as u64)
                .collect();
            destroy_deep_ref(alloc, shifted as Ref)?;

            for row in row_list {
                self.insert_one(alloc, keys, row, key)?;
            }
        }

        Ok(())
    }

    /// Finds the bucket and values-slot holding `key`, trying both
    /// candidate hashes.
    fn locate_key(
        &self,
        mapping: &Mapping,
        keys: &dyn KeySource,
        key: i64,
    ) -> crate::Result<Option<(u64, usize)>> {
        let (h1, h2) = hash128(key, self.mask);

        for hash in [h1, h2] {
            if let Some(bucket) = self.bucket_for_hash(mapping, hash)? {
                if let Some(idx) = bucket.find(mapping, Some(keys), hash, key)? {
                    return Ok(Some((hash, idx)));
                }
            }
        }

        Ok(None)
    }

    fn bucket_for_hash(&self, mapping: &Mapping, hash: u64) -> crate::Result<Option<Bucket>> {
        let mut ref_ = self.root;
        let mut level = self.levels;

        while level > 1 {
            level -= 1;
            let byte = ((hash >> (level << 3)) & 0xFF) as usize;
            let arr = Array::attach(mapping, ref_)?;

            if byte >= arr.size() {
                return Err(Error::Corrupt("hash trie fan-out mismatch"));
            }

            ref_ = arr.get_as_ref(mapping, byte);
            if ref_ == 0 {
                return Ok(None);
            }
        }

        Ok(Some(Bucket::attach(mapping, ref_)?))
    }

    /// Runs `f` against the bucket for `hash`, creating the bucket (and
    /// any missing trie arrays) on the way down, and writes moved refs
    /// back up the path.
    fn with_bucket_mut<R>(
        &mut self,
        alloc: &mut SlabAlloc,
        hash: u64,
        f: impl FnOnce(&mut Bucket, &mut SlabAlloc) -> crate::Result<R>,
    ) -> crate::Result<R> {
        // Collect the path of (array, slot) pairs down to the bucket
        let mut path: Vec<(Array, usize)> = Vec::with_capacity(self.levels as usize);
        let mut ref_ = self.root;
        let mut level = self.levels;

        while level > 1 {
            level -= 1;
            let byte = ((hash >> (level << 3)) & 0xFF) as usize;
            let mut arr = Array::attach(alloc.mapping(), ref_)?;

            let mut child = arr.get_as_ref(alloc.mapping(), byte);
            if child == 0 {
                child = if level > 1 {
                    Array::create(alloc, NodeKind::HasRefs, true, 256, 0)?.ref_()
                } else {
                    Bucket::create(alloc)?
                };
                arr.set(alloc, byte, child as i64)?;
            }

            path.push((arr, byte));
            ref_ = child;
        }

        let mut bucket = Bucket::attach(alloc.mapping(), ref_)?;
        let result = f(&mut bucket, alloc)?;

        // Propagate moved refs from the bucket up to the root
        let mut child_ref = bucket.ref_();
        for (mut arr, slot) in path.into_iter().rev() {
            if arr.get_as_ref(alloc.mapping(), slot) != child_ref {
                arr.set(alloc, slot, child_ref as i64)?;
            }
            child_ref = arr.ref_();
        }
        self.root = child_ref;

        Ok(result)
    }

    fn for_each_leaf(
        &self,
        mapping: &Mapping,
        f: &mut dyn FnMut(&Bucket) -> crate::Result<()>,
    ) -> crate::Result<()> {
        for_each_recurse(mapping, self.root, f)
    }
}

fn for_each_recurse(
    mapping: &Mapping,
    ref_: Ref,
    f: &mut dyn FnMut(&Bucket) -> crate::Result<()>,
) -> crate::Result<()> {
    let arr = Array::attach(mapping, ref_)?;

    if arr.context_flag() {
        for i in 0..arr.size() {
            let child = arr.get_as_ref(mapping, i);
            if child != 0 {
                for_each_recurse(mapping, child, f)?;
            }
        }
        Ok(())
    } else {
        f(&Bucket::attach(mapping, ref_)?)
    }
}

fn adjust_rows_recurse(
    alloc: &mut SlabAlloc,
    ref_: Ref,
    min_row: u64,
    diff: i64,
) -> crate::Result<Ref> {
    let arr = Array::attach(alloc.mapping(), ref_)?;

    if arr.context_flag() {
        let mut arr = arr;
        for i in 0..arr.size() {
            let child = arr.get_as_ref(alloc.mapping(), i);
            if child != 0 {
                let new_child = adjust_rows_recurse(alloc, child, min_row, diff)?;
                if new_child != child {
                    arr.set(alloc, i, new_child as i64)?;
                }
            }
        }
        Ok(arr.ref_())
    } else {
        let mut bucket = Bucket::attach(alloc.mapping(), ref_)?;
        bucket.adjust_row_indexes(alloc, min_row, diff)?;
        Ok(bucket.ref_())
    }
}

fn trie_depth(mapping: &Mapping, ref_: Ref, guard: u32) -> crate::Result<u32> {
    if guard >= 8 {
        return Err(Error::Corrupt("hash trie too deep"));
    }

    let arr = Array::attach(mapping, ref_)?;

    if arr.context_flag() {
        for i in 0..arr.size() {
            let child = arr.get_as_ref(mapping, i);
            if child != 0 {
                return Ok(trie_depth(mapping, child, guard + 1)? + 1);
            }
        }
    }

    Ok(1)
}

/// One hash bucket: `[condenser_ref, values_ref]`
struct Bucket {
    top: Array,
    condenser: Array,
    values: Array,
}

impl Bucket {
    fn create(alloc: &mut SlabAlloc) -> crate::Result<Ref> {
        let mut condenser = Array::create(alloc, NodeKind::Normal, false, 256, 0)?;
        condenser.ensure_minimum_width(alloc, 0x7FFF)?;

        let values = Array::create_empty(alloc, NodeKind::HasRefs, false)?;

        let mut top = Array::create_empty(alloc, NodeKind::HasRefs, false)?;
        top.add(alloc, condenser.ref_() as i64)?;
        top.add(alloc, values.ref_() as i64)?;

        Ok(top.ref_())
    }

    fn attach(mapping: &Mapping, ref_: Ref) -> crate::Result<Self> {
        let top = Array::attach(mapping, ref_)?;

        if !top.has_refs() || top.size() != 2 {
            return Err(Error::Corrupt("malformed hash bucket"));
        }

        let condenser = Array::attach(mapping, top.get_as_ref(mapping, 0))?;
        let values = Array::attach(mapping, top.get_as_ref(mapping, 1))?;

        if condenser.size() != 256 || condenser.width() != 16 {
            return Err(Error::Corrupt("malformed hash bucket condenser"));
        }

        Ok(Self {
            top,
            condenser,
            values,
        })
    }

    fn ref_(&self) -> Ref {
        self.top.ref_()
    }

    /// Raw 16-bit digest at condenser position `i`.
    fn digest(&self, mapping: &Mapping, i: usize) -> u16 {
        debug_assert!(i < 256);
        let off = self.condenser.ref_() + HEADER_SIZE as u64 + (i as u64) * 2;
        let bytes = mapping.slice(off, 2);
        u16::from_le_bytes([bytes[0], bytes[1]])
    }

    fn set_digest(&mut self, alloc: &mut SlabAlloc, i: usize, digest: u16) -> crate::Result<()> {
        self.condenser.make_writable(alloc)?;

        let off = self.condenser.ref_() + HEADER_SIZE as u64 + (i as u64) * 2;
        alloc.write_slice(off, 2).copy_from_slice(&digest.to_le_bytes());

        self.update_children(alloc)
    }

    fn update_children(&mut self, alloc: &mut SlabAlloc) -> crate::Result<()> {
        if self.top.get_as_ref(alloc.mapping(), 0) != self.condenser.ref_() {
            let r = self.condenser.ref_() as i64;
            self.top.set(alloc, 0, r)?;
        }
        if self.top.get_as_ref(alloc.mapping(), 1) != self.values.ref_() {
            let r = self.values.ref_() as i64;
            self.top.set(alloc, 1, r)?;
        }
        Ok(())
    }

    /// Probes the window of `hash` for `key`; verified against the column.
    fn find(
        &self,
        mapping: &Mapping,
        keys: Option<&dyn KeySource>,
        hash: u64,
        key: i64,
    ) -> crate::Result<Option<usize>> {
        let quick_key = key as u8;

        for probe in 0..PROBE_WINDOW {
            let slot = ((hash + probe) & 0xFF) as usize;
            let digest = self.digest(mapping, slot);

            let idx = (digest & 0xFF) as usize;
            if idx == 0 {
                continue;
            }
            if (digest >> 8) as u8 != quick_key {
                continue;
            }

            let verified = match keys {
                Some(keys) => keys.key_value(mapping, self.first_value(mapping, idx - 1)?)? == key,
                None => true,
            };
            if verified {
                return Ok(Some(idx - 1));
            }
        }

        Ok(None)
    }

    /// Probes for an empty slot, or detects that `key` is already present.
    fn probe(
        &self,
        mapping: &Mapping,
        keys: Option<&dyn KeySource>,
        hash: u64,
        key: i64,
    ) -> crate::Result<Probe> {
        let quick_key = key as u8;

        for probe in 0..PROBE_WINDOW {
            let slot = ((hash + probe) & 0xFF) as usize;
            let digest = self.digest(mapping, slot);
            let idx = (digest & 0xFF) as usize;

            if idx == 0 {
                if self.values.size() < 255 {
                    return Ok(Probe::Empty(slot));
                }
                continue;
            }

            if (digest >> 8) as u8 == quick_key {
                if let Some(keys) = keys {
                    if keys.key_value(mapping, self.first_value(mapping, idx - 1)?)? == key {
                        return Ok(Probe::Found(idx - 1));
                    }
                }
            }
        }

        Ok(Probe::Neither)
    }

    fn find_empty(&self, mapping: &Mapping, hash: u64) -> Option<usize> {
        for probe in 0..PROBE_WINDOW {
            let slot = ((hash + probe) & 0xFF) as usize;
            if self.digest(mapping, slot) & 0xFF == 0 && self.values.size() < 255 {
                return Some(slot);
            }
        }
        None
    }

    /// Claims the empty condenser slot for a brand-new key.
    fn fill_slot(
        &mut self,
        alloc: &mut SlabAlloc,
        slot: usize,
        key: i64,
        shifted: i64,
    ) -> crate::Result<()> {
        let idx = self.values.size();
        debug_assert!(idx < 255);

        let digest = ((key as u8 as u16) << 8) | (idx as u16 + 1);
        self.set_digest(alloc, slot, digest)?;

        self.values.add(alloc, shifted)?;
        self.update_children(alloc)
    }

    /// Adds a row to a key that is already present at values slot `idx`.
    fn push_existing(&mut self, alloc: &mut SlabAlloc, idx: usize, shifted: i64) -> crate::Result<()> {
        let slot_value = self.values.get(alloc.mapping(), idx);
        let row = (shifted >> 1) as u64;

        if slot_value & 1 == 1 {
            // Second row for this key: escalate to a sorted row array
            let existing = (slot_value >> 1) as u64;

            let mut rows = Array::create_empty(alloc, NodeKind::Normal, false)?;
            rows.add(alloc, existing.min(row) as i64)?;
            rows.add(alloc, existing.max(row) as i64)?;

            self.values.set(alloc, idx, rows.ref_() as i64)?;
        } else {
            let mut rows = Array::attach(alloc.mapping(), slot_value as Ref)?;
            let pos = rows.lower_bound(alloc.mapping(), row as i64);
            rows.insert(alloc, pos, row as i64)?;

            if rows.ref_() != slot_value as Ref {
                self.values.set(alloc, idx, rows.ref_() as i64)?;
            }
        }

        self.update_children(alloc)
    }

    /// Swaps the last resident into a displaced condenser slot; returns
    /// the evicted value.
    fn displace(
        &mut self,
        alloc: &mut SlabAlloc,
        slot: usize,
        key: i64,
        shifted: i64,
    ) -> crate::Result<i64> {
        let digest = self.digest(alloc.mapping(), slot);
        let idx = (digest & 0xFF) as usize;
        debug_assert!(idx > 0);

        let new_digest = ((key as u8 as u16) << 8) | idx as u16;
        let old_value = self.values.get(alloc.mapping(), idx - 1);

        self.set_digest(alloc, slot, new_digest)?;
        self.values.set(alloc, idx - 1, shifted)?;
        self.update_children(alloc)?;

        Ok(old_value)
    }

    /// Removes one row from values slot `idx`.
    fn erase_value(&mut self, alloc: &mut SlabAlloc, idx: usize, shifted: i64) -> crate::Result<()> {
        let slot_value = self.values.get(alloc.mapping(), idx);

        if slot_value & 1 == 1 {
            debug_assert_eq!(slot_value, shifted);

            // Swap-remove from the values array, then patch the two
            // affected condenser slots
            let last_idx = self.values.size() - 1;
            let mut steps = 1;

            if idx < last_idx {
                let last_value = self.values.get(alloc.mapping(), last_idx);
                self.values.set(alloc, idx, last_value)?;
                steps = 2;
            }
            self.values.erase(alloc, last_idx)?;

            let mut i = 0;
            while steps > 0 {
                if i >= 256 {
                    return Err(Error::Corrupt("hash bucket slot accounting broken"));
                }
                let digest = self.digest(alloc.mapping(), i);
                let d_idx = (digest & 0xFF) as usize;

                if d_idx == idx + 1 {
                    self.set_digest(alloc, i, 0)?;
                    steps -= 1;
                } else if d_idx == last_idx + 1 && idx != last_idx {
                    self.set_digest(alloc, i, (digest & 0xFF00) | (idx as u16 + 1))?;
                    steps -= 1;
                }
                i += 1;
            }
        } else {
            let row = (shifted >> 1) as u64;
            let mut rows = Array::attach(alloc.mapping(), slot_value as Ref)?;

            if rows.size() > 2 {
                let pos = rows.lower_bound(alloc.mapping(), row as i64);
                rows.erase(alloc, pos)?;

                if rows.ref_() != slot_value as Ref {
                    self.values.set(alloc, idx, rows.ref_() as i64)?;
                }
            } else {
                // Back down to a single literal row
                let mut keep = rows.get(alloc.mapping(), 0) as u64;
                if keep == row {
                    keep = rows.get(alloc.mapping(), 1) as u64;
                }
                rows.destroy(alloc);

                self.values
                    .set(alloc, idx, ((keep << 1) | 1) as i64)?;
            }
        }

        self.update_children(alloc)
    }

    fn update_value(
        &mut self,
        alloc: &mut SlabAlloc,
        idx: usize,
        old_row: u64,
        new_row: u64,
    ) -> crate::Result<()> {
        let slot_value = self.values.get(alloc.mapping(), idx);

        if slot_value & 1 == 1 {
            debug_assert_eq!(old_row, (slot_value >> 1) as u64);
            self.values
                .set(alloc, idx, ((new_row << 1) | 1) as i64)?;
        } else {
            let mut rows = Array::attach(alloc.mapping(), slot_value as Ref)?;

            let pos = rows.lower_bound(alloc.mapping(), old_row as i64);
            rows.erase(alloc, pos)?;
            let pos = rows.lower_bound(alloc.mapping(), new_row as i64);
            rows.insert(alloc, pos, new_row as i64)?;

            if rows.ref_() != slot_value as Ref {
                self.values.set(alloc, idx, rows.ref_() as i64)?;
            }
        }

        self.update_children(alloc)
    }

    fn count_at(&self, mapping: &Mapping, idx: usize) -> crate::Result<usize> {
        let slot_value = self.values.get(mapping, idx);

        if slot_value & 1 == 1 {
            Ok(1)
        } else {
            Ok(Array::attach(mapping, slot_value as Ref)?.size())
        }
    }

    fn first_value(&self, mapping: &Mapping, idx: usize) -> crate::Result<u64> {
        let slot_value = self.values.get(mapping, idx);

        if slot_value & 1 == 1 {
            Ok((slot_value >> 1) as u64)
        } else {
            let rows = Array::attach(mapping, slot_value as Ref)?;
            Ok(rows.get(mapping, 0) as u64)
        }
    }

    fn all_values(&self, mapping: &Mapping, idx: usize) -> crate::Result<Vec<u64>> {
        let slot_value = self.values.get(mapping, idx);

        if slot_value & 1 == 1 {
            Ok(vec![(slot_value >> 1) as u64])
        } else {
            let rows = Array::attach(mapping, slot_value as Ref)?;
            Ok((0..rows.size()).map(|i| rows.get(mapping, i) as u64).collect())
        }
    }

    fn adjust_row_indexes(
        &mut self,
        alloc: &mut SlabAlloc,
        min_row: u64,
        diff: i64,
    ) -> crate::Result<()> {
        for idx in 0..self.values.size() {
            let slot_value = self.values.get(alloc.mapping(), idx);

            if slot_value & 1 == 1 {
                let row = (slot_value >> 1) as u64;
                if row >= min_row {
                    let adjusted = ((row as i64 + diff) as u64) << 1 | 1;
                    self.values.set(alloc, idx, adjusted as i64)?;
                }
            } else {
                let mut rows = Array::attach(alloc.mapping(), slot_value as Ref)?;
                for i in 0..rows.size() {
                    let row = rows.get(alloc.mapping(), i);
                    if row as u64 >= min_row {
                        rows.set(alloc, i, row + diff)?;
                    }
                }
                if rows.ref_() != slot_value as Ref {
                    self.values.set(alloc, idx, rows.ref_() as i64)?;
                }
            }
        }

        self.update_children(alloc)
    }
}

/// Double 64-bit hash of an index key
///
/// The rotate-and-step schedule is file format; both results are masked
/// down to the table size.
fn hash128(key: i64, mask: u64) -> (u64, u64) {
    const SEED: u64 = 0xDEAD_BEEF_DEAD_BEEF;

    fn step(h1: u64, h2: u64, k: u32) -> u64 {
        (h1 ^ h2).wrapping_add(h2.rotate_left(k))
    }

    let mut a: u64 = 0;
    let mut b: u64 = 0;
    let mut c: u64 = SEED.wrapping_add(key as u64);
    let mut d: u64 = SEED.wrapping_add(8u64 << 56);

    d = step(d, c, 15);
    a = step(a, d, 52);
    b = step(b, a, 26);
    c = step(c, b, 51);
    d = step(d, c, 28);
    a = step(a, d, 9);
    b = step(b, a, 47);
    c = step(c, b, 54);
    d = step(d, c, 32);
    a = step(a, d, 25);
    b = step(b, a, 63);

    (a & mask, b & mask)
}
