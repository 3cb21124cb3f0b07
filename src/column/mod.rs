// Copyright (c) 2024-present, tide-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Typed columns
//!
//! A column is a B+-tree plus a type-specific leaf: packed integers for
//! int columns, short-or-long string leaves for string columns, and the
//! long form unconditionally for binary columns. A column is identified
//! to the outside world by its root ref.

use crate::{
    alloc::{Mapping, Ref, SlabAlloc},
    array::{
        string::{LongStringLeaf, ShortStringLeaf, StringLeaf, StringLeafOps},
        Array, NodeKind,
    },
    tree::{BPlusTree, TreeLeaf},
    Error,
};

/// Column payload type tags
///
/// The numeric values are file format and must not change.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ColumnType {
    Int = 0,
    String = 1,
    Binary = 2,
}

impl TryFrom<i64> for ColumnType {
    type Error = Error;

    fn try_from(value: i64) -> crate::Result<Self> {
        match value {
            0 => Ok(Self::Int),
            1 => Ok(Self::String),
            2 => Ok(Self::Binary),
            _ => Err(Error::Corrupt("unknown column type tag")),
        }
    }
}

/// Integer leaf: a plain packed-bit array
pub struct IntLeaf(pub(crate) Array);

impl TreeLeaf for IntLeaf {
    fn create(alloc: &mut SlabAlloc) -> crate::Result<Self> {
        Ok(Self(Array::create_empty(alloc, NodeKind::Normal, false)?))
    }

    fn attach(mapping: &Mapping, ref_: Ref) -> crate::Result<Self> {
        let arr = Array::attach(mapping, ref_)?;
        if arr.is_inner() || arr.has_refs() {
            return Err(Error::Corrupt("expected integer leaf"));
        }
        Ok(Self(arr))
    }

    fn leaf_ref(&self) -> Ref {
        self.0.ref_()
    }

    fn leaf_size(&self) -> usize {
        self.0.size()
    }

    fn move_tail(
        &mut self,
        alloc: &mut SlabAlloc,
        dst: &mut Self,
        from: usize,
    ) -> crate::Result<()> {
        for i in from..self.0.size() {
            let v = self.0.get(alloc.mapping(), i);
            dst.0.add(alloc, v)?;
        }
        self.0.truncate(alloc, from)
    }

    fn destroy(self, alloc: &mut SlabAlloc) -> crate::Result<()> {
        self.0.destroy(alloc);
        Ok(())
    }
}

impl TreeLeaf for StringLeaf {
    fn create(alloc: &mut SlabAlloc) -> crate::Result<Self> {
        Ok(Self::Short(ShortStringLeaf::create(alloc)?))
    }

    fn attach(mapping: &Mapping, ref_: Ref) -> crate::Result<Self> {
        StringLeaf::attach(mapping, ref_)
    }

    fn leaf_ref(&self) -> Ref {
        self.ref_()
    }

    fn leaf_size(&self) -> usize {
        self.node_size()
    }

    fn move_tail(
        &mut self,
        alloc: &mut SlabAlloc,
        dst: &mut Self,
        from: usize,
    ) -> crate::Result<()> {
        let size = self.node_size();

        for i in from..size {
            let value = self.get(alloc.mapping(), i).to_vec();
            if !dst.fits(&value) {
                dst.upgrade(alloc)?;
            }
            let dst_size = dst.node_size();
            dst.insert(alloc, dst_size, &value)?;
        }
        for _ in from..size {
            self.erase(alloc, from)?;
        }
        Ok(())
    }

    fn destroy(self, alloc: &mut SlabAlloc) -> crate::Result<()> {
        StringLeaf::destroy(self, alloc)
    }
}

impl TreeLeaf for LongStringLeaf {
    fn create(alloc: &mut SlabAlloc) -> crate::Result<Self> {
        LongStringLeaf::create(alloc)
    }

    fn attach(mapping: &Mapping, ref_: Ref) -> crate::Result<Self> {
        LongStringLeaf::attach(mapping, ref_)
    }

    fn leaf_ref(&self) -> Ref {
        self.ref_()
    }

    fn leaf_size(&self) -> usize {
        self.node_size()
    }

    fn move_tail(
        &mut self,
        alloc: &mut SlabAlloc,
        dst: &mut Self,
        from: usize,
    ) -> crate::Result<()> {
        let size = self.node_size();

        for i in from..size {
            let value = self.get(alloc.mapping(), i).to_vec();
            let dst_size = dst.node_size();
            dst.insert(alloc, dst_size, &value)?;
        }
        for _ in from..size {
            self.erase(alloc, from)?;
        }
        Ok(())
    }

    fn destroy(self, alloc: &mut SlabAlloc) -> crate::Result<()> {
        LongStringLeaf::destroy(self, alloc)
    }
}

/// A column of 64-bit signed integers
pub struct IntColumn {
    tree: BPlusTree<IntLeaf>,
}

impl IntColumn {
    pub fn create(alloc: &mut SlabAlloc) -> crate::Result<Self> {
        Ok(Self {
            tree: BPlusTree::create(alloc)?,
        })
    }

    pub fn attach(mapping: &Mapping, root: Ref) -> crate::Result<Self> {
        Ok(Self {
            tree: BPlusTree::attach(mapping, root)?,
        })
    }

    pub fn root_ref(&self) -> Ref {
        self.tree.root_ref()
    }

    pub fn size(&self, mapping: &Mapping) -> crate::Result<usize> {
        self.tree.size(mapping)
    }

    pub fn get(&self, mapping: &Mapping, ndx: usize) -> crate::Result<i64> {
        let (leaf, n) = self.tree.locate(mapping, ndx)?;
        Ok(leaf.0.get(mapping, n))
    }

    pub fn set(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: i64) -> crate::Result<()> {
        self.tree
            .access_mut(alloc, ndx, &mut |leaf, alloc, n| leaf.0.set(alloc, n, value))
    }

    pub fn insert(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: i64) -> crate::Result<()> {
        self.tree
            .insert_with(alloc, ndx, &mut |leaf, alloc, n| leaf.0.insert(alloc, n, value))
    }

    pub fn add(&mut self, alloc: &mut SlabAlloc, value: i64) -> crate::Result<()> {
        let size = self.size(alloc.mapping())?;
        self.insert(alloc, size, value)
    }

    pub fn erase(&mut self, alloc: &mut SlabAlloc, ndx: usize) -> crate::Result<()> {
        self.tree.erase_with(alloc, ndx, &mut |leaf, alloc, n| {
            leaf.0.erase(alloc, n)?;
            Ok(leaf.0.size())
        })
    }

    /// Removes every element, leaving a single empty leaf.
    pub fn clear(&mut self, alloc: &mut SlabAlloc) -> crate::Result<()> {
        let fresh = BPlusTree::create(alloc)?;
        let old = std::mem::replace(&mut self.tree, fresh);
        old.destroy(alloc)
    }

    /// Row index of the first occurrence of `value`.
    pub fn find_first(&self, mapping: &Mapping, value: i64) -> crate::Result<Option<usize>> {
        let mut found = None;

        self.tree.traverse(mapping, &mut |leaf, offset| {
            if let Some(i) = leaf.0.find_first(mapping, value, 0, leaf.0.size()) {
                found = Some(offset + i);
                return Ok(true);
            }
            Ok(false)
        })?;

        Ok(found)
    }

    /// Row indices of every occurrence of `value`.
    pub fn find_all(&self, mapping: &Mapping, value: i64) -> crate::Result<Vec<usize>> {
        let mut rows = Vec::new();

        self.tree.traverse(mapping, &mut |leaf, offset| {
            let mut hits = Vec::new();
            leaf.0.find_all(mapping, &mut hits, value, 0, leaf.0.size());
            rows.extend(hits.into_iter().map(|i| offset + i));
            Ok(false)
        })?;

        Ok(rows)
    }

    pub fn destroy(self, alloc: &mut SlabAlloc) -> crate::Result<()> {
        self.tree.destroy(alloc)
    }

    #[cfg(test)]
    pub(crate) fn set_node_capacity(&mut self, max: usize) {
        self.tree.set_node_capacity(max);
    }
}

/// A column of variable-length strings
///
/// Leaves start in short form and upgrade to long form the first time a
/// value longer than 63 bytes lands in them; the formats may differ
/// between leaves of the same column.
pub struct StringColumn {
    tree: BPlusTree<StringLeaf>,
}

impl StringColumn {
    pub fn create(alloc: &mut SlabAlloc) -> crate::Result<Self> {
        Ok(Self {
            tree: BPlusTree::create(alloc)?,
        })
    }

    pub fn attach(mapping: &Mapping, root: Ref) -> crate::Result<Self> {
        Ok(Self {
            tree: BPlusTree::attach(mapping, root)?,
        })
    }

    pub fn root_ref(&self) -> Ref {
        self.tree.root_ref()
    }

    pub fn size(&self, mapping: &Mapping) -> crate::Result<usize> {
        self.tree.size(mapping)
    }

    pub fn get<'m>(&self, mapping: &'m Mapping, ndx: usize) -> crate::Result<&'m [u8]> {
        let (leaf, n) = self.tree.locate(mapping, ndx)?;
        // The leaf accessor dies here; the returned bytes borrow the mapping
        Ok(leaf.get(mapping, n))
    }

    pub fn set(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: &[u8]) -> crate::Result<()> {
        self.tree.access_mut(alloc, ndx, &mut |leaf, alloc, n| {
            if !leaf.fits(value) {
                leaf.upgrade(alloc)?;
            }
            leaf.set(alloc, n, value)
        })
    }

    pub fn insert(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: &[u8]) -> crate::Result<()> {
        self.tree.insert_with(alloc, ndx, &mut |leaf, alloc, n| {
            if !leaf.fits(value) {
                leaf.upgrade(alloc)?;
            }
            leaf.insert(alloc, n, value)
        })
    }

    pub fn add(&mut self, alloc: &mut SlabAlloc, value: &[u8]) -> crate::Result<()> {
        let size = self.size(alloc.mapping())?;
        self.insert(alloc, size, value)
    }

    pub fn erase(&mut self, alloc: &mut SlabAlloc, ndx: usize) -> crate::Result<()> {
        self.tree.erase_with(alloc, ndx, &mut |leaf, alloc, n| {
            leaf.erase(alloc, n)?;
            Ok(leaf.node_size())
        })
    }

    pub fn clear(&mut self, alloc: &mut SlabAlloc) -> crate::Result<()> {
        let fresh = BPlusTree::create(alloc)?;
        let old = std::mem::replace(&mut self.tree, fresh);
        old.destroy(alloc)
    }

    pub fn find_first(&self, mapping: &Mapping, value: &[u8]) -> crate::Result<Option<usize>> {
        let mut found = None;

        self.tree.traverse(mapping, &mut |leaf, offset| {
            for i in 0..leaf.node_size() {
                if leaf.get(mapping, i) == value {
                    found = Some(offset + i);
                    return Ok(true);
                }
            }
            Ok(false)
        })?;

        Ok(found)
    }

    pub fn destroy(self, alloc: &mut SlabAlloc) -> crate::Result<()> {
        self.tree.destroy(alloc)
    }
}

/// A column of variable-length byte strings, always in long form
pub struct BinaryColumn {
    tree: BPlusTree<LongStringLeaf>,
}

impl BinaryColumn {
    pub fn create(alloc: &mut SlabAlloc) -> crate::Result<Self> {
        Ok(Self {
            tree: BPlusTree::create(alloc)?,
        })
    }

    pub fn attach(mapping: &Mapping, root: Ref) -> crate::Result<Self> {
        Ok(Self {
            tree: BPlusTree::attach(mapping, root)?,
        })
    }

    pub fn root_ref(&self) -> Ref {
        self.tree.root_ref()
    }

    pub fn size(&self, mapping: &Mapping) -> crate::Result<usize> {
        self.tree.size(mapping)
    }

    pub fn get<'m>(&self, mapping: &'m Mapping, ndx: usize) -> crate::Result<&'m [u8]> {
        let (leaf, n) = self.tree.locate(mapping, ndx)?;
        Ok(leaf.get(mapping, n))
    }

    pub fn set(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: &[u8]) -> crate::Result<()> {
        self.tree
            .access_mut(alloc, ndx, &mut |leaf, alloc, n| leaf.set(alloc, n, value))
    }

    pub fn insert(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: &[u8]) -> crate::Result<()> {
        self.tree
            .insert_with(alloc, ndx, &mut |leaf, alloc, n| leaf.insert(alloc, n, value))
    }

    pub fn add(&mut self, alloc: &mut SlabAlloc, value: &[u8]) -> crate::Result<()> {
        let size = self.size(alloc.mapping())?;
        self.insert(alloc, size, value)
    }

    pub fn erase(&mut self, alloc: &mut SlabAlloc, ndx: usize) -> crate::Result<()> {
        self.tree.erase_with(alloc, ndx, &mut |leaf, alloc, n| {
            leaf.erase(alloc, n)?;
            Ok(leaf.node_size())
        })
    }

    pub fn clear(&mut self, alloc: &mut SlabAlloc) -> crate::Result<()> {
        let fresh = BPlusTree::create(alloc)?;
        let old = std::mem::replace(&mut self.tree, fresh);
        old.destroy(alloc)
    }

    pub fn destroy(self, alloc: &mut SlabAlloc) -> crate::Result<()> {
        self.tree.destroy(alloc)
    }
}
