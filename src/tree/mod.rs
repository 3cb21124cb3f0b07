// Copyright (c) 2024-present, tide-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Position-indexed B+-tree
//!
//! An ordered sequence of elements with logarithmic random access, insert
//! and erase, built over any leaf type implementing [`TreeLeaf`].
//!
//! An inner node is a has-refs array whose slot 0 is either a tagged
//! elements-per-child count (the *compact form*, valid while every child
//! except possibly the last is uniformly filled) or a ref to an offsets
//! array of cumulative element counts (the *general form*). Slots
//! `1..=N` are the child refs and the last slot is the tagged element
//! count of the whole subtree. Append-only workloads stay compact, so
//! positional descent is a division instead of a binary search.

use crate::{
    alloc::{Mapping, Ref, SlabAlloc},
    array::{destroy_deep_ref, Array, NodeKind},
    Error,
};
use std::marker::PhantomData;

/// Maximum number of elements in a leaf, and children in an inner node
pub const MAX_NODE_SIZE: usize = 1000;

/// A leaf node type usable under the tree
///
/// Leaves only need positional plumbing here; element-typed operations are
/// applied through the closures handed to [`BPlusTree::insert_with`] and
/// friends.
pub trait TreeLeaf: Sized {
    fn create(alloc: &mut SlabAlloc) -> crate::Result<Self>;

    fn attach(mapping: &Mapping, ref_: Ref) -> crate::Result<Self>;

    fn leaf_ref(&self) -> Ref;

    fn leaf_size(&self) -> usize;

    /// Appends every element from `from` on to `dst`, then truncates self.
    fn move_tail(&mut self, alloc: &mut SlabAlloc, dst: &mut Self, from: usize)
        -> crate::Result<()>;

    fn destroy(self, alloc: &mut SlabAlloc) -> crate::Result<()>;
}

/// Split bookkeeping threaded up through a recursive insert
#[derive(Default)]
pub struct SplitState {
    /// Element offset where the new sibling begins
    split_offset: usize,

    /// Combined element count of the node and its new sibling
    split_size: usize,
}

type InsertFn<'a, L> = &'a mut dyn FnMut(&mut L, &mut SlabAlloc, usize) -> crate::Result<()>;
type EraseFn<'a, L> = &'a mut dyn FnMut(&mut L, &mut SlabAlloc, usize) -> crate::Result<usize>;
type TraverseFn<'a, L> = &'a mut dyn FnMut(&L, usize) -> crate::Result<bool>;

/// A B+-tree rooted at a single ref
///
/// The accessor is transient; whoever holds the parent slot must persist
/// [`BPlusTree::root_ref`] after every mutating call.
pub struct BPlusTree<L: TreeLeaf> {
    root: Ref,
    max_node_size: usize,
    _leaf: PhantomData<L>,
}

impl<L: TreeLeaf> BPlusTree<L> {
    /// Creates a tree consisting of one empty leaf.
    pub fn create(alloc: &mut SlabAlloc) -> crate::Result<Self> {
        let leaf = L::create(alloc)?;
        Ok(Self {
            root: leaf.leaf_ref(),
            max_node_size: MAX_NODE_SIZE,
            _leaf: PhantomData,
        })
    }

    pub fn attach(mapping: &Mapping, root: Ref) -> crate::Result<Self> {
        let _ = mapping.node_header(root)?;
        Ok(Self {
            root,
            max_node_size: MAX_NODE_SIZE,
            _leaf: PhantomData,
        })
    }

    /// Shrinks the fan-out bound; test hook for forcing deep trees.
    #[cfg(test)]
    pub(crate) fn set_node_capacity(&mut self, max: usize) {
        self.max_node_size = max;
    }

    pub fn root_ref(&self) -> Ref {
        self.root
    }

    /// Total element count.
    pub fn size(&self, mapping: &Mapping) -> crate::Result<usize> {
        if mapping.node_header(self.root)?.is_inner {
            let inner = Inner::attach(mapping, self.root)?;
            Ok(inner.tree_size(mapping))
        } else {
            Ok(L::attach(mapping, self.root)?.leaf_size())
        }
    }

    /// Descends to the leaf holding position `n`.
    ///
    /// Returns the leaf accessor and the position within it.
    pub fn locate(&self, mapping: &Mapping, n: usize) -> crate::Result<(L, usize)> {
        let mut ref_ = self.root;
        let mut n = n;

        loop {
            if !mapping.node_header(ref_)?.is_inner {
                let leaf = L::attach(mapping, ref_)?;
                if n >= leaf.leaf_size() {
                    return Err(Error::Logic("position out of range"));
                }
                return Ok((leaf, n));
            }

            let inner = Inner::attach(mapping, ref_)?;
            let (child_ndx, child_offset) = inner.find_child(mapping, n);

            if child_ndx >= inner.num_children() {
                return Err(Error::Logic("position out of range"));
            }

            ref_ = inner.child_ref(mapping, child_ndx);
            n -= child_offset;
        }
    }

    /// Applies `f` to the leaf holding position `n`, without any
    /// structural change, and propagates moved refs back up the path.
    pub fn access_mut(
        &mut self,
        alloc: &mut SlabAlloc,
        n: usize,
        f: &mut dyn FnMut(&mut L, &mut SlabAlloc, usize) -> crate::Result<()>,
    ) -> crate::Result<()> {
        if n >= self.size(alloc.mapping())? {
            return Err(Error::Logic("position out of range"));
        }

        self.root = access_recurse::<L>(alloc, self.root, n, f)?;
        Ok(())
    }

    /// Inserts one element at position `n` through `f`, splitting nodes
    /// bottom-up as needed.
    pub fn insert_with(
        &mut self,
        alloc: &mut SlabAlloc,
        n: usize,
        f: InsertFn<'_, L>,
    ) -> crate::Result<()> {
        let total = self.size(alloc.mapping())?;
        if n > total {
            return Err(Error::Logic("position out of range"));
        }

        // A pure append keeps the tree in compact form
        let ndx = if n == total { None } else { Some(n) };

        let mut state = SplitState::default();
        let is_inner = alloc.mapping().node_header(self.root)?.is_inner;

        let (new_root, sibling) = if is_inner {
            insert_inner::<L>(alloc, self.root, ndx, &mut state, self.max_node_size, f)?
        } else {
            insert_leaf::<L>(alloc, self.root, ndx, &mut state, self.max_node_size, f)?
        };
        self.root = new_root;

        if let Some(sibling) = sibling {
            // Split reached the top: grow the tree one level
            let compact_form = ndx.is_none() && is_compact(alloc.mapping(), self.root)?;

            let mut new_root = if compact_form {
                Inner::create(alloc, state.split_offset)?
            } else {
                let mut node = Inner::create(alloc, 0)?;
                node.ensure_offsets(alloc)?;
                node
            };

            new_root.add_child_ref(alloc, self.root, 0)?;
            new_root.add_child_ref(alloc, sibling, state.split_offset as i64)?;
            new_root.append_tree_size(alloc, state.split_size)?;

            self.root = new_root.ref_();
        }

        Ok(())
    }

    /// Erases the element at position `n` through `f`, merging and
    /// collapsing nodes as needed.
    pub fn erase_with(
        &mut self,
        alloc: &mut SlabAlloc,
        n: usize,
        f: EraseFn<'_, L>,
    ) -> crate::Result<()> {
        if n >= self.size(alloc.mapping())? {
            return Err(Error::Logic("position out of range"));
        }

        if !alloc.mapping().node_header(self.root)?.is_inner {
            // A root leaf just shrinks; erasing the last element leaves an
            // empty leaf, never a deleted root
            let mut leaf = L::attach(alloc.mapping(), self.root)?;
            f(&mut leaf, alloc, n)?;
            self.root = leaf.leaf_ref();
            return Ok(());
        }

        let (new_root, mut root_size) =
            erase_inner::<L>(alloc, self.root, n, self.max_node_size, f)?;
        self.root = new_root;

        // An inner root with a single child collapses into that child
        while root_size == 1 && alloc.mapping().node_header(self.root)?.is_inner {
            let mut inner = Inner::attach(alloc.mapping(), self.root)?;
            let child = inner.child_ref(alloc.mapping(), 0);

            inner.clear_first_child(alloc)?;
            destroy_deep_ref(alloc, inner.ref_())?;

            self.root = child;

            root_size = if alloc.mapping().node_header(self.root)?.is_inner {
                Inner::attach(alloc.mapping(), self.root)?.num_children()
            } else {
                break;
            };
        }

        Ok(())
    }

    /// Calls `f` once per leaf, left to right, with the leaf's element
    /// offset within the tree. `f` returning `true` stops the walk.
    pub fn traverse(&self, mapping: &Mapping, f: TraverseFn<'_, L>) -> crate::Result<()> {
        traverse_recurse::<L>(mapping, self.root, 0, f)?;
        Ok(())
    }

    /// Frees every node of the tree.
    pub fn destroy(self, alloc: &mut SlabAlloc) -> crate::Result<()> {
        destroy_deep_ref(alloc, self.root)
    }
}

fn is_compact(mapping: &Mapping, ref_: Ref) -> crate::Result<bool> {
    if !mapping.node_header(ref_)?.is_inner {
        return Ok(true);
    }
    let arr = Array::attach(mapping, ref_)?;
    Ok(arr.get(mapping, 0) & 1 == 1)
}

fn insert_leaf<L: TreeLeaf>(
    alloc: &mut SlabAlloc,
    leaf_ref: Ref,
    ndx: Option<usize>,
    state: &mut SplitState,
    max: usize,
    f: InsertFn<'_, L>,
) -> crate::Result<(Ref, Option<Ref>)> {
    let mut leaf = L::attach(alloc.mapping(), leaf_ref)?;
    let leaf_size = leaf.leaf_size();
    let ndx = ndx.unwrap_or(leaf_size).min(leaf_size);

    if leaf_size < max {
        f(&mut leaf, alloc, ndx)?;
        return Ok((leaf.leaf_ref(), None));
    }

    // Leaf is full: split. On append the new element goes alone into the
    // fresh sibling, which keeps append workloads compact
    let mut new_leaf = L::create(alloc)?;

    if ndx == leaf_size {
        f(&mut new_leaf, alloc, 0)?;
        state.split_offset = ndx;
    } else {
        leaf.move_tail(alloc, &mut new_leaf, ndx)?;
        f(&mut leaf, alloc, ndx)?;
        state.split_offset = ndx + 1;
    }
    state.split_size = leaf_size + 1;

    Ok((leaf.leaf_ref(), Some(new_leaf.leaf_ref())))
}

fn insert_inner<L: TreeLeaf>(
    alloc: &mut SlabAlloc,
    inner_ref: Ref,
    ndx: Option<usize>,
    state: &mut SplitState,
    max: usize,
    f: InsertFn<'_, L>,
) -> crate::Result<(Ref, Option<Ref>)> {
    let mut inner = Inner::attach(alloc.mapping(), inner_ref)?;

    let (child_ndx, local_ndx) = match ndx {
        Some(n) => {
            inner.ensure_offsets(alloc)?;
            let child_ndx = inner.find_child(alloc.mapping(), n).0;
            debug_assert!(child_ndx < inner.num_children());
            let child_offset = inner.child_offset(alloc.mapping(), child_ndx);
            (child_ndx, Some(n - child_offset))
        }
        None => (inner.num_children() - 1, None),
    };

    let child_ref = inner.child_ref(alloc.mapping(), child_ndx);
    let child_is_leaf = !alloc.mapping().node_header(child_ref)?.is_inner;

    let (new_child, sibling) = if child_is_leaf {
        insert_leaf::<L>(alloc, child_ref, local_ndx, state, max, f)?
    } else {
        insert_inner::<L>(alloc, child_ref, local_ndx, state, max, f)?
    };

    if new_child != child_ref {
        inner.set_child_ref(alloc, child_ndx, new_child)?;
    }

    match sibling {
        None => {
            inner.adjust_tree_size(alloc, 1)?;
            inner.adjust_offsets_from(alloc, child_ndx, 1)?;
            Ok((inner.ref_(), None))
        }
        Some(sibling) => {
            let new_sibling = inner.insert_child(alloc, child_ndx, sibling, state, max)?;
            Ok((inner.ref_(), new_sibling))
        }
    }
}

fn access_recurse<L: TreeLeaf>(
    alloc: &mut SlabAlloc,
    node_ref: Ref,
    n: usize,
    f: &mut dyn FnMut(&mut L, &mut SlabAlloc, usize) -> crate::Result<()>,
) -> crate::Result<Ref> {
    if !alloc.mapping().node_header(node_ref)?.is_inner {
        let mut leaf = L::attach(alloc.mapping(), node_ref)?;
        f(&mut leaf, alloc, n)?;
        return Ok(leaf.leaf_ref());
    }

    let mut inner = Inner::attach(alloc.mapping(), node_ref)?;
    let (child_ndx, child_offset) = inner.find_child(alloc.mapping(), n);
    let child_ref = inner.child_ref(alloc.mapping(), child_ndx);

    let new_child = access_recurse::<L>(alloc, child_ref, n - child_offset, f)?;
    if new_child != child_ref {
        inner.set_child_ref(alloc, child_ndx, new_child)?;
    }

    Ok(inner.ref_())
}

fn erase_inner<L: TreeLeaf>(
    alloc: &mut SlabAlloc,
    inner_ref: Ref,
    n: usize,
    max: usize,
    f: EraseFn<'_, L>,
) -> crate::Result<(Ref, usize)> {
    let mut inner = Inner::attach(alloc.mapping(), inner_ref)?;
    inner.ensure_offsets(alloc)?;

    let (child_ndx, child_offset) = inner.find_child(alloc.mapping(), n);
    debug_assert!(child_ndx < inner.num_children());

    let child_ref = inner.child_ref(alloc.mapping(), child_ndx);
    let child_is_leaf = !alloc.mapping().node_header(child_ref)?.is_inner;

    let mut left_leaf: Option<L> = None;
    let erase_node_size;

    if child_is_leaf {
        let mut leaf = L::attach(alloc.mapping(), child_ref)?;
        erase_node_size = f(&mut leaf, alloc, n - child_offset)?;
        if leaf.leaf_ref() != child_ref {
            inner.set_child_ref(alloc, child_ndx, leaf.leaf_ref())?;
        }
        left_leaf = Some(leaf);
    } else {
        let (new_child, sz) = erase_inner::<L>(alloc, child_ref, n - child_offset, max, f)?;
        erase_node_size = sz;
        if new_child != child_ref {
            inner.set_child_ref(alloc, child_ndx, new_child)?;
        }
    }

    inner.adjust_tree_size(alloc, -1)?;
    inner.adjust_offsets_from(alloc, child_ndx, -1)?;

    let mut num_children = inner.num_children();

    if erase_node_size == 0 {
        if num_children == 1 {
            // Only child empty: the parent deletes this node too
            return Ok((inner.ref_(), 0));
        }

        // Child drained: destroy it and contract
        let dead_ref = inner.child_ref(alloc.mapping(), child_ndx);
        inner.remove_child(alloc, child_ndx)?;
        destroy_deep_ref(alloc, dead_ref)?;
        return Ok((inner.ref_(), num_children - 1));
    }

    // Merge with the right sibling if both are sparse enough
    if erase_node_size < max / 2 && child_ndx < num_children - 1 {
        let sibling_ndx = child_ndx + 1;
        let sibling_ref = inner.child_ref(alloc.mapping(), sibling_ndx);

        if child_is_leaf {
            let mut sibling = L::attach(alloc.mapping(), sibling_ref)?;
            let combined = sibling.leaf_size() + erase_node_size;

            if combined < max * 3 / 4 {
                let mut left = left_leaf.take().expect("left leaf is attached");

                inner.pull_up_offset(alloc, sibling_ndx)?;
                sibling.move_tail(alloc, &mut left, 0)?;

                if left.leaf_ref() != inner.child_ref(alloc.mapping(), child_ndx) {
                    let new_ref = left.leaf_ref();
                    inner.set_child_ref(alloc, child_ndx, new_ref)?;
                }

                inner.remove_child(alloc, sibling_ndx)?;
                sibling.destroy(alloc)?;
                num_children -= 1;
            }
        } else {
            let mut left = Inner::attach(alloc.mapping(), inner.child_ref(alloc.mapping(), child_ndx))?;
            let mut right = Inner::attach(alloc.mapping(), sibling_ref)?;
            let combined = right.num_children() + erase_node_size;

            if combined < max * 3 / 4 {
                left.ensure_offsets(alloc)?;
                right.ensure_offsets(alloc)?;

                // The right node's offsets shrink by the distance between
                // the two subtrees
                let sibling_offs = inner.child_offset(alloc.mapping(), sibling_ndx) as i64;
                let left_offs = inner.child_offset(alloc.mapping(), child_ndx) as i64;
                let offs_adj = left_offs - sibling_offs;

                inner.pull_up_offset(alloc, sibling_ndx)?;

                let orig_size = left.tree_size(alloc.mapping());
                let moved_size = right.tree_size(alloc.mapping());

                left.pop_tree_size(alloc)?;
                right.move_children(alloc, &mut left, 0, offs_adj)?;
                left.append_tree_size(alloc, orig_size + moved_size)?;

                if left.ref_() != inner.child_ref(alloc.mapping(), child_ndx) {
                    let new_ref = left.ref_();
                    inner.set_child_ref(alloc, child_ndx, new_ref)?;
                }

                inner.remove_child(alloc, sibling_ndx)?;
                destroy_deep_ref(alloc, right.ref_())?;
                num_children -= 1;
            }
        }
    }

    Ok((inner.ref_(), num_children))
}

fn traverse_recurse<L: TreeLeaf>(
    mapping: &Mapping,
    node_ref: Ref,
    node_offset: usize,
    f: TraverseFn<'_, L>,
) -> crate::Result<bool> {
    if !mapping.node_header(node_ref)?.is_inner {
        let leaf = L::attach(mapping, node_ref)?;
        return f(&leaf, node_offset);
    }

    let inner = Inner::attach(mapping, node_ref)?;

    for i in 0..inner.num_children() {
        let child_offset = inner.child_offset(mapping, i);
        let child_ref = inner.child_ref(mapping, i);

        if traverse_recurse::<L>(mapping, child_ref, node_offset + child_offset, f)? {
            return Ok(true);
        }
    }

    Ok(false)
}

/// Accessor for one inner node
struct Inner {
    arr: Array,
    offsets: Option<Array>,
}

impl Inner {
    fn create(alloc: &mut SlabAlloc, elems_per_child: usize) -> crate::Result<Self> {
        let mut arr = Array::create_empty(alloc, NodeKind::Inner, false)?;
        arr.add(alloc, ((elems_per_child << 1) | 1) as i64)?;

        Ok(Self { arr, offsets: None })
    }

    fn attach(mapping: &Mapping, ref_: Ref) -> crate::Result<Self> {
        let arr = Array::attach(mapping, ref_)?;

        if !arr.is_inner() || arr.size() < 2 {
            return Err(Error::Corrupt("malformed inner tree node"));
        }

        let rot = arr.get(mapping, 0);
        let offsets = if rot & 1 == 0 {
            Some(Array::attach(mapping, rot as Ref)?)
        } else {
            None
        };

        Ok(Self { arr, offsets })
    }

    fn ref_(&self) -> Ref {
        self.arr.ref_()
    }

    fn num_children(&self) -> usize {
        self.arr.size() - 2
    }

    fn tree_size(&self, mapping: &Mapping) -> usize {
        self.arr.get_tagged(mapping, self.arr.size() - 1) as usize
    }

    fn elems_per_child(&self, mapping: &Mapping) -> usize {
        debug_assert!(self.offsets.is_none());
        self.arr.get_tagged(mapping, 0) as usize
    }

    fn child_ref(&self, mapping: &Mapping, ndx: usize) -> Ref {
        self.arr.get_as_ref(mapping, ndx + 1)
    }

    fn set_child_ref(&mut self, alloc: &mut SlabAlloc, ndx: usize, ref_: Ref) -> crate::Result<()> {
        self.arr.set(alloc, ndx + 1, ref_ as i64)
    }

    fn child_offset(&self, mapping: &Mapping, ndx: usize) -> usize {
        match &self.offsets {
            Some(offsets) => {
                if ndx == 0 {
                    0
                } else {
                    offsets.get(mapping, ndx - 1) as usize
                }
            }
            None => ndx * self.elems_per_child(mapping),
        }
    }

    /// Child index and element offset for position `n`.
    fn find_child(&self, mapping: &Mapping, n: usize) -> (usize, usize) {
        match &self.offsets {
            Some(offsets) => {
                let child_ndx = offsets.upper_bound(mapping, n as i64);
                (child_ndx, self.child_offset(mapping, child_ndx))
            }
            None => {
                let elems_per_child = self.elems_per_child(mapping);
                let child_ndx = n / elems_per_child;
                (child_ndx, child_ndx * elems_per_child)
            }
        }
    }

    fn set_tree_size(&mut self, alloc: &mut SlabAlloc, size: usize) -> crate::Result<()> {
        let last = self.arr.size() - 1;
        self.arr.set_tagged(alloc, last, size as u64)
    }

    fn adjust_tree_size(&mut self, alloc: &mut SlabAlloc, diff: i64) -> crate::Result<()> {
        let last = self.arr.size() - 1;
        self.arr.adjust(alloc, last, diff * 2)
    }

    fn append_tree_size(&mut self, alloc: &mut SlabAlloc, size: usize) -> crate::Result<()> {
        self.arr.add(alloc, ((size << 1) | 1) as i64)
    }

    /// Removes the tree-size slot before a bulk child move re-appends it.
    fn pop_tree_size(&mut self, alloc: &mut SlabAlloc) -> crate::Result<()> {
        let last = self.arr.size() - 1;
        self.arr.erase(alloc, last)
    }

    /// Appends a child ref; in general form a non-zero `offset` is pushed
    /// on the offsets array as the boundary before this child.
    fn add_child_ref(&mut self, alloc: &mut SlabAlloc, ref_: Ref, offset: i64) -> crate::Result<()> {
        self.arr.add(alloc, ref_ as i64)?;

        if offset != 0 {
            if let Some(offsets) = &mut self.offsets {
                offsets.add(alloc, offset)?;
            }
        }
        self.sync_offsets_slot(alloc)
    }

    fn insert_child_ref(
        &mut self,
        alloc: &mut SlabAlloc,
        ndx: usize,
        ref_: Ref,
    ) -> crate::Result<()> {
        self.arr.insert(alloc, ndx + 1, ref_ as i64)
    }

    /// Zeroes the first (and only) child slot so a deep destroy of this
    /// node spares the subtree, and returns the child ref.
    fn clear_first_child(&mut self, alloc: &mut SlabAlloc) -> crate::Result<Ref> {
        debug_assert_eq!(1, self.num_children());
        let ref_ = self.child_ref(alloc.mapping(), 0);
        self.arr.set(alloc, 1, 0)?;
        Ok(ref_)
    }

    /// Adds `diff` to the tagged boundaries at indices `>= child_ndx`.
    fn adjust_offsets_from(
        &mut self,
        alloc: &mut SlabAlloc,
        child_ndx: usize,
        diff: i64,
    ) -> crate::Result<()> {
        if let Some(offsets) = &mut self.offsets {
            let len = offsets.size();
            offsets.adjust_range(alloc, child_ndx.min(len), len, diff)?;
        }
        self.sync_offsets_slot(alloc)
    }

    /// Replaces the boundary left of `sibling_ndx` with the boundary right
    /// of it, in preparation for merging the two children.
    fn pull_up_offset(&mut self, alloc: &mut SlabAlloc, sibling_ndx: usize) -> crate::Result<()> {
        if let Some(offsets) = &mut self.offsets {
            if sibling_ndx < offsets.size() {
                let v = offsets.get(alloc.mapping(), sibling_ndx);
                offsets.set(alloc, sibling_ndx - 1, v)?;
            }
        }
        self.sync_offsets_slot(alloc)
    }

    /// Erases the slot and boundary of child `ndx`; the subtree itself is
    /// not freed.
    fn remove_child(&mut self, alloc: &mut SlabAlloc, ndx: usize) -> crate::Result<()> {
        self.arr.erase(alloc, ndx + 1)?;

        if let Some(offsets) = &mut self.offsets {
            let len = offsets.size();
            if len > 0 {
                offsets.erase(alloc, ndx.min(len - 1))?;
            }
        }
        self.sync_offsets_slot(alloc)?;

        debug_assert!(self.offsets.is_none() || self.offsets_len() == self.num_children() - 1);
        Ok(())
    }

    fn offsets_len(&self) -> usize {
        self.offsets.as_ref().map_or(0, Array::size)
    }

    /// Moves the children from `from` on into `dst` (appending), shifting
    /// their boundaries by `-adj`, and truncates self.
    ///
    /// Only meaningful in general form.
    fn move_children(
        &mut self,
        alloc: &mut SlabAlloc,
        dst: &mut Self,
        from: usize,
        adj: i64,
    ) -> crate::Result<()> {
        debug_assert!(self.offsets.is_some());

        let num_children = self.num_children();

        for i in from..num_children {
            let offset = self.child_offset(alloc.mapping(), i) as i64;
            let child = self.child_ref(alloc.mapping(), i);
            dst.add_child_ref(alloc, child, offset - adj)?;
        }

        self.arr.truncate(alloc, from + 1)?;
        if from > 0 {
            if let Some(offsets) = &mut self.offsets {
                offsets.truncate(alloc, from - 1)?;
            }
        }
        self.sync_offsets_slot(alloc)
    }

    /// Materializes the offsets array from the uniform child size, moving
    /// the node from compact to general form.
    fn ensure_offsets(&mut self, alloc: &mut SlabAlloc) -> crate::Result<()> {
        if self.offsets.is_some() {
            return Ok(());
        }

        let elems_per_child = self.elems_per_child(alloc.mapping());
        let num_offsets = self.arr.size().saturating_sub(3);

        let mut offsets = Array::create_empty(alloc, NodeKind::Normal, false)?;
        offsets.ensure_minimum_width(alloc, (num_offsets * elems_per_child) as i64)?;

        for k in 0..num_offsets {
            offsets.add(alloc, ((k + 1) * elems_per_child) as i64)?;
        }

        self.arr.set(alloc, 0, offsets.ref_() as i64)?;
        self.offsets = Some(offsets);

        Ok(())
    }

    /// Inserts the new sibling of child `child_ndx`, splitting this node
    /// if it is full. Returns the ref of this node's own new sibling.
    fn insert_child(
        &mut self,
        alloc: &mut SlabAlloc,
        child_ndx: usize,
        sibling_ref: Ref,
        state: &mut SplitState,
        max: usize,
    ) -> crate::Result<Option<Ref>> {
        let new_ref_ndx = child_ndx + 1;
        let num_children = self.num_children();

        if num_children < max {
            self.adjust_tree_size(alloc, 1)?;

            if self.offsets.is_some() {
                let elem_ndx_offset = self.child_offset(alloc.mapping(), child_ndx);
                let boundary = (elem_ndx_offset + state.split_offset) as i64;

                let offsets = self.offsets.as_mut().expect("general form");
                offsets.insert(alloc, child_ndx, boundary)?;
                let len = offsets.size();
                offsets.adjust_range(alloc, child_ndx + 1, len, 1)?;
                self.sync_offsets_slot(alloc)?;
            }

            self.insert_child_ref(alloc, new_ref_ndx, sibling_ref)?;
            return Ok(None);
        }

        // This node is full too: split it and pass the state up
        let (mut new_sibling, elem_ndx_offset) = if self.offsets.is_some() {
            let mut node = Inner::create(alloc, 0)?;
            node.ensure_offsets(alloc)?;
            (node, self.child_offset(alloc.mapping(), child_ndx))
        } else {
            let elems_per_child = self.elems_per_child(alloc.mapping());
            (
                Inner::create(alloc, elems_per_child)?,
                child_ndx * elems_per_child,
            )
        };

        let new_split_offset;
        let new_split_size;

        if new_ref_ndx == num_children {
            // The split child was our last child; the new sibling starts
            // out with just the new ref
            new_split_offset = elem_ndx_offset + state.split_offset;
            new_split_size = elem_ndx_offset + state.split_size;

            new_sibling.add_child_ref(alloc, sibling_ref, 0)?;
            self.set_tree_size(alloc, new_split_offset)?;
        } else {
            // Not possible during append, so this node is general form
            new_split_offset = elem_ndx_offset + state.split_size;
            new_split_size = self.tree_size(alloc.mapping()) + 1;

            self.move_children(alloc, &mut new_sibling, new_ref_ndx, (new_split_offset - 1) as i64)?;
            self.add_child_ref(alloc, sibling_ref, (elem_ndx_offset + state.split_offset) as i64)?;
            self.append_tree_size(alloc, new_split_offset)?;
        }

        new_sibling.append_tree_size(alloc, new_split_size - new_split_offset)?;

        state.split_offset = new_split_offset;
        state.split_size = new_split_size;

        Ok(Some(new_sibling.ref_()))
    }

    /// Re-points slot 0 at the offsets array if copy-on-write moved it.
    fn sync_offsets_slot(&mut self, alloc: &mut SlabAlloc) -> crate::Result<()> {
        if let Some(offsets) = &self.offsets {
            if self.arr.get_as_ref(alloc.mapping(), 0) != offsets.ref_() {
                let new_ref = offsets.ref_() as i64;
                self.arr.set(alloc, 0, new_ref)?;
            }
        }
        Ok(())
    }
}
