// Copyright (c) 2024-present, tide-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Structural integrity scan
//!
//! Walks everything reachable from a committed top ref and checks the
//! file-level accounting: every reachable node has a sane header, the
//! reachable set and the free list tile the logical file exactly (no
//! leaks, no double counting, no overlap), B+-tree counts add up, string
//! offsets are monotonic, and every indexed row sits in exactly one
//! index slot.

use crate::{
    alloc::{Mapping, Ref, FILE_HEADER_SIZE},
    array::{blob::ArrayBlob, Array},
    column::{ColumnType, IntColumn, StringColumn},
    db::{attach_table, ReadTransaction, TableId},
    index::{string_to_key, HashIndex, KeySource},
    Error,
};

pub(crate) fn verify_snapshot(txn: &ReadTransaction) -> crate::Result<()> {
    let Some(group) = txn.group() else {
        return Ok(());
    };
    let mapping = txn.mapping();

    // Reachable nodes plus free spans must tile [header, logical size)
    let mut spans: Vec<(u64, u64)> = Vec::new();
    collect_reachable(mapping, txn.top_ref(), &mut spans, 0)?;

    for entry in group.read_free_list(mapping)? {
        spans.push((entry.pos, entry.size));
    }

    spans.sort_unstable();

    let mut cursor = FILE_HEADER_SIZE as u64;
    for (pos, size) in &spans {
        if *pos < cursor {
            return Err(Error::Corrupt("overlapping node or free-list spans"));
        }
        if *pos > cursor {
            return Err(Error::Corrupt("leaked bytes between spans"));
        }
        cursor = pos + size;
    }
    if cursor != group.logical_size {
        return Err(Error::Corrupt("spans do not cover the logical file"));
    }

    // Typed checks, per column
    let roots = Array::attach(mapping, group.table_roots_ref)?;

    for t in 0..roots.size() {
        let arrays = attach_table(mapping, roots.get_as_ref(mapping, t))?;

        for c in 0..arrays.columns.size() {
            let ty = ColumnType::try_from(arrays.types.get(mapping, c))?;
            let col_ref = arrays.columns.get_as_ref(mapping, c);

            let rows = match ty {
                ColumnType::Int => check_tree(mapping, col_ref, &int_leaf_size)?,
                ColumnType::String => check_tree(mapping, col_ref, &string_leaf_size)?,
                ColumnType::Binary => check_tree(mapping, col_ref, &long_leaf_size)?,
            };

            let index_ref = arrays.indexes.get_as_ref(mapping, c);
            if index_ref != 0 {
                check_index(mapping, txn, TableId(t), c, ty, rows, index_ref)?;
            }
        }
    }

    Ok(())
}

fn collect_reachable(
    mapping: &Mapping,
    ref_: Ref,
    out: &mut Vec<(u64, u64)>,
    depth: u32,
) -> crate::Result<()> {
    if depth > 64 {
        return Err(Error::Corrupt("reference cycle or runaway nesting"));
    }

    let header = mapping.node_header(ref_)?;
    out.push((ref_, header.capacity as u64));

    if header.has_refs {
        let arr = Array::attach(mapping, ref_)?;
        for i in 0..arr.size() {
            let child = arr.get_as_ref(mapping, i);
            if child != 0 {
                collect_reachable(mapping, child, out, depth + 1)?;
            }
        }
    }

    Ok(())
}

/// Recursively checks one B+-tree: child counts against offsets, the
/// cumulative tree-size slots, and compact-form uniformity. Returns the
/// element count.
fn check_tree(
    mapping: &Mapping,
    ref_: Ref,
    leaf_size: &dyn Fn(&Mapping, Ref) -> crate::Result<usize>,
) -> crate::Result<usize> {
    let header = mapping.node_header(ref_)?;

    if !header.is_inner {
        return leaf_size(mapping, ref_);
    }

    let arr = Array::attach(mapping, ref_)?;
    if arr.size() < 3 {
        return Err(Error::Corrupt("inner tree node too small"));
    }

    let num_children = arr.size() - 2;
    let rot = arr.get(mapping, 0);

    let offsets = if rot & 1 == 0 {
        let offsets = Array::attach(mapping, rot as Ref)?;
        if offsets.size() != num_children - 1 {
            return Err(Error::Corrupt("tree offsets length mismatch"));
        }
        Some(offsets)
    } else {
        None
    };

    let elems_per_child = (rot >> 1) as usize;
    let mut total = 0usize;

    for i in 0..num_children {
        let child = arr.get_as_ref(mapping, i + 1);
        let child_count = check_tree(mapping, child, leaf_size)?;

        match &offsets {
            Some(offsets) => {
                if i < num_children - 1 {
                    let boundary = offsets.get(mapping, i) as usize;
                    if boundary != total + child_count {
                        return Err(Error::Corrupt("tree offsets out of step"));
                    }
                    if i > 0 && offsets.get(mapping, i - 1) as usize >= boundary {
                        return Err(Error::Corrupt("tree offsets not increasing"));
                    }
                }
            }
            None => {
                // Compact form: uniform fill except possibly the last
                let uniform = if i < num_children - 1 {
                    child_count == elems_per_child
                } else {
                    child_count <= elems_per_child
                };
                if !uniform {
                    return Err(Error::Corrupt("compact tree is not uniform"));
                }
            }
        }

        total += child_count;
    }

    let recorded = arr.get_tagged(mapping, arr.size() - 1) as usize;
    if recorded != total {
        return Err(Error::Corrupt("tree size slot does not match children"));
    }

    Ok(total)
}

fn int_leaf_size(mapping: &Mapping, ref_: Ref) -> crate::Result<usize> {
    Ok(mapping.node_header(ref_)?.size)
}

/// Leaf count for string leaves, validating long-form offsets on the way.
fn string_leaf_size(mapping: &Mapping, ref_: Ref) -> crate::Result<usize> {
    let header = mapping.node_header(ref_)?;

    if header.has_refs {
        long_leaf_size(mapping, ref_)
    } else {
        Ok(header.size)
    }
}

fn long_leaf_size(mapping: &Mapping, ref_: Ref) -> crate::Result<usize> {
    let top = Array::attach(mapping, ref_)?;
    if top.size() != 2 {
        return Err(Error::Corrupt("malformed long string node"));
    }

    let offsets = Array::attach(mapping, top.get_as_ref(mapping, 0))?;
    let blob = ArrayBlob::attach(mapping, top.get_as_ref(mapping, 1))?;

    let mut prev = 0i64;
    for i in 0..offsets.size() {
        let end = offsets.get(mapping, i);
        if end < prev {
            return Err(Error::Corrupt("string offsets decreasing"));
        }
        prev = end;
    }

    if prev as usize != blob.size() {
        return Err(Error::Corrupt("string offsets do not match blob length"));
    }

    Ok(offsets.size())
}

/// Every live row must sit in exactly one index slot, under its current
/// key.
fn check_index(
    mapping: &Mapping,
    txn: &ReadTransaction,
    table: TableId,
    col: usize,
    ty: ColumnType,
    rows: usize,
    index_ref: Ref,
) -> crate::Result<()> {
    let index = HashIndex::attach(mapping, index_ref)?;

    if index.len() != rows {
        return Err(Error::Corrupt("index row count mismatch"));
    }

    let arrays = attach_table(
        mapping,
        Array::attach(mapping, txn.group().expect("group is present").table_roots_ref)?
            .get_as_ref(mapping, table.0),
    )?;
    let col_ref = arrays.columns.get_as_ref(mapping, col);

    match ty {
        ColumnType::Int => {
            let column = IntColumn::attach(mapping, col_ref)?;
            for row in 0..rows as u64 {
                let key = column.key_value(mapping, row)?;
                let hits = index.find_all(mapping, &column, key)?;
                if hits.iter().filter(|r| **r == row).count() != 1 {
                    return Err(Error::Corrupt("row not indexed exactly once"));
                }
            }
        }
        ColumnType::String => {
            let column = StringColumn::attach(mapping, col_ref)?;
            for row in 0..rows as u64 {
                let key = string_to_key(column.get(mapping, row as usize)?);
                let hits = index.find_all(mapping, &column, key)?;
                if hits.iter().filter(|r| **r == row).count() != 1 {
                    return Err(Error::Corrupt("row not indexed exactly once"));
                }
            }
        }
        ColumnType::Binary => {}
    }

    Ok(())
}
