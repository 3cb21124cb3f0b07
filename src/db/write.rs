// Copyright (c) 2024-present, tide-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Write transactions
//!
//! Writers are serialized by an inter-process file lock plus the
//! in-process allocator mutex. A transaction mutates copy-on-write
//! shadows of the committed structures; commit persists the free list
//! and a fresh group root, appends the changeset to the commit log and
//! flips the top-ref selector. Nothing a concurrent reader can reach is
//! ever written in place, so rollback is simply forgetting.

use crate::{
    alloc::{Ref, SlabAlloc},
    array::{Array, NodeKind},
    column::{BinaryColumn, ColumnType, IntColumn, StringColumn},
    commit_log::changeset::{Changeset, Patch},
    db::{
        attach_table,
        group::{self, GroupInfo},
        ColumnId, Database, DbInner, TableArrays, TableId,
    },
    index::{string_to_key, HashIndex},
    Error,
};
use fs4::FileExt;
use std::sync::MutexGuard;

impl Database {
    /// Starts a write transaction.
    ///
    /// Blocks until the writer lock is available, both across threads and
    /// across processes. At most one writer exists at any time; its
    /// commit order is the database's total commit order.
    pub fn begin_write(&self) -> crate::Result<WriteTransaction<'_>> {
        let inner = &**self.inner();

        // In-process writers serialize on the allocator mutex; only then
        // is the cross-process file lock taken (it is per file
        // description, so it cannot arbitrate threads)
        let mut alloc = inner.alloc.lock().expect("lock is not poisoned");
        inner.writer_lock.lock()?;

        match Self::begin_write_locked(inner, &mut alloc) {
            Ok((names, tables, old_group, base_version)) => {
                log::trace!(
                    "Write transaction open: {base_version} -> {}",
                    base_version + 1,
                );

                Ok(WriteTransaction {
                    inner,
                    alloc,
                    names,
                    tables,
                    old_group,
                    base_version,
                    new_version: base_version + 1,
                    finished: false,
                })
            }
            Err(e) => {
                alloc.rollback_transaction();
                let _ = write_lock_pid(&inner.writer_lock, 0);
                let _ = FileExt::unlock(&inner.writer_lock);
                Err(e)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn begin_write_locked(
        inner: &DbInner,
        alloc: &mut SlabAlloc,
    ) -> crate::Result<(StringColumn, Array, Option<GroupInfo>, u64)> {
        // A non-zero owner pid means the previous writer died while
        // holding the lock. Its uncommitted writes were never published,
        // so taking over is the whole recovery.
        let mut pid_bytes = [0u8; 8];
        if read_lock_pid(&inner.writer_lock, &mut pid_bytes).is_ok() {
            let owner = u64::from_le_bytes(pid_bytes);
            if owner != 0 && owner != u64::from(std::process::id()) {
                log::warn!("Writer lock owner (pid {owner}) died; recovering");
            }
        }
        write_lock_pid(&inner.writer_lock, u64::from(std::process::id()))?;

        // Catch up with commits made by other processes
        alloc.refresh_mapping()?;
        let top_ref = alloc.top_ref()?;

        let (old_group, base_version) = if top_ref == 0 {
            (None, 1)
        } else {
            let group = GroupInfo::read(alloc.mapping(), top_ref)?;
            alloc.set_logical_size(group.logical_size)?;
            (Some(group), group.version)
        };

        let (reuse_floor, free_list) = {
            let mut state = inner.state.lock().expect("lock is not poisoned");
            state.top_ref = top_ref;
            state.version = base_version;

            let free_list = match &old_group {
                Some(group) => group.read_free_list(alloc.mapping())?,
                None => Vec::new(),
            };

            (state.oldest_pinned(), free_list)
        };

        alloc.begin_transaction(base_version + 1, reuse_floor);
        alloc.set_free_list(free_list);

        // Attach (or bootstrap) the table catalog
        let (names, tables) = match &old_group {
            Some(group) => (
                StringColumn::attach(alloc.mapping(), group.table_names_ref)?,
                Array::attach(alloc.mapping(), group.table_roots_ref)?,
            ),
            None => (
                StringColumn::create(alloc)?,
                Array::create_empty(alloc, NodeKind::HasRefs, false)?,
            ),
        };

        Ok((names, tables, old_group, base_version))
    }
}

/// An open write transaction
///
/// Dropping the transaction without committing rolls it back.
pub struct WriteTransaction<'db> {
    inner: &'db DbInner,
    alloc: MutexGuard<'db, SlabAlloc>,

    /// Table name column of the transaction's working group
    names: StringColumn,

    /// Table root refs, parallel to `names`
    tables: Array,

    old_group: Option<GroupInfo>,
    base_version: u64,
    new_version: u64,
    finished: bool,
}

impl<'db> WriteTransaction<'db> {
    /// The version this transaction will publish.
    pub fn version(&self) -> u64 {
        self.new_version
    }

    /// Creates an empty table.
    pub fn create_table(&mut self, name: &str) -> crate::Result<TableId> {
        if self.find_table(name)?.is_some() {
            return Err(Error::Logic("table already exists"));
        }

        let alloc = &mut *self.alloc;

        let types = Array::create_empty(alloc, NodeKind::Normal, false)?;
        let col_names = StringColumn::create(alloc)?;
        let indexes = Array::create_empty(alloc, NodeKind::HasRefs, false)?;

        let mut spec = Array::create_empty(alloc, NodeKind::HasRefs, false)?;
        spec.add(alloc, types.ref_() as i64)?;
        spec.add(alloc, col_names.root_ref() as i64)?;
        spec.add(alloc, indexes.ref_() as i64)?;

        let columns = Array::create_empty(alloc, NodeKind::HasRefs, false)?;

        let mut root = Array::create_empty(alloc, NodeKind::HasRefs, false)?;
        root.add(alloc, spec.ref_() as i64)?;
        root.add(alloc, columns.ref_() as i64)?;

        self.names.add(alloc, name.as_bytes())?;
        self.tables.add(alloc, root.ref_() as i64)?;

        Ok(TableId(self.tables.size() - 1))
    }

    /// Looks a table up by name.
    pub fn table(&self, name: &str) -> crate::Result<TableId> {
        self.find_table(name)?
            .map(TableId)
            .ok_or(Error::Logic("no such table"))
    }

    fn find_table(&self, name: &str) -> crate::Result<Option<usize>> {
        self.names
            .find_first(self.alloc.mapping(), name.as_bytes())
    }

    /// Appends a column of the given type to a table.
    pub fn add_column(
        &mut self,
        table: TableId,
        ty: ColumnType,
        name: &str,
    ) -> crate::Result<ColumnId> {
        let mut arrays = self.table_arrays(table)?;
        let alloc = &mut *self.alloc;

        if arrays
            .col_names
            .find_first(alloc.mapping(), name.as_bytes())?
            .is_some()
        {
            return Err(Error::Logic("column already exists"));
        }

        let root_ref = match ty {
            ColumnType::Int => IntColumn::create(alloc)?.root_ref(),
            ColumnType::String => StringColumn::create(alloc)?.root_ref(),
            ColumnType::Binary => BinaryColumn::create(alloc)?.root_ref(),
        };

        arrays.types.add(alloc, ty as i64)?;
        arrays.col_names.add(alloc, name.as_bytes())?;
        arrays.indexes.add(alloc, 1)?; // tagged 0: no index
        arrays.columns.add(alloc, root_ref as i64)?;

        let col = arrays.columns.size() - 1;
        self.store_table_arrays(table, arrays)?;

        Ok(ColumnId {
            table: table.0,
            col,
            ty,
        })
    }

    /// Looks a column up by name.
    pub fn column(&self, table: TableId, name: &str) -> crate::Result<ColumnId> {
        let arrays = self.table_arrays(table)?;

        let col = arrays
            .col_names
            .find_first(self.alloc.mapping(), name.as_bytes())?
            .ok_or(Error::Logic("no such column"))?;

        let ty = ColumnType::try_from(arrays.types.get(self.alloc.mapping(), col))?;

        Ok(ColumnId {
            table: table.0,
            col,
            ty,
        })
    }

    /// Builds a hash index over an existing column and keeps it
    /// maintained from now on.
    pub fn create_search_index(&mut self, id: ColumnId) -> crate::Result<()> {
        if self.index_root(id)? != 0 {
            return Ok(());
        }

        let col_ref = self.column_root(id)?;
        let alloc = &mut *self.alloc;

        let mut index = HashIndex::create(alloc)?;

        match id.ty {
            ColumnType::Int => {
                let col = IntColumn::attach(alloc.mapping(), col_ref)?;
                for row in 0..col.size(alloc.mapping())? {
                    let key = col.get(alloc.mapping(), row)?;
                    index.insert(alloc, &col, row as u64, key, 1, true)?;
                }
            }
            ColumnType::String => {
                let col = StringColumn::attach(alloc.mapping(), col_ref)?;
                for row in 0..col.size(alloc.mapping())? {
                    let key = string_to_key(col.get(alloc.mapping(), row)?);
                    index.insert(alloc, &col, row as u64, key, 1, true)?;
                }
            }
            ColumnType::Binary => {
                return Err(Error::Logic("binary columns cannot be indexed"));
            }
        }

        let root = index.root_ref();
        self.store_column_state(id, col_ref, Some(root))
    }

    /// Opens a mutable accessor for an integer column.
    pub fn int_column_mut<'t>(&'t mut self, id: ColumnId) -> crate::Result<IntColumnMut<'t, 'db>> {
        if id.ty != ColumnType::Int {
            return Err(Error::Logic("column is not an integer column"));
        }

        let col = IntColumn::attach(self.alloc.mapping(), self.column_root(id)?)?;
        let index = self.attach_index(id)?;

        Ok(IntColumnMut {
            txn: self,
            id,
            col,
            index,
        })
    }

    /// Opens a mutable accessor for a string column.
    pub fn string_column_mut<'t>(
        &'t mut self,
        id: ColumnId,
    ) -> crate::Result<StringColumnMut<'t, 'db>> {
        if id.ty != ColumnType::String {
            return Err(Error::Logic("column is not a string column"));
        }

        let col = StringColumn::attach(self.alloc.mapping(), self.column_root(id)?)?;
        let index = self.attach_index(id)?;

        Ok(StringColumnMut {
            txn: self,
            id,
            col,
            index,
        })
    }

    /// Opens a mutable accessor for a binary column.
    pub fn binary_column_mut<'t>(
        &'t mut self,
        id: ColumnId,
    ) -> crate::Result<BinaryColumnMut<'t, 'db>> {
        if id.ty != ColumnType::Binary {
            return Err(Error::Logic("column is not a binary column"));
        }

        let col = BinaryColumn::attach(self.alloc.mapping(), self.column_root(id)?)?;

        Ok(BinaryColumnMut { txn: self, id, col })
    }

    /// Publishes the transaction.
    ///
    /// The new state is durable (per the configured durability) and
    /// visible to new readers once this returns.
    pub fn commit(mut self) -> crate::Result<()> {
        // The superseded group and free-list arrays become free space of
        // the new version
        if let Some(old_group) = &self.old_group {
            old_group.free_metadata(&mut self.alloc)?;
        }

        let group_ref = group::write_group(
            &mut self.alloc,
            self.names.root_ref(),
            self.tables.ref_(),
            self.new_version,
        )?;

        // Everything this transaction wrote, as one changeset
        let patches: Vec<Patch> = self
            .alloc
            .txn_allocs()
            .to_vec()
            .into_iter()
            .map(|(offset, size)| Patch {
                offset,
                bytes: self.alloc.mapping().slice(offset, size as usize).to_vec(),
            })
            .collect();

        let changeset = Changeset {
            new_version: self.new_version,
            new_top_ref: group_ref,
            new_logical_size: self.alloc.logical_size(),
            patches,
        };

        self.alloc.flush_written()?;
        self.alloc.stage_top_ref(group_ref)?;

        {
            let mut log = self.inner.commit_log.lock().expect("lock is not poisoned");
            let appended = log.append(&changeset.encode_into_vec(), self.base_version)?;
            debug_assert_eq!(appended, self.new_version);
        }

        // The single aligned byte write that makes the commit visible
        self.alloc.flip_selector()?;
        self.alloc.end_transaction();

        {
            let mut state = self.inner.state.lock().expect("lock is not poisoned");
            state.version = self.new_version;
            state.top_ref = group_ref;
        }

        log::debug!("Committed version {}", self.new_version);

        self.finished = true;
        self.release_writer_lock();
        Ok(())
    }

    /// Discards every change made by this transaction.
    pub fn rollback(mut self) {
        self.alloc.rollback_transaction();
        self.finished = true;
        self.release_writer_lock();

        log::debug!("Rolled back transaction for version {}", self.new_version);
    }

    fn release_writer_lock(&self) {
        let _ = write_lock_pid(&self.inner.writer_lock, 0);
        let _ = FileExt::unlock(&self.inner.writer_lock);
    }

    /* Catalog plumbing */

    fn table_arrays(&self, table: TableId) -> crate::Result<TableArrays> {
        let mapping = self.alloc.mapping();

        if table.0 >= self.tables.size() {
            return Err(Error::Logic("no such table"));
        }

        attach_table(mapping, self.tables.get_as_ref(mapping, table.0))
    }

    fn column_root(&self, id: ColumnId) -> crate::Result<Ref> {
        let arrays = self.table_arrays(TableId(id.table))?;

        if id.col >= arrays.columns.size() {
            return Err(Error::Logic("no such column"));
        }

        Ok(arrays.columns.get_as_ref(self.alloc.mapping(), id.col))
    }

    fn index_root(&self, id: ColumnId) -> crate::Result<Ref> {
        let arrays = self.table_arrays(TableId(id.table))?;
        Ok(arrays.indexes.get_as_ref(self.alloc.mapping(), id.col))
    }

    fn attach_index(&self, id: ColumnId) -> crate::Result<Option<HashIndex>> {
        let root = self.index_root(id)?;

        if root == 0 {
            Ok(None)
        } else {
            Ok(Some(HashIndex::attach(self.alloc.mapping(), root)?))
        }
    }

    /// Writes possibly-moved spec members and column arrays back up the
    /// ref chain into the table catalog.
    fn store_table_arrays(&mut self, table: TableId, arrays: TableArrays) -> crate::Result<()> {
        let TableArrays {
            mut root,
            mut spec,
            types,
            col_names,
            indexes,
            columns,
        } = arrays;

        let alloc = &mut *self.alloc;

        for (slot, ref_) in [
            (0, types.ref_()),
            (1, col_names.root_ref()),
            (2, indexes.ref_()),
        ] {
            if spec.get_as_ref(alloc.mapping(), slot) != ref_ {
                spec.set(alloc, slot, ref_ as i64)?;
            }
        }

        for (slot, ref_) in [(0, spec.ref_()), (1, columns.ref_())] {
            if root.get_as_ref(alloc.mapping(), slot) != ref_ {
                root.set(alloc, slot, ref_ as i64)?;
            }
        }

        if self.tables.get_as_ref(alloc.mapping(), table.0) != root.ref_() {
            let new_ref = root.ref_() as i64;
            self.tables.set(alloc, table.0, new_ref)?;
        }

        Ok(())
    }

    /// Persists a column's (and optionally its index's) new root.
    fn store_column_state(
        &mut self,
        id: ColumnId,
        col_root: Ref,
        index_root: Option<Ref>,
    ) -> crate::Result<()> {
        let mut arrays = self.table_arrays(TableId(id.table))?;
        let alloc = &mut *self.alloc;

        if arrays.columns.get_as_ref(alloc.mapping(), id.col) != col_root {
            arrays.columns.set(alloc, id.col, col_root as i64)?;
        }

        if let Some(index_root) = index_root {
            if arrays.indexes.get_as_ref(alloc.mapping(), id.col) != index_root {
                arrays.indexes.set(alloc, id.col, index_root as i64)?;
            }
        }

        self.store_table_arrays(TableId(id.table), arrays)
    }
}

impl Drop for WriteTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.alloc.rollback_transaction();
            self.release_writer_lock();
            log::debug!("Write transaction dropped without commit; rolled back");
        }
    }
}

fn read_lock_pid(file: &std::fs::File, buf: &mut [u8; 8]) -> std::io::Result<()> {
    use std::io::{Read, Seek, SeekFrom};
    let mut f = file;
    f.seek(SeekFrom::Start(0))?;
    f.read_exact(buf)
}

fn write_lock_pid(file: &std::fs::File, pid: u64) -> std::io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    let mut f = file;
    f.seek(SeekFrom::Start(0))?;
    f.write_all(&pid.to_le_bytes())
}

/// Mutable accessor for an integer column
///
/// Every operation immediately persists moved roots back into the table
/// catalog, and keeps the column's hash index (if any) in step.
pub struct IntColumnMut<'t, 'db> {
    txn: &'t mut WriteTransaction<'db>,
    id: ColumnId,
    col: IntColumn,
    index: Option<HashIndex>,
}

impl IntColumnMut<'_, '_> {
    pub fn size(&self) -> crate::Result<usize> {
        self.col.size(self.txn.alloc.mapping())
    }

    pub fn get(&self, ndx: usize) -> crate::Result<i64> {
        self.col.get(self.txn.alloc.mapping(), ndx)
    }

    pub fn add(&mut self, value: i64) -> crate::Result<()> {
        let row = self.size()?;
        self.insert(row, value)
    }

    pub fn insert(&mut self, ndx: usize, value: i64) -> crate::Result<()> {
        let alloc = &mut *self.txn.alloc;
        let is_append = ndx == self.col.size(alloc.mapping())?;

        self.col.insert(alloc, ndx, value)?;

        if let Some(index) = &mut self.index {
            index.insert(alloc, &self.col, ndx as u64, value, 1, is_append)?;
        }

        self.store()
    }

    pub fn set(&mut self, ndx: usize, value: i64) -> crate::Result<()> {
        let alloc = &mut *self.txn.alloc;

        if let Some(index) = &mut self.index {
            // The key changes: pull the old row out (no shifting), put
            // the new one in
            index.erase(alloc, &self.col, ndx as u64, true)?;
            self.col.set(alloc, ndx, value)?;
            index.insert(alloc, &self.col, ndx as u64, value, 1, true)?;
        } else {
            self.col.set(alloc, ndx, value)?;
        }

        self.store()
    }

    pub fn erase(&mut self, ndx: usize) -> crate::Result<()> {
        let alloc = &mut *self.txn.alloc;
        let is_last = ndx + 1 == self.col.size(alloc.mapping())?;

        if let Some(index) = &mut self.index {
            index.erase(alloc, &self.col, ndx as u64, is_last)?;
        }
        self.col.erase(alloc, ndx)?;

        self.store()
    }

    pub fn clear(&mut self) -> crate::Result<()> {
        let alloc = &mut *self.txn.alloc;

        self.col.clear(alloc)?;
        if let Some(index) = &mut self.index {
            index.clear(alloc)?;
        }

        self.store()
    }

    pub fn find_first(&self, value: i64) -> crate::Result<Option<usize>> {
        let mapping = self.txn.alloc.mapping();

        match &self.index {
            Some(index) => Ok(index
                .find_first(mapping, &self.col, value)?
                .map(|r| r as usize)),
            None => self.col.find_first(mapping, value),
        }
    }

    fn store(&mut self) -> crate::Result<()> {
        let col_root = self.col.root_ref();
        let index_root = self.index.as_ref().map(HashIndex::root_ref);
        self.txn.store_column_state(self.id, col_root, index_root)
    }
}

/// Mutable accessor for a string column
pub struct StringColumnMut<'t, 'db> {
    txn: &'t mut WriteTransaction<'db>,
    id: ColumnId,
    col: StringColumn,
    index: Option<HashIndex>,
}

impl StringColumnMut<'_, '_> {
    pub fn size(&self) -> crate::Result<usize> {
        self.col.size(self.txn.alloc.mapping())
    }

    pub fn get(&self, ndx: usize) -> crate::Result<Vec<u8>> {
        Ok(self.col.get(self.txn.alloc.mapping(), ndx)?.to_vec())
    }

    pub fn add(&mut self, value: &[u8]) -> crate::Result<()> {
        let row = self.size()?;
        self.insert(row, value)
    }

    pub fn insert(&mut self, ndx: usize, value: &[u8]) -> crate::Result<()> {
        let alloc = &mut *self.txn.alloc;
        let is_append = ndx == self.col.size(alloc.mapping())?;

        self.col.insert(alloc, ndx, value)?;

        if let Some(index) = &mut self.index {
            let key = string_to_key(value);
            index.insert(alloc, &self.col, ndx as u64, key, 1, is_append)?;
        }

        self.store()
    }

    pub fn set(&mut self, ndx: usize, value: &[u8]) -> crate::Result<()> {
        let alloc = &mut *self.txn.alloc;

        if let Some(index) = &mut self.index {
            index.erase(alloc, &self.col, ndx as u64, true)?;
            self.col.set(alloc, ndx, value)?;
            let key = string_to_key(value);
            index.insert(alloc, &self.col, ndx as u64, key, 1, true)?;
        } else {
            self.col.set(alloc, ndx, value)?;
        }

        self.store()
    }

    pub fn erase(&mut self, ndx: usize) -> crate::Result<()> {
        let alloc = &mut *self.txn.alloc;
        let is_last = ndx + 1 == self.col.size(alloc.mapping())?;

        if let Some(index) = &mut self.index {
            index.erase(alloc, &self.col, ndx as u64, is_last)?;
        }
        self.col.erase(alloc, ndx)?;

        self.store()
    }

    pub fn find_first(&self, value: &[u8]) -> crate::Result<Option<usize>> {
        let mapping = self.txn.alloc.mapping();

        match &self.index {
            Some(index) => Ok(index
                .find_first(mapping, &self.col, string_to_key(value))?
                .map(|r| r as usize)),
            None => self.col.find_first(mapping, value),
        }
    }

    fn store(&mut self) -> crate::Result<()> {
        let col_root = self.col.root_ref();
        let index_root = self.index.as_ref().map(HashIndex::root_ref);
        self.txn.store_column_state(self.id, col_root, index_root)
    }
}

/// Mutable accessor for a binary column
pub struct BinaryColumnMut<'t, 'db> {
    txn: &'t mut WriteTransaction<'db>,
    id: ColumnId,
    col: BinaryColumn,
}

impl BinaryColumnMut<'_, '_> {
    pub fn size(&self) -> crate::Result<usize> {
        self.col.size(self.txn.alloc.mapping())
    }

    pub fn get(&self, ndx: usize) -> crate::Result<Vec<u8>> {
        Ok(self.col.get(self.txn.alloc.mapping(), ndx)?.to_vec())
    }

    pub fn add(&mut self, value: &[u8]) -> crate::Result<()> {
        self.col.add(&mut self.txn.alloc, value)?;
        self.store()
    }

    pub fn insert(&mut self, ndx: usize, value: &[u8]) -> crate::Result<()> {
        self.col.insert(&mut self.txn.alloc, ndx, value)?;
        self.store()
    }

    pub fn set(&mut self, ndx: usize, value: &[u8]) -> crate::Result<()> {
        self.col.set(&mut self.txn.alloc, ndx, value)?;
        self.store()
    }

    pub fn erase(&mut self, ndx: usize) -> crate::Result<()> {
        self.col.erase(&mut self.txn.alloc, ndx)?;
        self.store()
    }

    fn store(&mut self) -> crate::Result<()> {
        let col_root = self.col.root_ref();
        self.txn.store_column_state(self.id, col_root, None)
    }
}
