// Copyright (c) 2024-present, tide-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The transactional surface
//!
//! A [`Database`] hands out read-only snapshots and serialized write
//! transactions over one backing file. Readers pin the version they
//! captured so its pages cannot be recycled underneath them; the single
//! writer works copy-on-write beside them and publishes a new snapshot
//! with one atomic selector flip.

pub mod group;
mod verify;
mod write;

pub use write::{
    BinaryColumnMut, IntColumnMut, StringColumnMut, WriteTransaction,
};

use crate::{
    alloc::{file_header::FileHeader, Mapping, Ref, SlabAlloc, FILE_HEADER_SIZE},
    array::Array,
    column::{BinaryColumn, ColumnType, IntColumn, StringColumn},
    commit_log::{changeset::Changeset, CommitLog},
    config::{Config, Durability},
    db::group::GroupInfo,
    index::HashIndex,
    Error,
};
use rustc_hash::FxHashMap;
use std::{
    fs::File,
    path::Path,
    sync::{Arc, Mutex, RwLock},
};

/// Identifies a table within its database
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TableId(pub(crate) usize);

/// Identifies a column within its table, with its payload type
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ColumnId {
    pub(crate) table: usize,
    pub(crate) col: usize,
    pub(crate) ty: ColumnType,
}

/// An embedded, memory-mapped, MVCC object database
///
/// Cheap to clone handles are not provided; share the `Database` itself
/// behind an `Arc` if multiple threads open transactions.
pub struct Database {
    inner: Arc<DbInner>,
}

pub(crate) struct DbInner {
    pub(crate) config: Config,
    pub(crate) alloc: Mutex<SlabAlloc>,
    pub(crate) mapping: Arc<RwLock<Mapping>>,
    pub(crate) commit_log: Mutex<CommitLog>,
    pub(crate) state: Mutex<DbState>,
    pub(crate) writer_lock: File,
}

pub(crate) struct DbState {
    pub(crate) version: u64,
    pub(crate) top_ref: Ref,

    /// How many open readers pin each version
    pub(crate) reader_pins: FxHashMap<u64, usize>,
}

impl DbState {
    /// The oldest snapshot any reader still holds; free spans younger
    /// than this stay untouchable.
    pub(crate) fn oldest_pinned(&self) -> u64 {
        self.reader_pins
            .keys()
            .copied()
            .min()
            .unwrap_or(self.version)
    }
}

impl Database {
    /// Opens the database described by `config`.
    pub fn open(config: Config) -> crate::Result<Self> {
        let mut alloc = SlabAlloc::open(&config)?;
        let mapping = alloc.shared_mapping();

        let top_ref = alloc.top_ref()?;
        let version = if top_ref == 0 {
            1
        } else {
            let group = GroupInfo::read(alloc.mapping(), top_ref)?;
            alloc.set_logical_size(group.logical_size)?;
            group.version
        };

        let commit_log = CommitLog::open(&config.path, config.durability, version)?;

        let writer_lock = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(lock_path(&config.path))?;
        writer_lock.set_len(8)?;

        log::debug!(
            "Opened database {:?} at version {version} (top ref {top_ref})",
            config.path,
        );

        Ok(Self {
            inner: Arc::new(DbInner {
                config,
                alloc: Mutex::new(alloc),
                mapping,
                commit_log: Mutex::new(commit_log),
                state: Mutex::new(DbState {
                    version,
                    top_ref,
                    reader_pins: FxHashMap::default(),
                }),
                writer_lock,
            }),
        })
    }

    pub(crate) fn inner(&self) -> &Arc<DbInner> {
        &self.inner
    }

    /// The most recently committed version.
    pub fn current_version(&self) -> u64 {
        self.inner.state.lock().expect("lock is not poisoned").version
    }

    /// Opens a read-only snapshot of the most recent commit.
    ///
    /// Never blocks on the writer; the snapshot stays stable until the
    /// handle is dropped.
    pub fn begin_read(&self) -> crate::Result<ReadTransaction> {
        loop {
            let mapping = self.inner.mapping_snapshot();

            let header_bytes = mapping.slice(0, FILE_HEADER_SIZE);
            let header =
                FileHeader::decode(header_bytes.try_into().expect("slice length is 24"))?;

            let mut state = self.inner.state.lock().expect("lock is not poisoned");

            if header.live_top_ref() != state.top_ref {
                // Another process committed; adopt its snapshot
                drop(state);
                self.inner.adopt_external_commit()?;
                continue;
            }

            let top_ref = state.top_ref;
            let version = state.version;

            // Read the group before taking the pin, so an error here
            // cannot leak one
            let group = if top_ref == 0 {
                None
            } else {
                Some(GroupInfo::read(&mapping, top_ref)?)
            };

            *state.reader_pins.entry(version).or_insert(0) += 1;
            drop(state);

            return Ok(ReadTransaction {
                inner: Arc::clone(&self.inner),
                mapping,
                top_ref,
                version,
                group,
            });
        }
    }

    /// Collects the decoded changesets for versions `[from, to)`.
    pub fn changesets(&self, from: u64, to: u64) -> crate::Result<Vec<Changeset>> {
        let mut log = self.inner.commit_log.lock().expect("lock is not poisoned");

        log.get_changesets(from, to)?
            .into_iter()
            .map(|bytes| Changeset::decode_from(&mut &bytes[..]))
            .collect()
    }

    /// Reports that every local consumer has seen all changesets up to
    /// and including `version`; drives commit log recycling.
    pub fn mark_changesets_consumed(&self, version: u64) -> crate::Result<()> {
        self.inner
            .commit_log
            .lock()
            .expect("lock is not poisoned")
            .set_last_version_seen_locally(version)
    }

    /// Walks the whole committed state and checks the structural
    /// invariants: node headers, tree counts, string offsets, index
    /// membership, and that reachable nodes plus the free list tile the
    /// file exactly.
    pub fn verify(&self) -> crate::Result<()> {
        let txn = self.begin_read()?;
        verify::verify_snapshot(&txn)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if self.inner.config.durability == Durability::MemOnly {
            if let Ok(log) = self.inner.commit_log.lock() {
                log.remove_files();
            }
            if let Err(e) = std::fs::remove_file(lock_path(&self.inner.config.path)) {
                log::warn!("Could not remove writer lock file: {e}");
            }
        }
    }
}

impl DbInner {
    pub(crate) fn mapping_snapshot(&self) -> Mapping {
        self.mapping.read().expect("lock is not poisoned").clone()
    }

    /// Re-reads the on-file state after another process committed.
    fn adopt_external_commit(&self) -> crate::Result<()> {
        let mut alloc = self.alloc.lock().expect("lock is not poisoned");
        alloc.refresh_mapping()?;

        let top_ref = alloc.top_ref()?;
        if top_ref != 0 {
            let group = GroupInfo::read(alloc.mapping(), top_ref)?;
            alloc.set_logical_size(group.logical_size)?;

            let mut state = self.state.lock().expect("lock is not poisoned");
            state.top_ref = top_ref;
            state.version = group.version;
        }

        Ok(())
    }
}

fn lock_path(db_path: &Path) -> std::path::PathBuf {
    let mut s = db_path.as_os_str().to_os_string();
    s.push(".lock");
    std::path::PathBuf::from(s)
}

/// A pinned read-only snapshot
///
/// Reads resolve against the version captured at creation; commits made
/// afterwards are invisible. Dropping the handle releases the pin.
pub struct ReadTransaction {
    inner: Arc<DbInner>,
    mapping: Mapping,
    top_ref: Ref,
    version: u64,
    group: Option<GroupInfo>,
}

impl ReadTransaction {
    /// The snapshot's version.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    pub(crate) fn group(&self) -> Option<&GroupInfo> {
        self.group.as_ref()
    }

    pub(crate) fn top_ref(&self) -> Ref {
        self.top_ref
    }

    /// Looks a table up by name.
    pub fn table(&self, name: &str) -> crate::Result<TableId> {
        let group = self.group.as_ref().ok_or(Error::Logic("no such table"))?;

        let names = StringColumn::attach(&self.mapping, group.table_names_ref)?;
        names
            .find_first(&self.mapping, name.as_bytes())?
            .map(TableId)
            .ok_or(Error::Logic("no such table"))
    }

    /// Number of tables in the snapshot.
    pub fn table_count(&self) -> crate::Result<usize> {
        match &self.group {
            Some(group) => {
                StringColumn::attach(&self.mapping, group.table_names_ref)?.size(&self.mapping)
            }
            None => Ok(0),
        }
    }

    /// Looks a column up by name within a table.
    pub fn column(&self, table: TableId, name: &str) -> crate::Result<ColumnId> {
        let arrays = self.table_arrays(table)?;

        let col = arrays
            .col_names
            .find_first(&self.mapping, name.as_bytes())?
            .ok_or(Error::Logic("no such column"))?;

        let ty = ColumnType::try_from(arrays.types.get(&self.mapping, col))?;

        Ok(ColumnId {
            table: table.0,
            col,
            ty,
        })
    }

    pub fn int_column(&self, id: ColumnId) -> crate::Result<IntColumnRead<'_>> {
        if id.ty != ColumnType::Int {
            return Err(Error::Logic("column is not an integer column"));
        }

        let (col_ref, index) = self.column_parts(id)?;

        Ok(IntColumnRead {
            mapping: &self.mapping,
            col: IntColumn::attach(&self.mapping, col_ref)?,
            index,
        })
    }

    pub fn string_column(&self, id: ColumnId) -> crate::Result<StringColumnRead<'_>> {
        if id.ty != ColumnType::String {
            return Err(Error::Logic("column is not a string column"));
        }

        let (col_ref, index) = self.column_parts(id)?;

        Ok(StringColumnRead {
            mapping: &self.mapping,
            col: StringColumn::attach(&self.mapping, col_ref)?,
            index,
        })
    }

    pub fn binary_column(&self, id: ColumnId) -> crate::Result<BinaryColumnRead<'_>> {
        if id.ty != ColumnType::Binary {
            return Err(Error::Logic("column is not a binary column"));
        }

        let (col_ref, _) = self.column_parts(id)?;

        Ok(BinaryColumnRead {
            mapping: &self.mapping,
            col: BinaryColumn::attach(&self.mapping, col_ref)?,
        })
    }

    pub(crate) fn table_arrays(&self, table: TableId) -> crate::Result<TableArrays> {
        let group = self.group.as_ref().ok_or(Error::Logic("no such table"))?;

        let roots = Array::attach(&self.mapping, group.table_roots_ref)?;
        if table.0 >= roots.size() {
            return Err(Error::Logic("no such table"));
        }

        attach_table(&self.mapping, roots.get_as_ref(&self.mapping, table.0))
    }

    fn column_parts(&self, id: ColumnId) -> crate::Result<(Ref, Option<HashIndex>)> {
        let arrays = self.table_arrays(TableId(id.table))?;

        if id.col >= arrays.columns.size() {
            return Err(Error::Logic("no such column"));
        }

        let col_ref = arrays.columns.get_as_ref(&self.mapping, id.col);

        let index_ref = arrays.indexes.get_as_ref(&self.mapping, id.col);
        let index = if index_ref == 0 {
            None
        } else {
            Some(HashIndex::attach(&self.mapping, index_ref)?)
        };

        Ok((col_ref, index))
    }
}

impl Drop for ReadTransaction {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock().expect("lock is not poisoned");

        if let Some(count) = state.reader_pins.get_mut(&self.version) {
            *count -= 1;
            if *count == 0 {
                state.reader_pins.remove(&self.version);
            }
        }
    }
}

/// Read accessor for an integer column
pub struct IntColumnRead<'r> {
    mapping: &'r Mapping,
    col: IntColumn,
    index: Option<HashIndex>,
}

impl IntColumnRead<'_> {
    pub fn size(&self) -> crate::Result<usize> {
        self.col.size(self.mapping)
    }

    pub fn get(&self, ndx: usize) -> crate::Result<i64> {
        self.col.get(self.mapping, ndx)
    }

    /// Row of the first occurrence of `value`; uses the hash index when
    /// the column has one.
    pub fn find_first(&self, value: i64) -> crate::Result<Option<usize>> {
        match &self.index {
            Some(index) => Ok(index
                .find_first(self.mapping, &self.col, value)?
                .map(|r| r as usize)),
            None => self.col.find_first(self.mapping, value),
        }
    }

    pub fn find_all(&self, value: i64) -> crate::Result<Vec<usize>> {
        match &self.index {
            Some(index) => Ok(index
                .find_all(self.mapping, &self.col, value)?
                .into_iter()
                .map(|r| r as usize)
                .collect()),
            None => self.col.find_all(self.mapping, value),
        }
    }
}

/// Read accessor for a string column
pub struct StringColumnRead<'r> {
    mapping: &'r Mapping,
    col: StringColumn,
    index: Option<HashIndex>,
}

impl<'r> StringColumnRead<'r> {
    pub fn size(&self) -> crate::Result<usize> {
        self.col.size(self.mapping)
    }

    pub fn get(&self, ndx: usize) -> crate::Result<&'r [u8]> {
        self.col.get(self.mapping, ndx)
    }

    pub fn find_first(&self, value: &[u8]) -> crate::Result<Option<usize>> {
        match &self.index {
            Some(index) => {
                let key = crate::index::string_to_key(value);
                Ok(index
                    .find_first(self.mapping, &self.col, key)?
                    .map(|r| r as usize))
            }
            None => self.col.find_first(self.mapping, value),
        }
    }
}

/// Read accessor for a binary column
pub struct BinaryColumnRead<'r> {
    mapping: &'r Mapping,
    col: BinaryColumn,
}

impl<'r> BinaryColumnRead<'r> {
    pub fn size(&self) -> crate::Result<usize> {
        self.col.size(self.mapping)
    }

    pub fn get(&self, ndx: usize) -> crate::Result<&'r [u8]> {
        self.col.get(self.mapping, ndx)
    }
}

/// Accessors for the persisted arrays of one table
///
/// Layout: `root = [spec, columns]`,
/// `spec = [types, column names, index roots]`.
pub(crate) struct TableArrays {
    pub root: Array,
    pub spec: Array,
    pub types: Array,
    pub col_names: StringColumn,
    pub indexes: Array,
    pub columns: Array,
}

pub(crate) fn attach_table(mapping: &Mapping, table_ref: Ref) -> crate::Result<TableArrays> {
    let root = Array::attach(mapping, table_ref)?;

    if !root.has_refs() || root.size() != 2 {
        return Err(Error::Corrupt("malformed table root"));
    }

    let spec = Array::attach(mapping, root.get_as_ref(mapping, 0))?;
    let columns = Array::attach(mapping, root.get_as_ref(mapping, 1))?;

    if !spec.has_refs() || spec.size() != 3 {
        return Err(Error::Corrupt("malformed table spec"));
    }

    let types = Array::attach(mapping, spec.get_as_ref(mapping, 0))?;
    let col_names = StringColumn::attach(mapping, spec.get_as_ref(mapping, 1))?;
    let indexes = Array::attach(mapping, spec.get_as_ref(mapping, 2))?;

    Ok(TableArrays {
        root,
        spec,
        types,
        col_names,
        indexes,
        columns,
    })
}
