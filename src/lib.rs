// Copyright (c) 2024-present, tide-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! An embedded, memory-mapped, MVCC object database core.
//!
//! ##### NOTE
//!
//! > This crate provides the storage engine and transactional substrate
//! > only: typed columns of rows in a single memory-mapped file, with
//! > crash-safe commits and snapshot isolation. It does not ship a query
//! > engine or schema layer.
//!
//! ##### About
//!
//! All data lives in one file. The file is simultaneously the durable
//! persistence medium and the shared medium through which threads and
//! processes observe a consistent view of the data. Readers pin an
//! immutable snapshot; the single writer mutates copy-on-write shadows
//! and publishes a new snapshot by atomically flipping a selector bit in
//! the file header. A dual-file commit log records every transaction's
//! changeset for crash recovery and replication-style replay.
//!
//! Structures are built from one universal node format: an 8-byte
//! self-describing header plus payload. Packed-bit integer arrays,
//! variable-length string and blob leaves, position-indexed B+-trees and
//! a two-level hash index all share it, so a sequential scan can account
//! for every byte of a database file.
//!
//! # Example usage
//!
//! ```
//! use tide_db::{ColumnType, Config};
//! #
//! # let folder = tempfile::tempdir()?;
//!
//! let db = Config::new(folder.path().join("app.tdb")).open()?;
//!
//! // Writes go through short-lived, serialized transactions
//! let mut txn = db.begin_write()?;
//! let events = txn.create_table("events")?;
//! let counts = txn.add_column(events, ColumnType::Int, "counts")?;
//!
//! {
//!     let mut col = txn.int_column_mut(counts)?;
//!     col.add(1)?;
//!     col.add(2)?;
//!     col.add(3)?;
//! }
//! txn.commit()?;
//!
//! // Readers pin an immutable snapshot
//! let snapshot = db.begin_read()?;
//! let events = snapshot.table("events")?;
//! let counts = snapshot.column(events, "counts")?;
//! let col = snapshot.int_column(counts)?;
//!
//! assert_eq!(3, col.size()?);
//! assert_eq!(2, col.get(1)?);
//! #
//! # Ok::<(), tide_db::Error>(())
//! ```

#![deny(unsafe_code)]
#![deny(clippy::all, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(missing_docs)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::module_name_repetitions)]

#[doc(hidden)]
pub mod alloc;

#[doc(hidden)]
pub mod array;

mod binary_search;

#[doc(hidden)]
pub mod column;

#[doc(hidden)]
pub mod commit_log;

mod config;
mod db;
mod error;

#[doc(hidden)]
pub mod index;

#[doc(hidden)]
pub mod node;

#[doc(hidden)]
pub mod tree;

pub use {
    column::ColumnType,
    commit_log::changeset::Changeset,
    config::{Config, Durability},
    db::{
        BinaryColumnMut, BinaryColumnRead, ColumnId, Database, IntColumnMut, IntColumnRead,
        ReadTransaction, StringColumnMut, StringColumnRead, TableId, WriteTransaction,
    },
    error::{Error, Result},
};

#[doc(hidden)]
pub use alloc::Ref;
