// Copyright (c) 2024-present, tide-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::Database;
use std::path::{Path, PathBuf};

/// When (and whether) committed data is synced to stable storage
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Durability {
    /// `fsync` on every commit; a committed transaction survives power loss
    Full,

    /// The backing file is truncated on open, never synced and removed on
    /// final close; the database only lives as long as the process
    MemOnly,

    /// No syncs, but the file is persisted
    ///
    /// Only meant for development and testing.
    Unsafe,
}

/// Database configuration builder
#[derive(Clone, Debug)]
pub struct Config {
    /// Path of the database file
    pub(crate) path: PathBuf,

    /// Sync behavior on commit
    pub(crate) durability: Durability,
}

impl Config {
    /// Initializes a new configuration for the database at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().into(),
            durability: Durability::Full,
        }
    }

    /// Sets the durability mode.
    ///
    /// Default: [`Durability::Full`]
    #[must_use]
    pub fn durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    /// Opens the database.
    ///
    /// # Errors
    ///
    /// Returns error if an I/O error occurs or the file is not a valid
    /// database file.
    pub fn open(self) -> crate::Result<Database> {
        Database::open(self)
    }
}
