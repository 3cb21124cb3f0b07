// Copyright (c) 2024-present, tide-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Represents errors that can occur in the database core
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// The file is not a database file, or a reachable structure is damaged
    ///
    /// Carries a short description of the check that failed.
    Corrupt(&'static str),

    /// Invalid or unsupported on-disk format version
    InvalidVersion(u16),

    /// An allocation request could not be satisfied
    OutOfMemory,

    /// API misuse, e.g. mutating through a read-only transaction or
    /// indexing out of range
    ///
    /// Persistent state is never altered by a `Logic` error.
    Logic(&'static str),

    /// The previous holder of the inter-process writer lock died
    ///
    /// Recovery has already been performed; retry the operation once.
    DeadOwner,

    /// A long-running operation was cancelled through its handle
    Interrupted,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TideDbError: {self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Database result
pub type Result<T> = std::result::Result<T, Error>;
