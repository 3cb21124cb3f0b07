// Copyright (c) 2024-present, tide-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The transactional commit log
//!
//! A crash-safe, append-mostly log of per-commit changesets keyed by
//! monotonically increasing version numbers. Two log files take turns
//! being *active* (appended to) and *stale* (readable, awaiting
//! recycling), so appending never needs in-file memory management and a
//! log entry is never split across files.
//!
//! All metadata lives in a small header file holding an inter-process
//! mutex, a selector byte and two preamble records. A commit appends its
//! entry to the active file, writes the updated metadata into the
//! *inactive* preamble, syncs, and only then flips the selector. A crash
//! anywhere in between leaves the old preamble live, and the partially
//! appended bytes are simply ignored.

pub mod changeset;

use crate::{
    config::Durability,
    Error,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use fs4::FileExt;
use std::{
    fs::File,
    io::{Cursor, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

const MAGIC_BYTES: [u8; 4] = [b'T', b'D', b'B', b'L'];
const FORMAT_VERSION: u16 = 1;

/// File and mapping sizes are kept multiples of this
const PAGE_SIZE: u64 = 4096;

/// Byte offsets within the header file
const OFFSET_SELECTOR: u64 = 6;
const OFFSET_OWNER_PID: u64 = 8;
const OFFSET_PREAMBLES: u64 = 16;

const PREAMBLE_SIZE: u64 = 48;
const HEADER_FILE_SIZE: u64 = OFFSET_PREAMBLES + 2 * PREAMBLE_SIZE;

fn align8(value: u64) -> u64 {
    (value + 7) & !7
}

/// One of the two metadata records in the header file
///
/// The log entry recording the change from version `v` to `v + 1` is
/// numbered `v`; `end_commit_range` points one past the last entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Preamble {
    /// Which log file is currently appended to
    pub active_file_is_log_a: bool,

    /// First entry still present (lives in the stale file)
    pub begin_oldest_commit_range: u64,

    /// First entry in the active file
    pub begin_newest_commit_range: u64,

    /// One past the newest entry
    pub end_commit_range: u64,

    /// Append position within the active file, 8-byte aligned
    pub write_offset: u64,

    /// Progress of local consumers; drives recycling
    pub last_version_seen_locally: u64,
}

impl Preamble {
    fn new(version: u64) -> Self {
        Self {
            active_file_is_log_a: true,
            begin_oldest_commit_range: version,
            begin_newest_commit_range: version,
            end_commit_range: version,
            write_offset: 0,
            last_version_seen_locally: version,
        }
    }

    fn decode(bytes: &[u8]) -> crate::Result<Self> {
        let mut reader = Cursor::new(bytes);

        let active = reader.read_u64::<LittleEndian>()?;
        let begin_oldest = reader.read_u64::<LittleEndian>()?;
        let begin_newest = reader.read_u64::<LittleEndian>()?;
        let end = reader.read_u64::<LittleEndian>()?;
        let write_offset = reader.read_u64::<LittleEndian>()?;
        let last_seen = reader.read_u64::<LittleEndian>()?;

        if begin_oldest > begin_newest || begin_newest > end || write_offset & 7 != 0 {
            return Err(Error::Corrupt("commit log preamble out of order"));
        }

        Ok(Self {
            active_file_is_log_a: active != 0,
            begin_oldest_commit_range: begin_oldest,
            begin_newest_commit_range: begin_newest,
            end_commit_range: end,
            write_offset,
            last_version_seen_locally: last_seen,
        })
    }

    fn encode(&self) -> [u8; PREAMBLE_SIZE as usize] {
        let mut bytes = [0u8; PREAMBLE_SIZE as usize];
        let mut writer = Cursor::new(&mut bytes[..]);

        writer
            .write_u64::<LittleEndian>(u64::from(self.active_file_is_log_a))
            .expect("cannot fail");
        writer
            .write_u64::<LittleEndian>(self.begin_oldest_commit_range)
            .expect("cannot fail");
        writer
            .write_u64::<LittleEndian>(self.begin_newest_commit_range)
            .expect("cannot fail");
        writer
            .write_u64::<LittleEndian>(self.end_commit_range)
            .expect("cannot fail");
        writer
            .write_u64::<LittleEndian>(self.write_offset)
            .expect("cannot fail");
        writer
            .write_u64::<LittleEndian>(self.last_version_seen_locally)
            .expect("cannot fail");

        bytes
    }

    /// Index (0 = `log_a`) of the file being appended to.
    fn active_index(&self) -> usize {
        usize::from(!self.active_file_is_log_a)
    }

    fn stale_index(&self) -> usize {
        1 - self.active_index()
    }
}

/// Accessor for the commit log of one database
pub struct CommitLog {
    header_file: Arc<File>,
    log_paths: [PathBuf; 2],
    header_path: PathBuf,
    durability: Durability,

    /// Read-only maps of the two log files, remapped when they grow
    log_maps: [Option<(memmap2::Mmap, u64)>; 2],

    /// Resume point for sequential consumers
    read_version: u64,
    read_offset: u64,
}

/// RAII ownership of the inter-process header mutex
///
/// An owner-pid word backs the file lock: finding it non-zero on acquire
/// means the previous owner died mid-operation. Nothing needs rolling
/// back (the live preamble is self-consistent by construction), so
/// recovery is just taking over.
struct HeaderLock {
    file: Arc<File>,
}

impl HeaderLock {
    fn acquire(file: &Arc<File>) -> crate::Result<Self> {
        file.lock()?;

        let lock = Self {
            file: Arc::clone(file),
        };

        let mut pid_bytes = [0u8; 8];
        read_exact_at(&lock.file, OFFSET_OWNER_PID, &mut pid_bytes)?;
        let owner = u64::from_le_bytes(pid_bytes);

        if owner != 0 && owner != u64::from(std::process::id()) {
            log::warn!("Commit log mutex owner (pid {owner}) died; taking over");

            // Recovery: the live preamble must still parse. If it does
            // not, the header itself is damaged and the caller has to
            // deal with it.
            let mut header = [0u8; HEADER_FILE_SIZE as usize];
            if read_exact_at(&lock.file, 0, &mut header).is_err()
                || header[0..4] != MAGIC_BYTES
            {
                return Err(Error::DeadOwner);
            }
        }

        write_all_at(
            &lock.file,
            OFFSET_OWNER_PID,
            &u64::from(std::process::id()).to_le_bytes(),
        )?;

        Ok(lock)
    }
}

impl Drop for HeaderLock {
    fn drop(&mut self) {
        let _ = write_all_at(&self.file, OFFSET_OWNER_PID, &[0u8; 8]);
        let _ = fs4::FileExt::unlock(&*self.file);
    }
}

impl CommitLog {
    /// Opens the commit log belonging to the database at `db_path`.
    ///
    /// If the log files are missing, damaged, or do not line up with
    /// `current_version`, they are reset to an empty log starting at that
    /// version.
    pub fn open(
        db_path: &Path,
        durability: Durability,
        current_version: u64,
    ) -> crate::Result<Self> {
        let header_path = suffixed(db_path, ".log");
        let log_paths = [suffixed(db_path, ".log_a"), suffixed(db_path, ".log_b")];

        let reuse = durability != Durability::MemOnly
            && match Self::try_attach(&header_path) {
                Some(preamble) => preamble.end_commit_range == current_version,
                None => false,
            };

        let header_file = if reuse {
            std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&header_path)?
        } else {
            log::debug!("Resetting commit log at {header_path:?} (version {current_version})");

            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&header_path)?;
            file.set_len(HEADER_FILE_SIZE)?;

            let mut header = [0u8; HEADER_FILE_SIZE as usize];
            header[0..4].copy_from_slice(&MAGIC_BYTES);
            header[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());

            let preamble = Preamble::new(current_version).encode();
            header[OFFSET_PREAMBLES as usize..OFFSET_PREAMBLES as usize + PREAMBLE_SIZE as usize]
                .copy_from_slice(&preamble);
            header[(OFFSET_PREAMBLES + PREAMBLE_SIZE) as usize..]
                .copy_from_slice(&preamble);

            write_all_at(&file, 0, &header)?;

            for path in &log_paths {
                let log = std::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)?;
                log.set_len(PAGE_SIZE)?;
                if durability == Durability::Full {
                    log.sync_all()?;
                }
            }

            if durability == Durability::Full {
                file.sync_all()?;
            }

            file
        };

        Ok(Self {
            header_file: Arc::new(header_file),
            log_paths,
            header_path,
            durability,
            log_maps: [None, None],
            read_version: 0,
            read_offset: 0,
        })
    }

    fn try_attach(header_path: &Path) -> Option<Preamble> {
        let file = File::open(header_path).ok()?;
        let mut header = [0u8; HEADER_FILE_SIZE as usize];
        read_exact_at(&file, 0, &mut header).ok()?;

        if header[0..4] != MAGIC_BYTES {
            return None;
        }

        let selector = header[OFFSET_SELECTOR as usize] & 1;
        let offset = OFFSET_PREAMBLES + u64::from(selector) * PREAMBLE_SIZE;
        Preamble::decode(&header[offset as usize..(offset + PREAMBLE_SIZE) as usize]).ok()
    }

    /// The currently live preamble.
    pub fn live_preamble(&self) -> crate::Result<Preamble> {
        let _lock = HeaderLock::acquire(&self.header_file)?;
        self.read_live_preamble()
    }

    fn read_live_preamble(&self) -> crate::Result<Preamble> {
        let mut selector = [0u8; 1];
        read_exact_at(&self.header_file, OFFSET_SELECTOR, &mut selector)?;

        let offset = OFFSET_PREAMBLES + u64::from(selector[0] & 1) * PREAMBLE_SIZE;
        let mut bytes = [0u8; PREAMBLE_SIZE as usize];
        read_exact_at(&self.header_file, offset, &mut bytes)?;

        Preamble::decode(&bytes)
    }

    /// Writes `preamble` into the inactive slot, syncs, and flips the
    /// selector. The flip is the publish point.
    fn publish_preamble(&self, preamble: &Preamble) -> crate::Result<()> {
        let mut selector = [0u8; 1];
        read_exact_at(&self.header_file, OFFSET_SELECTOR, &mut selector)?;

        let inactive = (selector[0] & 1) ^ 1;
        let offset = OFFSET_PREAMBLES + u64::from(inactive) * PREAMBLE_SIZE;

        write_all_at(&self.header_file, offset, &preamble.encode())?;
        if self.durability == Durability::Full {
            self.header_file.sync_data()?;
        }

        write_all_at(&self.header_file, OFFSET_SELECTOR, &[inactive])?;
        if self.durability == Durability::Full {
            self.header_file.sync_data()?;
        }

        Ok(())
    }

    /// Appends the changeset taking the database from `from_version` to
    /// `from_version + 1`; returns the new version.
    pub fn append(&mut self, payload: &[u8], from_version: u64) -> crate::Result<u64> {
        let _lock = HeaderLock::acquire(&self.header_file)?;

        let mut preamble = self.read_live_preamble()?;

        if preamble.end_commit_range != from_version {
            return Err(Error::Logic("commit log version mismatch"));
        }

        let active = &self.log_paths[preamble.active_index()];
        let log_file = std::fs::OpenOptions::new().read(true).write(true).open(active)?;

        // Grow the active file if the entry does not fit
        let entry_span = align8(8 + payload.len() as u64);
        let size_needed = (preamble.write_offset + entry_span + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);

        if size_needed > log_file.metadata()?.len() {
            log_file.set_len(size_needed)?;
            if self.durability == Durability::Full {
                log_file.sync_all()?;
            }
        }

        // Entry: size, payload, zero padding to 8 bytes
        let mut entry = Vec::with_capacity(entry_span as usize);
        entry.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        entry.extend_from_slice(payload);
        entry.resize(entry_span as usize, 0);

        write_all_at(&log_file, preamble.write_offset, &entry)?;
        if self.durability == Durability::Full {
            log_file.sync_data()?;
        }

        preamble.write_offset += entry_span;
        preamble.end_commit_range += 1;

        self.publish_preamble(&preamble)?;

        log::trace!(
            "Appended commit log entry {} ({} bytes)",
            from_version,
            payload.len(),
        );

        Ok(preamble.end_commit_range)
    }

    /// Collects the changesets for versions `[from, to)`, oldest first.
    pub fn get_changesets(&mut self, from: u64, to: u64) -> crate::Result<Vec<Vec<u8>>> {
        let _lock = HeaderLock::acquire(&self.header_file)?;

        let preamble = self.read_live_preamble()?;

        if from < preamble.begin_oldest_commit_range || to > preamble.end_commit_range {
            return Err(Error::Logic("requested versions outside the commit log"));
        }
        if from >= to {
            return Ok(Vec::new());
        }

        self.remap_log(0)?;
        self.remap_log(1)?;

        let mut read_version = self.read_version;
        let mut read_offset = self.read_offset;

        // Reset the resume point unless we continue right where we left off
        if read_version != from || read_version < preamble.begin_oldest_commit_range {
            read_version = preamble.begin_oldest_commit_range;
            read_offset = 0;
        }

        let mut current = self.log_map(preamble.stale_index());
        let mut second = Some(self.log_map(preamble.active_index()));

        // Resuming directly in the active file keeps the saved offset
        if read_version >= preamble.begin_newest_commit_range {
            current = second.take().expect("second file not yet consumed");
        }

        let mut out = Vec::with_capacity((to - from) as usize);

        // The resume point is only advanced when it stays valid for a
        // later call; reading past the final entry or into a recycled
        // file must not poison it
        loop {
            if second.is_some() && read_version >= preamble.begin_newest_commit_range {
                current = second.take().expect("checked above");
                read_offset = 0;
            }

            if read_version >= to {
                break;
            }

            let offset = read_offset as usize;
            let size_bytes = current
                .get(offset..offset + 8)
                .ok_or(Error::Corrupt("commit log entry out of bounds"))?;
            let size = u64::from_le_bytes(size_bytes.try_into().expect("slice length is 8"));

            if read_version >= from {
                let payload = current
                    .get(offset + 8..offset + 8 + size as usize)
                    .ok_or(Error::Corrupt("commit log entry out of bounds"))?;
                out.push(payload.to_vec());
            }

            if read_version + 1 >= preamble.end_commit_range {
                break;
            }

            read_offset += 8 + align8(size);
            read_version += 1;
        }

        self.read_version = read_version;
        self.read_offset = read_offset;

        Ok(out)
    }

    /// Records consumer progress; once the stale file holds only consumed
    /// entries it is recycled (and shrunk, if oversized).
    pub fn set_last_version_seen_locally(&mut self, version: u64) -> crate::Result<()> {
        let _lock = HeaderLock::acquire(&self.header_file)?;

        let mut preamble = self.read_live_preamble()?;
        preamble.last_version_seen_locally = version;

        if version >= preamble.begin_newest_commit_range {
            preamble.active_file_is_log_a = !preamble.active_file_is_log_a;
            preamble.begin_oldest_commit_range = preamble.begin_newest_commit_range;
            preamble.begin_newest_commit_range = preamble.end_commit_range;
            preamble.write_offset = 0;

            // Shrink the recycled file by a quarter when it has ballooned
            let path = &self.log_paths[preamble.active_index()];
            let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;

            let mut pages = file.metadata()?.len() / PAGE_SIZE;
            if pages > 4 {
                pages -= pages / 4;
                file.set_len(pages * PAGE_SIZE)?;
                if self.durability == Durability::Full {
                    file.sync_all()?;
                }
                self.log_maps[preamble.active_index()] = None;
            }

            log::trace!(
                "Recycled commit log file; entries now start at {}",
                preamble.begin_oldest_commit_range,
            );
        }

        self.publish_preamble(&preamble)
    }

    /// Deletes all log files; used when an ephemeral database closes.
    pub fn remove_files(&self) {
        for path in self.log_paths.iter().chain([&self.header_path]) {
            if let Err(e) = std::fs::remove_file(path) {
                log::warn!("Could not remove commit log file {path:?}: {e}");
            }
        }
    }

    fn remap_log(&mut self, index: usize) -> crate::Result<()> {
        let len = std::fs::metadata(&self.log_paths[index])?.len();

        let stale = match &self.log_maps[index] {
            Some((_, mapped_len)) => *mapped_len != len,
            None => true,
        };

        if stale {
            let file = File::open(&self.log_paths[index])?;

            // SAFETY: The log files only ever grow in place (truncation
            // invalidates the cached map above before the next read), and
            // readers copy entries out before releasing the header mutex
            #[expect(unsafe_code, reason = "see safety")]
            let map = unsafe { memmap2::Mmap::map(&file) }.map_err(|_| Error::OutOfMemory)?;

            self.log_maps[index] = Some((map, len));
        }

        Ok(())
    }

    fn log_map(&self, index: usize) -> &[u8] {
        self.log_maps[index]
            .as_ref()
            .map(|(m, _)| &m[..])
            .expect("log files are mapped before reading")
    }
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

fn read_exact_at(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    let mut f = file;
    f.seek(SeekFrom::Start(offset))?;
    f.read_exact(buf)
}

fn write_all_at(file: &File, offset: u64, buf: &[u8]) -> std::io::Result<()> {
    let mut f = file;
    f.seek(SeekFrom::Start(offset))?;
    f.write_all(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn open_log(dir: &tempfile::TempDir, version: u64) -> crate::Result<CommitLog> {
        CommitLog::open(&dir.path().join("test.tdb"), Durability::Full, version)
    }

    #[test]
    fn log_append_and_read_back() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut log = open_log(&dir, 1)?;

        assert_eq!(2, log.append(b"first", 1)?);
        assert_eq!(3, log.append(b"second", 2)?);
        assert_eq!(4, log.append(b"third", 3)?);

        let entries = log.get_changesets(1, 4)?;
        assert_eq!(
            vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()],
            entries,
        );

        // Sequential consumption hits the cached resume point
        let tail = log.get_changesets(3, 4)?;
        assert_eq!(vec![b"third".to_vec()], tail);

        Ok(())
    }

    #[test]
    fn log_version_mismatch_is_rejected() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut log = open_log(&dir, 1)?;

        log.append(b"x", 1)?;

        assert!(matches!(
            log.append(b"y", 5),
            Err(Error::Logic(_))
        ));

        Ok(())
    }

    #[test]
    fn log_survives_reopen() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        {
            let mut log = open_log(&dir, 1)?;
            log.append(b"persisted", 1)?;
        }

        let mut log = open_log(&dir, 2)?;
        assert_eq!(vec![b"persisted".to_vec()], log.get_changesets(1, 2)?);

        Ok(())
    }

    #[test]
    fn log_reopen_with_wrong_version_resets() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        {
            let mut log = open_log(&dir, 1)?;
            log.append(b"stale", 1)?;
        }

        // The database is at version 9; the old log cannot serve it
        let log = open_log(&dir, 9)?;
        let preamble = log.live_preamble()?;

        assert_eq!(9, preamble.begin_oldest_commit_range);
        assert_eq!(9, preamble.end_commit_range);

        Ok(())
    }

    #[test]
    fn log_recycles_consumed_file() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut log = open_log(&dir, 1)?;

        for v in 1..6 {
            log.append(format!("entry-{v}").as_bytes(), v)?;
        }

        // Everything up to version 6 has been seen locally; the stale
        // file flips to active and starts fresh
        log.set_last_version_seen_locally(6)?;

        let preamble = log.live_preamble()?;
        assert!(!preamble.active_file_is_log_a);
        assert_eq!(0, preamble.write_offset);
        assert_eq!(6, preamble.begin_newest_commit_range);

        // New entries land in the recycled file; old ones are gone
        log.append(b"after-recycle", 6)?;
        let entries = log.get_changesets(6, 7)?;
        assert_eq!(vec![b"after-recycle".to_vec()], entries);

        Ok(())
    }

    #[test]
    fn log_entries_are_padded_to_8_bytes() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut log = open_log(&dir, 1)?;

        log.append(b"abc", 1)?;
        log.append(b"defghijklmn", 2)?;

        let preamble = log.live_preamble()?;

        // 8 + 3 -> 16, 8 + 11 -> 24
        assert_eq!(40, preamble.write_offset);

        assert_eq!(
            vec![b"abc".to_vec(), b"defghijklmn".to_vec()],
            log.get_changesets(1, 3)?,
        );

        Ok(())
    }

    #[test]
    fn log_dead_owner_is_recovered() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut log = open_log(&dir, 1)?;
        log.append(b"x", 1)?;

        // Simulate a crashed holder: stale pid left in the header
        write_all_at(&log.header_file, OFFSET_OWNER_PID, &u64::MAX.to_le_bytes())?;

        // The next operation takes over and proceeds normally
        assert_eq!(3, log.append(b"y", 2)?);

        Ok(())
    }
}
