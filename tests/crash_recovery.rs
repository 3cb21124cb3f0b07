use std::io::{Read, Seek, SeekFrom, Write};
use test_log::test;
use tide_db::{ColumnType, Config};

const FILE_HEADER_SIZE: usize = 24;

/// A crash after writing the new top ref but before flipping the
/// selector leaves the previous commit live and the torn bytes invisible.
#[test]
fn interrupted_commit_is_invisible() -> tide_db::Result<()> {
    let folder = tempfile::tempdir()?;
    let path = folder.path().join("crash.tdb");

    {
        let db = Config::new(&path).open()?;

        let mut txn = db.begin_write()?;
        let table = txn.create_table("t")?;
        let col = txn.add_column(table, ColumnType::Int, "c")?;
        {
            let mut ints = txn.int_column_mut(col)?;
            ints.add(1)?;
            ints.add(2)?;
        }
        txn.commit()?;
    }

    // Hand-craft the crash: append garbage subtrees past the logical end
    // and point the inactive top-ref slot at them, but never flip
    {
        let mut file = std::fs::OpenOptions::new().read(true).write(true).open(&path)?;

        let mut header = [0u8; FILE_HEADER_SIZE];
        file.read_exact(&mut header)?;
        let live_slot = (header[23] & 1) as usize;
        let inactive_slot = 1 - live_slot;

        let garbage_ref = file.metadata()?.len();
        file.seek(SeekFrom::Start(garbage_ref))?;
        file.write_all(&[0xEE; 4096])?;

        file.seek(SeekFrom::Start(inactive_slot as u64 * 8))?;
        file.write_all(&garbage_ref.to_le_bytes())?;
        file.sync_all()?;
    }

    // Reopen: the live top ref is the pre-crash one
    let db = Config::new(&path).open()?;
    let snapshot = db.begin_read()?;

    let ints = snapshot.int_column(snapshot.column(snapshot.table("t")?, "c")?)?;
    assert_eq!(2, ints.size()?);
    assert_eq!(1, ints.get(0)?);
    assert_eq!(2, ints.get(1)?);

    db.verify()?;

    // The torn region beyond the logical size is plain free space: the
    // next commits overwrite it without complaint
    drop(snapshot);
    let col = {
        let read = db.begin_read()?;
        read.column(read.table("t")?, "c")?
    };

    for i in 0..50_i64 {
        let mut txn = db.begin_write()?;
        txn.int_column_mut(col)?.add(i)?;
        txn.commit()?;
    }

    db.verify()?;

    Ok(())
}

/// A torn commit-log append (entry written, selector not flipped) is
/// ignored on restart.
#[test]
fn torn_log_append_is_ignored() -> tide_db::Result<()> {
    let folder = tempfile::tempdir()?;
    let path = folder.path().join("tornlog.tdb");

    {
        let db = Config::new(&path).open()?;

        let mut txn = db.begin_write()?;
        let table = txn.create_table("t")?;
        let col = txn.add_column(table, ColumnType::Int, "c")?;
        txn.int_column_mut(col)?.add(7)?;
        txn.commit()?;

        // Scribble a half-written entry into the active log file without
        // updating any preamble
        let log_a = {
            let mut s = path.as_os_str().to_os_string();
            s.push(".log_a");
            std::path::PathBuf::from(s)
        };
        let mut file = std::fs::OpenOptions::new().write(true).open(log_a)?;
        file.seek(SeekFrom::End(0))?;
        file.write_all(&[0xAB; 100])?;
    }

    // The database reopens at its committed version and keeps logging
    let db = Config::new(&path).open()?;
    assert_eq!(2, db.current_version());

    let col = {
        let read = db.begin_read()?;
        read.column(read.table("t")?, "c")?
    };

    let mut txn = db.begin_write()?;
    txn.int_column_mut(col)?.add(8)?;
    txn.commit()?;

    assert_eq!(1, db.changesets(2, 3)?.len());
    db.verify()?;

    Ok(())
}
