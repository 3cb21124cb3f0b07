use test_log::test;
use tide_db::{ColumnType, Config};

#[test]
fn reader_keeps_its_snapshot() -> tide_db::Result<()> {
    let folder = tempfile::tempdir()?;
    let path = folder.path().join("mvcc.tdb");

    let db = Config::new(&path).open()?;

    let mut txn = db.begin_write()?;
    let table = txn.create_table("t")?;
    let col = txn.add_column(table, ColumnType::Int, "c")?;
    txn.int_column_mut(col)?.add(1)?;
    txn.commit()?;

    // Pin a snapshot, then overwrite the value behind its back
    let pinned = db.begin_read()?;

    let mut txn = db.begin_write()?;
    txn.int_column_mut(col)?.set(0, 99)?;
    txn.commit()?;

    let ints = pinned.int_column(pinned.column(pinned.table("t")?, "c")?)?;
    assert_eq!(1, ints.get(0)?);

    // A fresh snapshot sees the new value
    drop(ints);
    drop(pinned);

    let fresh = db.begin_read()?;
    let ints = fresh.int_column(fresh.column(fresh.table("t")?, "c")?)?;
    assert_eq!(99, ints.get(0)?);

    Ok(())
}

#[test]
fn two_handles_on_one_file() -> tide_db::Result<()> {
    let folder = tempfile::tempdir()?;
    let path = folder.path().join("shared.tdb");

    // Two independently opened handles, as two processes would have
    let db1 = Config::new(&path).open()?;
    let db2 = Config::new(&path).open()?;

    let mut txn = db1.begin_write()?;
    let table = txn.create_table("t")?;
    let col = txn.add_column(table, ColumnType::Int, "c")?;
    txn.int_column_mut(col)?.add(1)?;
    txn.commit()?;

    // Handle 2 pins the state committed by handle 1
    let pinned = db2.begin_read()?;
    let ints = pinned.int_column(pinned.column(pinned.table("t")?, "c")?)?;
    assert_eq!(1, ints.get(0)?);

    // Handle 1 commits again while handle 2 still reads
    let mut txn = db1.begin_write()?;
    txn.int_column_mut(col)?.set(0, 99)?;
    txn.commit()?;

    assert_eq!(1, ints.get(0)?);

    drop(ints);
    drop(pinned);

    let fresh = db2.begin_read()?;
    let ints = fresh.int_column(fresh.column(fresh.table("t")?, "c")?)?;
    assert_eq!(99, ints.get(0)?);

    // And the write lock moves between handles, too
    let mut txn = db2.begin_write()?;
    txn.int_column_mut(col)?.set(0, 100)?;
    txn.commit()?;

    let check = db1.begin_read()?;
    let ints = check.int_column(check.column(check.table("t")?, "c")?)?;
    assert_eq!(100, ints.get(0)?);

    db1.verify()?;
    db2.verify()?;

    Ok(())
}

#[test]
fn writer_does_not_block_readers() -> tide_db::Result<()> {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    let folder = tempfile::tempdir()?;
    let db = Arc::new(Config::new(folder.path().join("mt.tdb")).open()?);

    let mut txn = db.begin_write()?;
    let table = txn.create_table("t")?;
    let col = txn.add_column(table, ColumnType::Int, "c")?;
    for i in 0..100 {
        txn.int_column_mut(col)?.add(i)?;
    }
    txn.commit()?;

    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let db = Arc::clone(&db);
            let stop = Arc::clone(&stop);

            std::thread::spawn(move || -> tide_db::Result<()> {
                while !stop.load(Ordering::Relaxed) {
                    let snapshot = db.begin_read()?;
                    let ints =
                        snapshot.int_column(snapshot.column(snapshot.table("t")?, "c")?)?;

                    // Within one snapshot, the column is always coherent:
                    // values are appended in sequence, so the last one
                    // always matches the size
                    let size = ints.size()?;
                    assert!(size >= 100);
                    assert_eq!(0, ints.get(0)?);
                    assert_eq!(size as i64 - 1, ints.get(size - 1)?);
                }
                Ok(())
            })
        })
        .collect();

    for i in 0..50_i64 {
        let mut txn = db.begin_write()?;
        txn.int_column_mut(col)?.add(100 + i)?;
        txn.commit()?;
    }

    stop.store(true, Ordering::Relaxed);
    for handle in readers {
        handle.join().expect("reader thread panicked")?;
    }

    db.verify()?;

    Ok(())
}

#[test]
fn pinned_snapshot_pages_are_not_recycled() -> tide_db::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(folder.path().join("pin.tdb")).open()?;

    let mut txn = db.begin_write()?;
    let table = txn.create_table("t")?;
    let col = txn.add_column(table, ColumnType::String, "c")?;
    for i in 0..200 {
        txn.string_column_mut(col)?.add(format!("value-{i}").as_bytes())?;
    }
    txn.commit()?;

    let pinned = db.begin_read()?;

    // Heavy churn: every commit frees the previous version's pages
    for round in 0..10 {
        let mut txn = db.begin_write()?;
        {
            let mut strings = txn.string_column_mut(col)?;
            for i in 0..200 {
                strings.set(i, format!("round-{round}-{i}").as_bytes())?;
            }
        }
        txn.commit()?;
    }

    // The pinned snapshot still reads its original bytes
    let strings = pinned.string_column(pinned.column(pinned.table("t")?, "c")?)?;
    for i in 0..200 {
        assert_eq!(format!("value-{i}").as_bytes(), strings.get(i)?);
    }

    Ok(())
}
