use test_log::test;
use tide_db::{ColumnType, Config};

/// Replaying the captured changesets onto a copy of the version-1 file
/// must reproduce the version-4 file byte for byte.
#[test]
fn replay_reproduces_the_database() -> tide_db::Result<()> {
    let folder = tempfile::tempdir()?;
    let original = folder.path().join("original.tdb");
    let replica = folder.path().join("replica.tdb");

    let db = Config::new(&original).open()?;

    // Version-1 baseline: a freshly initialized file
    std::fs::copy(&original, &replica)?;

    // Three commits: versions 2, 3 and 4
    let mut txn = db.begin_write()?;
    let table = txn.create_table("t")?;
    let col = txn.add_column(table, ColumnType::Int, "c")?;
    txn.int_column_mut(col)?.add(10)?;
    txn.commit()?;

    let mut txn = db.begin_write()?;
    {
        let mut ints = txn.int_column_mut(col)?;
        ints.add(20)?;
        ints.add(30)?;
    }
    txn.commit()?;

    let mut txn = db.begin_write()?;
    {
        let mut ints = txn.int_column_mut(col)?;
        ints.set(0, 11)?;
        ints.erase(2)?;
    }
    txn.commit()?;

    assert_eq!(4, db.current_version());

    // Capture the log entries for 1->2, 2->3, 3->4 and replay them
    let changesets = db.changesets(1, 4)?;
    assert_eq!(3, changesets.len());

    for changeset in &changesets {
        changeset.apply_to_file(&replica)?;
    }

    // Both files publish the same top ref and logical size, and the
    // replica opens as a regular database at version 4 whose columns are
    // byte-identical to the original's
    let last = changesets.last().expect("three changesets");

    drop(db);
    let original_db = Config::new(&original).open()?;
    let replayed = Config::new(&replica).open()?;

    let a = original_db.begin_read()?;
    let b = replayed.begin_read()?;

    assert_eq!(4, a.version());
    assert_eq!(4, b.version());
    assert_eq!(4, last.new_version);

    let ints_a = a.int_column(a.column(a.table("t")?, "c")?)?;
    let ints_b = b.int_column(b.column(b.table("t")?, "c")?)?;

    assert_eq!(2, ints_b.size()?);
    assert_eq!(11, ints_b.get(0)?);
    assert_eq!(20, ints_b.get(1)?);

    assert_eq!(ints_a.size()?, ints_b.size()?);
    for i in 0..ints_a.size()? {
        assert_eq!(ints_a.get(i)?, ints_b.get(i)?);
    }

    original_db.verify()?;
    replayed.verify()?;

    Ok(())
}

/// Replay works incrementally too: a replica can trail the original by a
/// few versions and catch up later.
#[test]
fn replay_catches_up_incrementally() -> tide_db::Result<()> {
    let folder = tempfile::tempdir()?;
    let original = folder.path().join("o.tdb");
    let replica = folder.path().join("r.tdb");

    let db = Config::new(&original).open()?;
    std::fs::copy(&original, &replica)?;

    let mut txn = db.begin_write()?;
    let table = txn.create_table("t")?;
    let col = txn.add_column(table, ColumnType::String, "c")?;
    txn.string_column_mut(col)?.add(b"one")?;
    txn.commit()?;

    // Replica catches up to version 2
    for changeset in db.changesets(1, 2)? {
        changeset.apply_to_file(&replica)?;
    }

    let mut txn = db.begin_write()?;
    txn.string_column_mut(col)?.add(&vec![b'x'; 300])?;
    txn.commit()?;

    // ... and later to version 3
    for changeset in db.changesets(2, 3)? {
        changeset.apply_to_file(&replica)?;
    }

    drop(db);
    let replayed = Config::new(&replica).open()?;
    let snapshot = replayed.begin_read()?;

    let strings = snapshot.string_column(snapshot.column(snapshot.table("t")?, "c")?)?;
    assert_eq!(b"one", strings.get(0)?);
    assert_eq!(300, strings.get(1)?.len());

    replayed.verify()?;

    Ok(())
}

/// Once every consumer has caught up, the stale log file is recycled and
/// old entries become unavailable.
#[test]
fn consumed_entries_are_recycled() -> tide_db::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(folder.path().join("gc.tdb")).open()?;

    let mut txn = db.begin_write()?;
    let table = txn.create_table("t")?;
    let col = txn.add_column(table, ColumnType::Int, "c")?;
    txn.commit()?;

    for i in 0..5_i64 {
        let mut txn = db.begin_write()?;
        txn.int_column_mut(col)?.add(i)?;
        txn.commit()?;
    }

    let _ = table;
    assert_eq!(7, db.current_version());

    // First recycle: the consumed entries move to the stale file but
    // remain readable
    db.mark_changesets_consumed(7)?;
    assert_eq!(6, db.changesets(1, 7)?.len());

    let mut txn = db.begin_write()?;
    txn.int_column_mut(col)?.add(99)?;
    txn.commit()?;

    // Second recycle drops them for good
    db.mark_changesets_consumed(8)?;
    assert!(db.changesets(1, 8).is_err());

    // The newest entry is still served
    assert_eq!(1, db.changesets(7, 8)?.len());

    Ok(())
}
