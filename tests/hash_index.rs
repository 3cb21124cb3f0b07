use test_log::test;
use tide_db::{ColumnType, Config};

#[test]
fn index_speeds_up_lookup_and_stays_consistent() -> tide_db::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(folder.path().join("idx.tdb")).open()?;

    let mut txn = db.begin_write()?;
    let table = txn.create_table("people")?;
    let ids = txn.add_column(table, ColumnType::Int, "id")?;

    {
        let mut col = txn.int_column_mut(ids)?;
        for i in 0..500_i64 {
            col.add(i * 37)?;
        }
    }

    // Index an already-populated column
    txn.create_search_index(ids)?;
    txn.commit()?;

    let snapshot = db.begin_read()?;
    let col = snapshot.int_column(snapshot.column(snapshot.table("people")?, "id")?)?;

    assert_eq!(Some(0), col.find_first(0)?);
    assert_eq!(Some(123), col.find_first(123 * 37)?);
    assert_eq!(Some(499), col.find_first(499 * 37)?);
    assert_eq!(None, col.find_first(1)?);

    db.verify()?;

    Ok(())
}

#[test]
fn index_follows_row_shifts() -> tide_db::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(folder.path().join("shift.tdb")).open()?;

    let mut txn = db.begin_write()?;
    let table = txn.create_table("t")?;
    let col = txn.add_column(table, ColumnType::Int, "c")?;
    txn.create_search_index(col)?;

    {
        let mut ints = txn.int_column_mut(col)?;
        ints.add(100)?;
        ints.add(200)?;
        ints.add(300)?;

        // Insert in the middle: rows behind it shift up
        ints.insert(1, 150)?;
        assert_eq!(Some(0), ints.find_first(100)?);
        assert_eq!(Some(1), ints.find_first(150)?);
        assert_eq!(Some(2), ints.find_first(200)?);
        assert_eq!(Some(3), ints.find_first(300)?);

        // Erase in the middle: rows behind it shift down
        ints.erase(1)?;
        assert_eq!(Some(1), ints.find_first(200)?);
        assert_eq!(Some(2), ints.find_first(300)?);
        assert_eq!(None, ints.find_first(150)?);

        // Overwrite re-keys the row
        ints.set(0, 101)?;
        assert_eq!(None, ints.find_first(100)?);
        assert_eq!(Some(0), ints.find_first(101)?);

        // Clearing the column clears the index with it
        ints.clear()?;
        assert_eq!(0, ints.size()?);
        assert_eq!(None, ints.find_first(101)?);
    }
    txn.commit()?;

    db.verify()?;

    Ok(())
}

#[test]
fn index_handles_duplicates() -> tide_db::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(folder.path().join("dup.tdb")).open()?;

    let mut txn = db.begin_write()?;
    let table = txn.create_table("t")?;
    let col = txn.add_column(table, ColumnType::Int, "c")?;
    txn.create_search_index(col)?;

    {
        let mut ints = txn.int_column_mut(col)?;
        for i in 0..300_i64 {
            ints.add(i % 10)?;
        }
    }
    txn.commit()?;

    let snapshot = db.begin_read()?;
    let col = snapshot.int_column(snapshot.column(snapshot.table("t")?, "c")?)?;

    // 30 rows per key, in ascending row order
    for key in 0..10_i64 {
        let rows = col.find_all(key)?;
        assert_eq!(30, rows.len());
        assert!(rows.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(key, col.get(rows[0])?);
    }

    db.verify()?;

    Ok(())
}

#[test]
fn index_survives_growth_and_reopen() -> tide_db::Result<()> {
    let folder = tempfile::tempdir()?;
    let path = folder.path().join("grow.tdb");

    {
        let db = Config::new(&path).open()?;

        let mut txn = db.begin_write()?;
        let table = txn.create_table("t")?;
        let col = txn.add_column(table, ColumnType::Int, "c")?;
        txn.create_search_index(col)?;

        // Far beyond the initial 256-bucket table
        {
            let mut ints = txn.int_column_mut(col)?;
            for i in 0..3000_i64 {
                ints.add(i * 7919)?;
            }
        }
        txn.commit()?;
        db.verify()?;
    }

    let db = Config::new(&path).open()?;
    let snapshot = db.begin_read()?;
    let col = snapshot.int_column(snapshot.column(snapshot.table("t")?, "c")?)?;

    for i in (0..3000_i64).step_by(97) {
        assert_eq!(Some(i as usize), col.find_first(i * 7919)?);
    }

    db.verify()?;

    Ok(())
}

#[test]
fn string_index_hashes_values() -> tide_db::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(folder.path().join("sidx.tdb")).open()?;

    let mut txn = db.begin_write()?;
    let table = txn.create_table("t")?;
    let col = txn.add_column(table, ColumnType::String, "c")?;
    txn.create_search_index(col)?;

    {
        let mut strings = txn.string_column_mut(col)?;
        for _ in 0..200 {
            strings.add(nanoid::nanoid!().as_bytes())?;
        }
        strings.add(b"needle")?;

        // Long values are indexed through their hash just the same
        strings.add(&vec![b'q'; 400])?;
    }
    txn.commit()?;

    let snapshot = db.begin_read()?;
    let col = snapshot.string_column(snapshot.column(snapshot.table("t")?, "c")?)?;

    assert_eq!(Some(200), col.find_first(b"needle")?);
    assert_eq!(Some(201), col.find_first(&vec![b'q'; 400])?);
    assert_eq!(None, col.find_first(b"absent")?);

    db.verify()?;

    Ok(())
}
