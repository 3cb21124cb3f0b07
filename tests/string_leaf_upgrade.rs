use test_log::test;
use tide_db::{ColumnType, Config};

#[test]
fn short_leaf_upgrades_on_long_value() -> tide_db::Result<()> {
    let folder = tempfile::tempdir()?;
    let path = folder.path().join("strings.tdb");

    let db = Config::new(&path).open()?;

    let mut txn = db.begin_write()?;
    let table = txn.create_table("t")?;
    let col = txn.add_column(table, ColumnType::String, "c")?;

    {
        let mut strings = txn.string_column_mut(col)?;
        for _ in 0..10 {
            strings.add(b"short")?;
        }
    }
    txn.commit()?;

    // A 200-byte value cannot live in the fixed-stride short form
    let long_value = vec![b'x'; 200];

    let mut txn = db.begin_write()?;
    txn.string_column_mut(col)?.add(&long_value)?;
    txn.commit()?;

    let snapshot = db.begin_read()?;
    let strings = snapshot.string_column(snapshot.column(snapshot.table("t")?, "c")?)?;

    assert_eq!(&long_value[..], strings.get(10)?);
    for i in 0..10 {
        assert_eq!(b"short", strings.get(i)?);
    }

    db.verify()?;

    Ok(())
}

#[test]
fn boundary_lengths_around_the_short_form_limit() -> tide_db::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(folder.path().join("bounds.tdb")).open()?;

    let mut txn = db.begin_write()?;
    let table = txn.create_table("t")?;
    let col = txn.add_column(table, ColumnType::String, "c")?;

    // 63 bytes fits the short form; 64 forces the long form
    let fits = vec![b'a'; 63];
    let too_long = vec![b'b'; 64];

    {
        let mut strings = txn.string_column_mut(col)?;
        strings.add(&fits)?;
        strings.add(&too_long)?;
        strings.add(b"")?;
    }
    txn.commit()?;

    let snapshot = db.begin_read()?;
    let strings = snapshot.string_column(snapshot.column(snapshot.table("t")?, "c")?)?;

    assert_eq!(&fits[..], strings.get(0)?);
    assert_eq!(&too_long[..], strings.get(1)?);
    assert_eq!(b"", strings.get(2)?);

    db.verify()?;

    Ok(())
}

#[test]
fn upgrade_is_local_to_one_leaf() -> tide_db::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(folder.path().join("local.tdb")).open()?;

    let mut txn = db.begin_write()?;
    let table = txn.create_table("t")?;
    let col = txn.add_column(table, ColumnType::String, "c")?;

    // Enough rows for several leaves, then one long value at the end;
    // only the leaf that receives it changes form
    {
        let mut strings = txn.string_column_mut(col)?;
        for i in 0..3000 {
            strings.add(format!("row-{i}").as_bytes())?;
        }
        strings.add(&vec![b'z'; 500])?;
    }
    txn.commit()?;

    let snapshot = db.begin_read()?;
    let strings = snapshot.string_column(snapshot.column(snapshot.table("t")?, "c")?)?;

    assert_eq!(3001, strings.size()?);
    assert_eq!(b"row-0", strings.get(0)?);
    assert_eq!(b"row-2999", strings.get(2999)?);
    assert_eq!(500, strings.get(3000)?.len());

    // Overwriting in the middle of a short leaf keeps working as before
    let mut txn = db.begin_write()?;
    txn.string_column_mut(col)?.set(1500, b"replaced")?;
    txn.commit()?;

    let snapshot = db.begin_read()?;
    let strings = snapshot.string_column(snapshot.column(snapshot.table("t")?, "c")?)?;
    assert_eq!(b"replaced", strings.get(1500)?);

    db.verify()?;

    Ok(())
}
