use rand::prelude::*;
use test_log::test;
use tide_db::{ColumnType, Config};

/// Drives a column with random operations against an in-memory model,
/// committing along the way, and checks full agreement plus the
/// structural invariants after every commit.
#[test]
fn random_ops_match_model() -> tide_db::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(folder.path().join("model.tdb")).open()?;

    let mut txn = db.begin_write()?;
    let table = txn.create_table("t")?;
    let col = txn.add_column(table, ColumnType::Int, "c")?;
    txn.commit()?;

    let mut rng = StdRng::seed_from_u64(0x7ead_b0a7);
    let mut model: Vec<i64> = Vec::new();

    for _round in 0..20 {
        let mut txn = db.begin_write()?;
        {
            let mut ints = txn.int_column_mut(col)?;

            for _ in 0..200 {
                let value = rng.random_range(-1_000_000..1_000_000);

                match rng.random_range(0..4u8) {
                    0 if !model.is_empty() => {
                        let ndx = rng.random_range(0..model.len());
                        ints.set(ndx, value)?;
                        model[ndx] = value;
                    }
                    1 if !model.is_empty() => {
                        let ndx = rng.random_range(0..model.len());
                        ints.erase(ndx)?;
                        model.remove(ndx);
                    }
                    2 => {
                        let ndx = rng.random_range(0..=model.len());
                        ints.insert(ndx, value)?;
                        model.insert(ndx, value);
                    }
                    _ => {
                        ints.add(value)?;
                        model.push(value);
                    }
                }
            }
        }
        txn.commit()?;

        db.verify()?;

        let snapshot = db.begin_read()?;
        let ints = snapshot.int_column(snapshot.column(snapshot.table("t")?, "c")?)?;

        assert_eq!(model.len(), ints.size()?);
        for (ndx, value) in model.iter().enumerate() {
            assert_eq!(*value, ints.get(ndx)?, "mismatch at row {ndx}");
        }
    }

    Ok(())
}

/// A full file-level copy of a committed database (data file plus logs)
/// opens as an identical database.
#[test]
fn copied_database_directory_reopens() -> tide_db::Result<()> {
    let source = tempfile::tempdir()?;
    let target = tempfile::tempdir()?;

    {
        let db = Config::new(source.path().join("db.tdb")).open()?;

        let mut txn = db.begin_write()?;
        let table = txn.create_table("t")?;
        let col = txn.add_column(table, ColumnType::String, "c")?;
        {
            let mut strings = txn.string_column_mut(col)?;
            for i in 0..100 {
                strings.add(format!("row-{i}").as_bytes())?;
            }
        }
        txn.commit()?;
    }

    let mut options = fs_extra::dir::CopyOptions::new();
    options.content_only = true;
    fs_extra::dir::copy(source.path(), target.path(), &options)
        .expect("directory copy should succeed");

    let db = Config::new(target.path().join("db.tdb")).open()?;
    let snapshot = db.begin_read()?;

    let strings = snapshot.string_column(snapshot.column(snapshot.table("t")?, "c")?)?;
    assert_eq!(100, strings.size()?);
    assert_eq!(b"row-42", strings.get(42)?);

    db.verify()?;

    Ok(())
}
