use std::collections::BTreeMap;
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;
use vibelite::btree::{BTree, BTreeKey, TreeKind};
use vibelite::record::{decode_record, encode_record, Value};
use vibelite::{Database, DatabaseConfig, Error, KeyInfo, Pager, VfsRegistry};

fn open(registry: &VfsRegistry, path: &Path, page_size: usize) -> vibelite::Result<Database> {
    let config = DatabaseConfig {
        page_size,
        busy_timeout: Some(Duration::from_secs(10)),
        ..Default::default()
    };
    Database::open_with(registry, Some(path), &config)
}

fn index_keys(pager: &mut Pager, tree: &BTree, forward: bool) -> vibelite::Result<Vec<String>> {
    let mut cursor = tree.cursor();
    let mut keys = Vec::new();
    let mut more = if forward {
        cursor.first(pager)?
    } else {
        cursor.last(pager)?
    };
    while more {
        match cursor.record(pager)?.first() {
            Some(Value::Text(s)) => keys.push(s.clone()),
            other => return Err(Error::corrupt(format!("unexpected key {other:?}"))),
        }
        more = if forward {
            cursor.next(pager)?
        } else {
            cursor.previous(pager)?
        };
    }
    cursor.close(pager);
    Ok(keys)
}

fn count(pager: &mut Pager, tree: &BTree) -> vibelite::Result<u64> {
    let mut cursor = tree.cursor();
    let mut n = 0;
    let mut more = cursor.first(pager)?;
    while more {
        n += 1;
        more = cursor.next(pager)?;
    }
    cursor.close(pager);
    Ok(n)
}

#[test]
fn test_index_end_to_end() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let registry = VfsRegistry::default();
    let db = open(&registry, &dir.path().join("e2e.db"), 1024)?;

    let root = db.transaction(|pager| BTree::create(pager, TreeKind::Index))?;
    let tree = BTree::index(root, KeyInfo::new(1));
    db.transaction(|pager| {
        let mut cursor = tree.cursor();
        for key in ["ABC", "XYZ", "ABCD", "ABCDEF", "A", "XYZZ"] {
            let record = encode_record(&[key.into(), Value::Integer(1)]);
            cursor.insert(pager, BTreeKey::Record(&record), &[])?;
        }
        cursor.close(pager);
        Ok(())
    })?;

    let expected = vec!["A", "ABC", "ABCD", "ABCDEF", "XYZ", "XYZZ"];
    assert_eq!(db.read(|pager| index_keys(pager, &tree, true))?, expected);
    let mut reversed = expected.clone();
    reversed.reverse();
    assert_eq!(db.read(|pager| index_keys(pager, &tree, false))?, reversed);

    db.transaction(|pager| {
        let mut cursor = tree.cursor();
        let record = encode_record(&["ABCD".into(), Value::Integer(1)]);
        let found = cursor.move_to(pager, BTreeKey::Record(&record), true);
        let deleted = found.and_then(|found| {
            assert!(found);
            cursor.delete(pager)
        });
        cursor.close(pager);
        deleted
    })?;
    assert_eq!(
        db.read(|pager| index_keys(pager, &tree, true))?,
        vec!["A", "ABC", "ABCDEF", "XYZ", "XYZZ"]
    );
    db.close()?;
    Ok(())
}

#[test]
fn test_reader_keeps_snapshot_while_writer_waits() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("snapshot.db");
    let registry = Arc::new(VfsRegistry::default());

    let reader = open(&registry, &path, 4096)?;
    let root = reader.transaction(|pager| {
        let root = BTree::create(pager, TreeKind::Table)?;
        let mut cursor = BTree::table(root).cursor();
        for rowid in 1..=3 {
            cursor.insert(pager, BTreeKey::Int(rowid), &encode_record(&[Value::Integer(rowid)]))?;
        }
        cursor.close(pager);
        Ok(root)
    })?;
    let tree = BTree::table(root);

    reader.run(|pager| pager.begin_read())?;
    assert_eq!(reader.run(|pager| count(pager, &tree))?, 3);

    let (inserted_tx, inserted_rx) = mpsc::channel();
    let writer = {
        let registry = registry.clone();
        let path = path.clone();
        thread::spawn(move || -> vibelite::Result<()> {
            let db = open(&registry, &path, 4096)?;
            db.transaction(|pager| {
                let mut cursor = BTree::table(root).cursor();
                cursor.insert(pager, BTreeKey::Int(4), &encode_record(&[Value::Integer(4)]))?;
                cursor.close(pager);
                inserted_tx.send(()).ok();
                Ok(())
            })?;
            db.close()
        })
    };

    inserted_rx.recv()?;
    // The writer now waits in commit for the reader's shared lock.
    thread::sleep(Duration::from_millis(50));
    assert_eq!(reader.run(|pager| count(pager, &tree))?, 3);
    reader.run(|pager| pager.end_read())?;

    writer.join().expect("writer thread panicked")?;
    assert_eq!(reader.run(|pager| count(pager, &tree))?, 4);
    reader.close()?;
    Ok(())
}

#[test]
fn test_table_survives_reopen() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("persist.db");
    let registry = VfsRegistry::default();

    let db = open(&registry, &path, 1024)?;
    let root = db.transaction(|pager| {
        let root = BTree::create(pager, TreeKind::Table)?;
        let mut cursor = BTree::table(root).cursor();
        for rowid in 0..1000i64 {
            let row = encode_record(&[Value::Integer(rowid), Value::Text(format!("name-{rowid}"))]);
            cursor.insert(pager, BTreeKey::Int(rowid * 3), &row)?;
        }
        cursor.close(pager);
        Ok(root)
    })?;
    db.close()?;

    let db = open(&registry, &path, 4096)?;
    assert_eq!(db.run(|pager| Ok(pager.page_size()))?, 1024);
    let tree = db.read(|pager| BTree::open(pager, root))?;
    let (row, problems) = db.read(|pager| {
        let mut cursor = tree.cursor();
        let row = cursor
            .move_to(pager, BTreeKey::Int(999), true)
            .and_then(|_| cursor.data(pager));
        cursor.close(pager);
        Ok((row?, tree.check_integrity(pager)?))
    })?;
    assert_eq!(decode_record(&row)?, vec![Value::Integer(333), "name-333".into()]);
    assert!(problems.is_empty(), "{problems:?}");
    assert_eq!(db.read(|pager| count(pager, &tree))?, 1000);
    Ok(())
}

/// 150 random inserts and deletes, mirrored in `model`.
fn random_round(
    pager: &mut Pager,
    tree: &BTree,
    rng: &mut StdRng,
    model: &mut BTreeMap<i64, String>,
) -> vibelite::Result<()> {
    let mut cursor = tree.cursor();
    let result: vibelite::Result<()> = (0..150).try_for_each(|_| {
        let key = rng.gen_range(0..2000i64);
        if rng.gen_bool(0.6) {
            let name = "x".repeat(rng.gen_range(0..60));
            // One entry per key: drop the older one first.
            if let Some(old) = model.get(&key) {
                let record = encode_record(&[Value::Integer(key), old.clone().into()]);
                if cursor.move_to(pager, BTreeKey::Record(&record), true)? {
                    cursor.delete(pager)?;
                }
            }
            let record = encode_record(&[Value::Integer(key), name.clone().into()]);
            cursor.insert(pager, BTreeKey::Record(&record), &[])?;
            model.insert(key, name);
        } else {
            let probe = encode_record(&[Value::Integer(key)]);
            let found = cursor.move_to(pager, BTreeKey::Record(&probe), false)?;
            assert_eq!(found, model.contains_key(&key));
            if found {
                cursor.delete(pager)?;
                model.remove(&key);
            }
        }
        Ok(())
    });
    cursor.close(pager);
    result
}

#[test]
fn test_random_inserts_and_deletes_stay_consistent() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let registry = VfsRegistry::default();
    let db = open(&registry, &dir.path().join("random.db"), 512)?;
    let root = db.transaction(|pager| BTree::create(pager, TreeKind::Index))?;
    let tree = BTree::index(root, KeyInfo::new(2));

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut model: BTreeMap<i64, String> = BTreeMap::new();
    for round in 0..20 {
        db.transaction(|pager| random_round(pager, &tree, &mut rng, &mut model))?;

        let problems = db.read(|pager| tree.check_integrity(pager))?;
        assert!(problems.is_empty(), "round {round}: {problems:?}");
    }

    let stored = db.read(|pager| {
        let mut cursor = tree.cursor();
        let mut out = Vec::new();
        let mut more = cursor.first(pager)?;
        while more {
            out.push(cursor.record(pager));
            more = cursor.next(pager)?;
        }
        cursor.close(pager);
        out.into_iter().collect::<vibelite::Result<Vec<_>>>()
    })?;
    let expected: Vec<Vec<Value>> = model
        .iter()
        .map(|(k, name)| vec![Value::Integer(*k), name.clone().into()])
        .collect();
    assert_eq!(stored, expected);
    Ok(())
}

#[test]
fn test_overflow_payloads_and_freelist_reuse() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let registry = VfsRegistry::default();
    let db = open(&registry, &dir.path().join("overflow.db"), 1024)?;
    let root = db.transaction(|pager| BTree::create(pager, TreeKind::Table))?;
    let tree = BTree::table(root);

    let blob = |i: i64| -> Vec<u8> { (0..10_000).map(|j| ((j as i64 * 7 + i) % 251) as u8).collect() };
    let insert_all = |db: &Database| {
        db.transaction(|pager| {
            let mut cursor = tree.cursor();
            let result: vibelite::Result<()> = (0..8).try_for_each(|i| cursor.insert(pager, BTreeKey::Int(i), &blob(i)));
            cursor.close(pager);
            result
        })
    };
    insert_all(&db)?;
    let size = db.run(|pager| Ok(pager.page_count()))?;

    let data = db.read(|pager| {
        let mut cursor = tree.cursor();
        let data = cursor
            .move_to(pager, BTreeKey::Int(5), true)
            .and_then(|_| cursor.data(pager));
        cursor.close(pager);
        data
    })?;
    assert_eq!(data, blob(5));

    db.transaction(|pager| tree.clear(pager))?;
    let free = db.read(|pager| pager.freelist_pages())?;
    assert_eq!(free.len() as u32, size - 2);

    // The same rows fit in the pages the clear released.
    insert_all(&db)?;
    assert_eq!(db.run(|pager| Ok(pager.page_count()))?, size);
    assert!(db.read(|pager| pager.freelist_pages())?.is_empty());
    assert!(db.read(|pager| tree.check_integrity(pager))?.is_empty());
    Ok(())
}

#[test]
fn test_failed_transaction_with_small_cache_leaves_file_unchanged() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("spill.db");
    let registry = VfsRegistry::default();
    let config = DatabaseConfig {
        page_size: 512,
        cache_size: Some(10),
        ..Default::default()
    };
    let db = Database::open_with(&registry, Some(&path), &config)?;
    let root = db.transaction(|pager| {
        let root = BTree::create(pager, TreeKind::Table)?;
        let mut cursor = BTree::table(root).cursor();
        let result: vibelite::Result<()> = (0..50).try_for_each(|i| cursor.insert(pager, BTreeKey::Int(i), &[i as u8; 40]));
        cursor.close(pager);
        result.map(|_| root)
    })?;
    let before = std::fs::read(&path)?;

    // Enough changes to spill dirty pages to the file mid-transaction.
    let result: vibelite::Result<()> = db.transaction(|pager| {
        let mut cursor = BTree::table(root).cursor();
        let inserted: vibelite::Result<()> = (50..2000).try_for_each(|i| cursor.insert(pager, BTreeKey::Int(i), &[1u8; 40]));
        cursor.close(pager);
        inserted?;
        Err(Error::Full)
    });
    assert!(matches!(result, Err(Error::Full)));
    assert_eq!(std::fs::read(&path)?, before);

    let tree = BTree::table(root);
    assert_eq!(db.read(|pager| count(pager, &tree))?, 50);
    Ok(())
}
