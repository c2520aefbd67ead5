//! Integration tests: the client over a real engine store.
//!
//! Each test opens a store in a temporary directory and drives it through
//! the public API only: Options -> Database -> batches, iterators, snapshots.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use keel::{Cache, Compression, Database, Error, Options, ReadOptions, WriteBatch, WriteOptions};
use keel_core::format::MAGIC_ARRAY;
use proptest::prelude::*;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn create_options() -> Arc<Options> {
    let mut options = Options::new();
    options.set_create_if_missing(true);
    Arc::new(options)
}

fn test_db() -> (Database, TempDir) {
    let dir = TempDir::new().unwrap();
    let db = Database::open(Some(create_options()), dir.path()).unwrap();
    (db, dir)
}

fn entries(db: &Database) -> Vec<(Vec<u8>, Vec<u8>)> {
    db.iter().unwrap().collect()
}

/// Flip one byte inside the WAL record that carries `marker`.
fn corrupt_wal_record(store: &Path, marker: &[u8]) {
    for entry in fs::read_dir(store.join("wal")).unwrap() {
        let path = entry.unwrap().path();
        let mut data = fs::read(&path).unwrap();
        if let Some(pos) = data.windows(marker.len()).position(|w| w == marker) {
            data[pos] ^= 0xFF;
            fs::write(&path, data).unwrap();
            return;
        }
    }
    panic!("marker not found in any WAL segment");
}

/// Overwrite the high byte of the length field of the WAL record carrying `marker`.
fn damage_wal_record_length(store: &Path, marker: &[u8]) {
    for entry in fs::read_dir(store.join("wal")).unwrap() {
        let path = entry.unwrap().path();
        let mut data = fs::read(&path).unwrap();
        if let Some(pos) = data.windows(marker.len()).position(|w| w == marker) {
            let start = data[..pos].windows(MAGIC_ARRAY.len()).rposition(|w| w == MAGIC_ARRAY).unwrap();
            data[start + 7] = 0x7F;
            fs::write(&path, data).unwrap();
            return;
        }
    }
    panic!("marker not found in any WAL segment");
}

// ---------------------------------------------------------------------------
// Basic operations
// ---------------------------------------------------------------------------

#[test]
fn test_put_then_get() {
    let (db, _dir) = test_db();
    db.put(b"key1", b"value1").unwrap();
    assert_eq!(db.get(b"key1").unwrap(), Some(b"value1".to_vec()));
    assert_eq!(db.get(b"missing").unwrap(), None);
}

#[test]
fn test_delete_reads_as_absent_not_empty() {
    let (db, _dir) = test_db();
    db.put(b"gone", b"v").unwrap();
    db.put(b"empty", b"").unwrap();
    db.delete(b"gone").unwrap();

    assert_eq!(db.get(b"gone").unwrap(), None);
    assert_eq!(db.get(b"empty").unwrap(), Some(Vec::new()));

    // Deleting an absent key is fine
    db.delete(b"never-there").unwrap();
}

#[test]
fn test_zero_bytes_round_trip() {
    let (db, _dir) = test_db();
    let key = b"a\0b\0";
    let value = b"\0\0value\0";
    db.put(key, value).unwrap();
    assert_eq!(db.get(key).unwrap(), Some(value.to_vec()));
    assert_eq!(db.get(b"a").unwrap(), None);
    assert_eq!(entries(&db), vec![(key.to_vec(), value.to_vec())]);
}

#[test]
fn test_sync_and_checksum_options() {
    let (db, _dir) = test_db();
    let mut write = WriteOptions::new();
    write.set_sync(true);
    db.put_with(&write, b"k", b"durable").unwrap();

    let mut read = ReadOptions::new();
    read.set_verify_checksums(true).set_fill_cache(false);
    assert_eq!(db.get_with(&read, b"k").unwrap(), Some(b"durable".to_vec()));
}

// ---------------------------------------------------------------------------
// Enumeration
// ---------------------------------------------------------------------------

#[test]
fn test_enumerate_in_key_order_and_repeatably() {
    let (db, _dir) = test_db();
    db.put(b"key3", b"value3").unwrap();
    db.put(b"key1", b"value1").unwrap();
    db.put(b"key2", b"value2").unwrap();

    let first = entries(&db);
    assert_eq!(
        first,
        vec![
            (b"key1".to_vec(), b"value1".to_vec()),
            (b"key2".to_vec(), b"value2".to_vec()),
            (b"key3".to_vec(), b"value3".to_vec()),
        ]
    );
    assert_eq!(entries(&db), first);
}

#[test]
fn test_empty_store_enumerates_nothing() {
    let (db, _dir) = test_db();
    let mut iter = db.iter().unwrap();
    assert_eq!(iter.next(), None);
    assert!(iter.status().is_ok());
}

#[test]
fn test_iterator_does_not_see_later_writes() {
    let (db, _dir) = test_db();
    db.put(b"a", b"1").unwrap();
    let iter = db.iter().unwrap();
    db.put(b"b", b"2").unwrap();
    db.delete(b"a").unwrap();

    let seen: Vec<_> = iter.collect();
    assert_eq!(seen, vec![(b"a".to_vec(), b"1".to_vec())]);
}

#[test]
fn test_iter_from_starts_at_first_key_not_less() {
    let (db, _dir) = test_db();
    for key in ["apple", "banana", "cherry"] {
        db.put(key.as_bytes(), b"x").unwrap();
    }
    let keys: Vec<Vec<u8>> = db.iter_from(&ReadOptions::new(), b"b").unwrap().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![b"banana".to_vec(), b"cherry".to_vec()]);

    let keys: Vec<Vec<u8>> = db.iter_from(&ReadOptions::new(), b"banana").unwrap().map(|(k, _)| k).collect();
    assert_eq!(keys.first(), Some(&b"banana".to_vec()));

    assert_eq!(db.iter_from(&ReadOptions::new(), b"d").unwrap().next(), None);
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

#[test]
fn test_snapshot_hides_later_put() {
    let (db, _dir) = test_db();
    db.put(b"key1", b"value1").unwrap();
    let snapshot = db.snapshot().unwrap();
    db.put(b"key2", b"value2").unwrap();

    assert_eq!(snapshot.get(b"key2").unwrap(), None);
    assert_eq!(db.get(b"key2").unwrap(), Some(b"value2".to_vec()));

    let read = snapshot.read_options();
    assert_eq!(db.get_with(&read, b"key1").unwrap(), Some(b"value1".to_vec()));
    let keys: Vec<Vec<u8>> = db.iter_with(&read).unwrap().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![b"key1".to_vec()]);
}

#[test]
fn test_snapshot_survives_compaction() {
    let (db, _dir) = test_db();
    db.put(b"k", b"old").unwrap();
    let snapshot = db.snapshot().unwrap();
    db.put(b"k", b"new").unwrap();
    db.compact().unwrap();

    assert_eq!(snapshot.get(b"k").unwrap(), Some(b"old".to_vec()));
    assert_eq!(db.get(b"k").unwrap(), Some(b"new".to_vec()));
    snapshot.release();
}

#[test]
fn test_snapshot_count_property() {
    let (db, _dir) = test_db();
    let first = db.snapshot().unwrap();
    let second = db.snapshot().unwrap();
    assert_eq!(db.property("keel.num-snapshots").unwrap(), Some("2".to_string()));
    drop(first);
    second.release();
    assert_eq!(db.property("keel.num-snapshots").unwrap(), Some("0".to_string()));
}

// ---------------------------------------------------------------------------
// Write batches
// ---------------------------------------------------------------------------

#[test]
fn test_batch_applies_in_order_and_clear_resubmits_nothing() {
    let (db, _dir) = test_db();
    db.put(b"key1", b"value1").unwrap();

    let mut batch = WriteBatch::new();
    batch.delete(b"key1").put(b"key2", b"value2");
    db.write(&batch).unwrap();
    assert_eq!(db.get(b"key1").unwrap(), None);
    assert_eq!(db.get(b"key2").unwrap(), Some(b"value2".to_vec()));

    db.put(b"key1", b"again").unwrap();
    batch.clear();
    assert!(batch.is_empty());
    db.write(&batch).unwrap();
    assert_eq!(db.get(b"key1").unwrap(), Some(b"again".to_vec()));
    assert_eq!(db.get(b"key2").unwrap(), Some(b"value2".to_vec()));
}

#[test]
fn test_batch_later_op_wins_for_same_key() {
    let (db, _dir) = test_db();
    let mut batch = WriteBatch::new();
    batch.put(b"k", b"1").put(b"k", b"2").delete(b"j").put(b"j", b"3");
    db.write(&batch).unwrap();
    assert_eq!(db.get(b"k").unwrap(), Some(b"2".to_vec()));
    assert_eq!(db.get(b"j").unwrap(), Some(b"3".to_vec()));
}

#[test]
fn test_batch_is_reusable_across_databases() {
    let (first, _a) = test_db();
    let (second, _b) = test_db();
    let mut batch = WriteBatch::new();
    batch.put(b"shared", b"v");
    first.write(&batch).unwrap();
    second.write(&batch).unwrap();
    assert_eq!(first.get(b"shared").unwrap(), second.get(b"shared").unwrap());
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[test]
fn test_double_close_then_access_is_disposed() {
    let (db, _dir) = test_db();
    db.put(b"k", b"v").unwrap();
    db.close();
    db.close();
    assert_eq!(db.get(b"k").unwrap_err(), Error::Disposed("Database"));
    assert_eq!(db.put(b"k", b"v").unwrap_err(), Error::Disposed("Database"));
    assert_eq!(db.write(&WriteBatch::new()).unwrap_err(), Error::Disposed("Database"));
}

#[test]
fn test_open_missing_without_create_fails() {
    let dir = TempDir::new().unwrap();
    let err = Database::open(None, dir.path().join("nope")).unwrap_err();
    assert!(matches!(err, Error::Open(_)));
}

#[test]
fn test_error_if_exists_rejects_existing_store() {
    let dir = TempDir::new().unwrap();
    Database::open(Some(create_options()), dir.path()).unwrap().close();

    let mut options = Options::new();
    options.set_create_if_missing(true).set_error_if_exists(true);
    let err = Database::open(Some(Arc::new(options)), dir.path()).unwrap_err();
    assert!(matches!(err, Error::Open(_)));
}

#[test]
fn test_second_open_of_same_path_fails_while_locked() {
    let (db, dir) = test_db();
    let err = Database::open(Some(create_options()), dir.path()).unwrap_err();
    assert!(matches!(err, Error::Open(_)));

    db.close();
    Database::open(Some(create_options()), dir.path()).unwrap();
}

#[test]
fn test_data_survives_reopen_and_compaction() {
    let dir = TempDir::new().unwrap();
    {
        let db = Database::open(Some(create_options()), dir.path()).unwrap();
        for i in 0..200u32 {
            db.put(format!("key{:04}", i).as_bytes(), &i.to_le_bytes()).unwrap();
        }
        db.delete(b"key0007").unwrap();
        db.compact_range(Some(&b"key0000"[..]), Some(&b"key0100"[..])).unwrap();
        db.put(b"after", b"compaction").unwrap();
    }

    let db = Database::open(Some(create_options()), dir.path()).unwrap();
    assert_eq!(db.get(b"key0007").unwrap(), None);
    assert_eq!(db.get(b"key0150").unwrap(), Some(150u32.to_le_bytes().to_vec()));
    assert_eq!(db.get(b"after").unwrap(), Some(b"compaction".to_vec()));
    assert_eq!(db.property("keel.num-entries").unwrap(), Some("200".to_string()));
}

#[test]
fn test_uncompressed_tables_reopen() {
    let dir = TempDir::new().unwrap();
    let mut options = Options::new();
    options.set_create_if_missing(true).set_compression(Compression::None);
    let options = Arc::new(options);
    {
        let db = Database::open(Some(Arc::clone(&options)), dir.path()).unwrap();
        db.put(b"plain", &[7u8; 4096]).unwrap();
        db.compact().unwrap();
    }
    let db = Database::open(Some(options), dir.path()).unwrap();
    assert_eq!(db.get(b"plain").unwrap(), Some(vec![7u8; 4096]));
}

// ---------------------------------------------------------------------------
// Maintenance
// ---------------------------------------------------------------------------

#[test]
fn test_destroy_then_open_without_create_fails() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store");
    {
        let db = Database::open(Some(create_options()), &path).unwrap();
        db.put(b"k", b"v").unwrap();
    }
    Database::destroy(None, &path).unwrap();

    let err = Database::open(None, &path).unwrap_err();
    assert!(matches!(err, Error::Open(_)));
}

#[test]
fn test_destroy_fails_while_open() {
    let (db, dir) = test_db();
    let err = Database::destroy(None, dir.path()).unwrap_err();
    assert!(matches!(err, Error::Maintenance(_)));
    db.close();
    Database::destroy(None, dir.path()).unwrap();
}

#[test]
fn test_repair_recovers_unaffected_keys() {
    let dir = TempDir::new().unwrap();
    {
        let db = Database::open(Some(create_options()), dir.path()).unwrap();
        db.put(b"key1", b"value1").unwrap();
        db.put(b"key2", b"CORRUPT-ME").unwrap();
        db.put(b"key3", b"value3").unwrap();
    }
    corrupt_wal_record(dir.path(), b"CORRUPT-ME");

    let mut paranoid = Options::new();
    paranoid.set_paranoid_checks(true);
    let paranoid = Arc::new(paranoid);
    let err = Database::open(Some(Arc::clone(&paranoid)), dir.path()).unwrap_err();
    assert!(matches!(err, Error::Open(_)));

    Database::repair(None, dir.path()).unwrap();

    let db = Database::open(Some(paranoid), dir.path()).unwrap();
    assert_eq!(db.get(b"key1").unwrap(), Some(b"value1".to_vec()));
    assert_eq!(db.get(b"key2").unwrap(), None);
    assert_eq!(db.get(b"key3").unwrap(), Some(b"value3".to_vec()));
}

#[test]
fn test_damaged_record_length_fails_paranoid_open_and_repair_keeps_the_rest() {
    let dir = TempDir::new().unwrap();
    {
        let db = Database::open(Some(create_options()), dir.path()).unwrap();
        db.put(b"key1", b"value1").unwrap();
        db.put(b"key2", b"LENGTH-HIT").unwrap();
        db.put(b"key3", b"value3").unwrap();
    }
    damage_wal_record_length(dir.path(), b"LENGTH-HIT");

    let mut paranoid = Options::new();
    paranoid.set_paranoid_checks(true);
    let paranoid = Arc::new(paranoid);
    let err = Database::open(Some(Arc::clone(&paranoid)), dir.path()).unwrap_err();
    assert!(matches!(err, Error::Open(_)));

    Database::repair(None, dir.path()).unwrap();

    let db = Database::open(Some(paranoid), dir.path()).unwrap();
    assert_eq!(db.get(b"key1").unwrap(), Some(b"value1".to_vec()));
    assert_eq!(db.get(b"key2").unwrap(), None);
    assert_eq!(db.get(b"key3").unwrap(), Some(b"value3".to_vec()));
}

#[test]
fn test_maintenance_rejects_bad_paths() {
    assert!(matches!(Database::repair(None, ""), Err(Error::ContractViolation(_))));
    assert!(matches!(Database::destroy(None, "bad\0path"), Err(Error::ContractViolation(_))));
    assert!(matches!(Database::open(None, ""), Err(Error::ContractViolation(_))));

    let dir = TempDir::new().unwrap();
    let err = Database::repair(None, dir.path().join("absent")).unwrap_err();
    assert!(matches!(err, Error::Maintenance(_)));
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[test]
fn test_database_keeps_cache_alive_after_caller_drops_it() {
    let dir = TempDir::new().unwrap();
    let db = {
        let cache = Cache::new(1 << 20);
        let mut options = Options::new();
        options.set_create_if_missing(true).set_cache(Some(&cache));
        Database::open(Some(Arc::new(options)), dir.path()).unwrap()
    };

    db.put(b"cached", b"value").unwrap();
    assert_eq!(db.get(b"cached").unwrap(), Some(b"value".to_vec()));
    assert_eq!(db.get(b"cached").unwrap(), Some(b"value".to_vec()));
    let usage: usize = db.property("keel.cache-usage").unwrap().unwrap().parse().unwrap();
    assert!(usage > 0);
}

#[test]
fn test_one_cache_shared_by_two_databases() {
    let cache = Cache::new(1 << 20);
    let mut options = Options::new();
    options.set_create_if_missing(true).set_cache(Some(&cache));
    let options = Arc::new(options);

    let (a, b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let first = Database::open(Some(Arc::clone(&options)), a.path()).unwrap();
    let second = Database::open(Some(Arc::clone(&options)), b.path()).unwrap();
    drop(options);

    first.put(b"k", b"first").unwrap();
    second.put(b"k", b"second").unwrap();
    assert_eq!(first.get(b"k").unwrap(), Some(b"first".to_vec()));
    assert_eq!(second.get(b"k").unwrap(), Some(b"second".to_vec()));
    assert!(cache.total_charge() > 0);
    assert_eq!(cache.capacity(), 1 << 20);

    first.close();
    second.close();
    assert_eq!(cache.total_charge(), 0);
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[test]
fn test_concurrent_writers_and_readers() {
    let (db, _dir) = test_db();
    thread::scope(|scope| {
        for t in 0..4u8 {
            let db = &db;
            scope.spawn(move || {
                for i in 0..100u8 {
                    let key = [t, i];
                    db.put(&key, &[i]).unwrap();
                    assert_eq!(db.get(&key).unwrap(), Some(vec![i]));
                }
            });
        }
    });
    assert_eq!(entries(&db).len(), 400);
}

#[test]
fn test_close_racing_with_reads() {
    let (db, _dir) = test_db();
    db.put(b"k", b"v").unwrap();
    thread::scope(|scope| {
        let reader = scope.spawn(|| {
            for _ in 0..1000 {
                match db.get(b"k") {
                    Ok(value) => assert_eq!(value, Some(b"v".to_vec())),
                    Err(err) => {
                        assert_eq!(err, Error::Disposed("Database"));
                        return;
                    }
                }
            }
        });
        db.close();
        reader.join().unwrap();
    });
    assert!(db.is_closed());
}

// ---------------------------------------------------------------------------
// Misc
// ---------------------------------------------------------------------------

#[test]
fn test_properties_and_version() {
    let (db, _dir) = test_db();
    assert!(db.property("keel.stats").unwrap().is_some());
    assert_eq!(db.property("keel.bogus").unwrap(), None);

    let (major, minor) = keel::version();
    assert!(major > 0 && minor > 0);
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_put_get_and_iterate_match_model(
        ops in proptest::collection::vec(
            (proptest::collection::vec(any::<u8>(), 0..8), proptest::option::of(proptest::collection::vec(any::<u8>(), 0..16))),
            1..40,
        )
    ) {
        let (db, _dir) = test_db();
        let mut model = std::collections::BTreeMap::new();
        for (key, value) in &ops {
            match value {
                Some(value) => {
                    db.put(key, value).unwrap();
                    model.insert(key.clone(), value.clone());
                }
                None => {
                    db.delete(key).unwrap();
                    model.remove(key);
                }
            }
        }

        for (key, _) in &ops {
            prop_assert_eq!(db.get(key).unwrap(), model.get(key).cloned());
        }
        let expected: Vec<(Vec<u8>, Vec<u8>)> = model.into_iter().collect();
        prop_assert_eq!(entries(&db), expected);
    }
}
