//! Regression tests for the atomic multi-CF BatchWriter
//!
//! These verify that a flush commits operations across column families
//! together and that the flush threshold behaves as a trigger, not a cap.

use crate::batch_writer::BatchWriter;
use crate::constants::{CF_BLOCK, CF_TXO, COLUMN_FAMILIES};
use rocksdb::{Options, DB};
use std::sync::Arc;
use tempfile::TempDir;

/// Helper: create a temporary RocksDB instance with the index CFs
fn create_test_db() -> (Arc<DB>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.create_missing_column_families(true);

    let mut cf_names = vec!["default"];
    cf_names.extend(COLUMN_FAMILIES);
    let db = DB::open_cf(&opts, temp_dir.path(), &cf_names).unwrap();

    (Arc::new(db), temp_dir)
}

#[test]
fn test_single_put_then_flush() {
    let (db, _temp_dir) = create_test_db();
    let mut batch = BatchWriter::new(db.clone(), 10_000);

    batch.put(CF_BLOCK, b"key".to_vec(), b"value".to_vec());
    assert_eq!(batch.pending_count(), 1);
    batch.flush().unwrap();
    assert_eq!(batch.pending_count(), 0);

    let cf = db.cf_handle(CF_BLOCK).unwrap();
    assert_eq!(db.get_cf(&cf, b"key").unwrap().unwrap(), b"value");
}

#[test]
fn test_nothing_written_before_flush() {
    let (db, _temp_dir) = create_test_db();
    let mut batch = BatchWriter::new(db.clone(), 10_000);

    batch.put(CF_BLOCK, b"key".to_vec(), b"value".to_vec());
    let cf = db.cf_handle(CF_BLOCK).unwrap();
    assert!(db.get_cf(&cf, b"key").unwrap().is_none());
    batch.flush().unwrap();
    assert!(db.get_cf(&cf, b"key").unwrap().is_some());
}

#[test]
fn test_multi_cf_flush_is_atomic_batch() {
    let (db, _temp_dir) = create_test_db();
    let mut batch = BatchWriter::new(db.clone(), 10_000);

    batch.put(CF_BLOCK, b"b".to_vec(), b"1".to_vec());
    batch.put(CF_TXO, b"t".to_vec(), b"2".to_vec());
    batch.flush().unwrap();

    let block_cf = db.cf_handle(CF_BLOCK).unwrap();
    let txo_cf = db.cf_handle(CF_TXO).unwrap();
    assert_eq!(db.get_cf(&block_cf, b"b").unwrap().unwrap(), b"1");
    assert_eq!(db.get_cf(&txo_cf, b"t").unwrap().unwrap(), b"2");
}

#[test]
fn test_delete_after_put_in_same_batch() {
    let (db, _temp_dir) = create_test_db();
    let mut batch = BatchWriter::new(db.clone(), 10_000);

    batch.put(CF_TXO, b"k".to_vec(), b"v".to_vec());
    batch.delete(CF_TXO, b"k".to_vec());
    batch.flush().unwrap();

    let cf = db.cf_handle(CF_TXO).unwrap();
    assert!(db.get_cf(&cf, b"k").unwrap().is_none());
}

#[test]
fn test_should_flush_threshold() {
    let (db, _temp_dir) = create_test_db();
    let mut batch = BatchWriter::new(db, 3);

    batch.put(CF_BLOCK, b"a".to_vec(), b"1".to_vec());
    batch.put(CF_BLOCK, b"b".to_vec(), b"2".to_vec());
    assert!(!batch.should_flush());
    batch.put(CF_BLOCK, b"c".to_vec(), b"3".to_vec());
    assert!(batch.should_flush());
}

#[test]
fn test_empty_flush_is_noop() {
    let (db, _temp_dir) = create_test_db();
    let mut batch = BatchWriter::new(db, 10);
    batch.flush().unwrap();
    assert_eq!(batch.pending_count(), 0);
}
