/// Atomic Multi-CF Database Writer
///
/// Accumulates writes across multiple RocksDB column families and commits
/// them in a single atomic WriteBatch. Either all operations in a flush
/// succeed together, or none do. File progress markers are committed in the
/// same batch as the rows they describe, which is what keeps the per-file
/// contiguity invariant across crashes.

use std::sync::Arc;

use rocksdb::{WriteBatch, DB};

use crate::types::BoxedError;

/// A single buffered database operation
#[derive(Clone)]
enum Operation {
    Put {
        cf_name: &'static str,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        cf_name: &'static str,
        key: Vec<u8>,
    },
}

pub struct BatchWriter {
    db: Arc<DB>,
    operations: Vec<Operation>,
    batch_size_limit: usize,
}

impl BatchWriter {
    pub fn new(db: Arc<DB>, batch_size_limit: usize) -> Self {
        Self {
            db,
            operations: Vec::new(),
            batch_size_limit,
        }
    }

    /// Add a put operation to the batch
    pub fn put(&mut self, cf_name: &'static str, key: Vec<u8>, value: Vec<u8>) {
        self.operations.push(Operation::Put { cf_name, key, value });
    }

    /// Add a delete operation to the batch
    pub fn delete(&mut self, cf_name: &'static str, key: Vec<u8>) {
        self.operations.push(Operation::Delete { cf_name, key });
    }

    /// Check if the batch should be flushed based on size
    pub fn should_flush(&self) -> bool {
        self.operations.len() >= self.batch_size_limit
    }

    /// Get total pending operations
    pub fn pending_count(&self) -> usize {
        self.operations.len()
    }

    /// Commit all accumulated writes atomically
    pub fn flush(&mut self) -> Result<(), BoxedError> {
        if self.operations.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::default();
        for op in &self.operations {
            match op {
                Operation::Put { cf_name, key, value } => {
                    let cf = self
                        .db
                        .cf_handle(cf_name)
                        .ok_or_else(|| format!("{} CF not found", cf_name))?;
                    batch.put_cf(&cf, key, value);
                }
                Operation::Delete { cf_name, key } => {
                    let cf = self
                        .db
                        .cf_handle(cf_name)
                        .ok_or_else(|| format!("{} CF not found", cf_name))?;
                    batch.delete_cf(&cf, key);
                }
            }
        }
        self.db.write(batch)?;
        self.operations.clear();
        Ok(())
    }
}
