/// Support Phase Workers
///
/// Mirrors the claim phase but simpler: one TXO type, no takeovers, no
/// channel statistics. Supports are inserted from support-typed outputs and
/// deleted once their output is spent.

use rocksdb::IteratorMode;
use tracing::debug;

use crate::batch_writer::BatchWriter;
use crate::constants::{CF_SUPPORT, CF_TXO, SUPPORT_FLUSH_SIZE, TXO_TYPE_SUPPORT};
use crate::db::TaskContext;
use crate::sync::SUPPORT_MAIN_EVENT;
use crate::types::{BlockRange, BoxedError, SupportRow, SyncError, TxoRow};

/// Insert support rows for unspent support-typed TXOs in `batch`. With
/// `only_missing` (incremental sync), TXOs that already have a support row
/// are skipped. Returns the number of rows written.
pub fn supports_insert(
    ctx: &TaskContext,
    batch: BlockRange,
    only_missing: bool,
) -> Result<usize, BoxedError> {
    let progress = ctx.progress(SUPPORT_MAIN_EVENT);
    let mut writer = BatchWriter::new(ctx.db.clone(), SUPPORT_FLUSH_SIZE);
    let mut inserted = 0usize;

    let txo_cf = ctx.cf(CF_TXO)?;
    let support_cf = ctx.cf(CF_SUPPORT)?;
    for result in ctx.db.iterator_cf(txo_cf, IteratorMode::Start) {
        let (key, value) = result?;
        let row: TxoRow = bincode::deserialize(&value)?;
        if row.is_spent() || row.txo_type != TXO_TYPE_SUPPORT || !batch.contains(row.height) {
            continue;
        }
        let claim_id = match &row.claim_id {
            Some(id) => id.clone(),
            None => continue,
        };
        if only_missing && ctx.db.get_cf(support_cf, &key)?.is_some() {
            continue;
        }
        let support = SupportRow {
            claim_id,
            amount: row.amount,
            height: row.height,
        };
        writer.put(CF_SUPPORT, key.to_vec(), bincode::serialize(&support)?);
        inserted += 1;
        if writer.should_flush() {
            if ctx.interrupted() {
                return Err(SyncError::new("support insert interrupted").into());
            }
            writer.flush()?;
            progress.add(SUPPORT_FLUSH_SIZE as u64);
        }
    }
    writer.flush()?;
    debug!(inserted, batch = %batch, "supports inserted");
    Ok(inserted)
}

/// Delete supports whose TXO has been abandoned. `expected` is the planning
/// count, used for progress only.
pub fn supports_delete(ctx: &TaskContext, expected: usize) -> Result<usize, BoxedError> {
    let progress = ctx.progress(SUPPORT_MAIN_EVENT);
    let mut writer = BatchWriter::new(ctx.db.clone(), SUPPORT_FLUSH_SIZE);
    let mut deleted = 0usize;

    let support_cf = ctx.cf(CF_SUPPORT)?;
    for result in ctx.db.iterator_cf(support_cf, IteratorMode::Start) {
        let (key, _) = result?;
        let txo: Option<TxoRow> = ctx.get_row(CF_TXO, &key)?;
        if !matches!(txo, Some(row) if row.is_spent()) {
            continue;
        }
        writer.delete(CF_SUPPORT, key.to_vec());
        deleted += 1;
        if writer.should_flush() {
            if ctx.interrupted() {
                return Err(SyncError::new("support delete interrupted").into());
            }
            writer.flush()?;
        }
    }
    writer.flush()?;
    progress.add(deleted as u64);
    debug!(deleted, expected, "abandoned supports deleted");
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainDb;
    use crate::db::Database;
    use crate::types::txo_key;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn test_ctx() -> (TaskContext, TempDir, TempDir) {
        let chain_dir = TempDir::new().unwrap();
        let db_dir = TempDir::new().unwrap();
        let chain = Arc::new(ChainDb::open(chain_dir.path()).unwrap());
        let db = Database::open(db_dir.path(), chain).unwrap();
        (db.task_context(), chain_dir, db_dir)
    }

    fn support_txo(height: i32, amount: u64) -> TxoRow {
        TxoRow {
            height,
            txo_type: TXO_TYPE_SUPPORT,
            amount,
            script: vec![0x51],
            spent_height: None,
            claim_id: Some(vec![1u8; 20]),
            claim_name: Some("video".to_string()),
            channel_id: None,
        }
    }

    #[test]
    fn test_insert_only_missing() {
        let (ctx, _c, _d) = test_ctx();
        let key = txo_key(&[1u8; 32], 0);
        let cf = ctx.cf(CF_TXO).unwrap();
        ctx.db
            .put_cf(cf, &key, bincode::serialize(&support_txo(3, 50)).unwrap())
            .unwrap();

        assert_eq!(supports_insert(&ctx, BlockRange::new(0, 5), false).unwrap(), 1);
        // second run with only_missing skips the existing row
        assert_eq!(supports_insert(&ctx, BlockRange::new(0, 5), true).unwrap(), 0);
        let support: SupportRow = ctx.get_row(CF_SUPPORT, &key).unwrap().unwrap();
        assert_eq!(support.amount, 50);
    }

    #[test]
    fn test_delete_abandoned() {
        let (ctx, _c, _d) = test_ctx();
        let key = txo_key(&[2u8; 32], 0);
        let cf = ctx.cf(CF_TXO).unwrap();
        ctx.db
            .put_cf(cf, &key, bincode::serialize(&support_txo(3, 50)).unwrap())
            .unwrap();
        supports_insert(&ctx, BlockRange::new(0, 5), false).unwrap();

        let mut spent = support_txo(3, 50);
        spent.spent_height = Some(6);
        ctx.db.put_cf(cf, &key, bincode::serialize(&spent).unwrap()).unwrap();

        assert_eq!(supports_delete(&ctx, 1).unwrap(), 1);
        assert!(ctx.get_row::<SupportRow>(CF_SUPPORT, &key).unwrap().is_none());
    }
}
