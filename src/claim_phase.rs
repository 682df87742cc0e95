/// Claim Phase Workers
///
/// Derives claim rows from claim-typed TXOs:
/// - insert claims for newly-spendable outputs
/// - update claims whose output was republished
/// - delete claims whose output was abandoned
/// - apply name takeovers from the node's journal
/// - recompute per-claim support stake totals
/// - recompute per-channel content statistics
///
/// Insertions run before updates because an update of a republished claim
/// references the row inserted in the same cycle.

use std::collections::{HashMap, HashSet};

use rocksdb::IteratorMode;
use tracing::debug;

use crate::batch_writer::BatchWriter;
use crate::constants::{
    CF_CHANNEL_STATS, CF_CLAIM, CF_SUPPORT, CF_TAKEOVER, CF_TXO, CLAIM_FLUSH_SIZE,
    TXO_TYPE_CHANNEL,
};
use crate::db::TaskContext;
use crate::queries::{self, TxoFilter};
use crate::sync::CLAIM_MAIN_EVENT;
use crate::types::{
    BlockRange, BoxedError, ChannelStatsRow, ClaimRow, SupportRow, SyncError, TakeoverRow, TxoRow,
};

/// Insert claim rows for unspent claim-typed TXOs in `batch`. With
/// `only_missing` (incremental sync), TXOs whose claim id already has a row
/// are left for `claims_update`. Returns the number of rows written.
pub fn claims_insert(
    ctx: &TaskContext,
    txo_types: &'static [u8],
    batch: BlockRange,
    only_missing: bool,
) -> Result<usize, BoxedError> {
    let filter = TxoFilter {
        missing_in_claims: only_missing,
        ..Default::default()
    };
    let progress = ctx.progress(CLAIM_MAIN_EVENT);
    let mut writer = BatchWriter::new(ctx.db.clone(), CLAIM_FLUSH_SIZE);
    let mut inserted = 0usize;

    let txo_cf = ctx.cf(CF_TXO)?;
    for result in ctx.db.iterator_cf(txo_cf, IteratorMode::Start) {
        let (key, value) = result?;
        let row: TxoRow = bincode::deserialize(&value)?;
        if row.is_spent() || !txo_types.contains(&row.txo_type) || !batch.contains(row.height) {
            continue;
        }
        let claim_id = match &row.claim_id {
            Some(id) => id.clone(),
            None => continue,
        };
        if filter.missing_in_claims {
            let existing: Option<ClaimRow> = ctx.get_row(CF_CLAIM, &claim_id)?;
            if existing.is_some() {
                continue;
            }
        }
        let claim = ClaimRow {
            claim_type: row.txo_type,
            name: row.claim_name.clone().unwrap_or_default(),
            txo_key: key.to_vec(),
            amount: row.amount,
            height: row.height,
            channel_id: row.channel_id.clone(),
            support_total: 0,
            takeover_height: None,
        };
        writer.put(CF_CLAIM, claim_id, bincode::serialize(&claim)?);
        inserted += 1;
        if writer.should_flush() {
            if ctx.interrupted() {
                return Err(SyncError::new("claim insert interrupted").into());
            }
            writer.flush()?;
            progress.add(CLAIM_FLUSH_SIZE as u64);
        }
    }
    writer.flush()?;
    debug!(inserted, batch = %batch, "claims inserted");
    Ok(inserted)
}

/// Rewrite claim rows whose claim id exists but whose stored TXO is stale
/// (republished claims). Stake and takeover fields are preserved.
pub fn claims_update(
    ctx: &TaskContext,
    txo_types: &'static [u8],
    batch: BlockRange,
) -> Result<usize, BoxedError> {
    let progress = ctx.progress(CLAIM_MAIN_EVENT);
    let mut writer = BatchWriter::new(ctx.db.clone(), CLAIM_FLUSH_SIZE);
    let mut updated = 0usize;

    let txo_cf = ctx.cf(CF_TXO)?;
    for result in ctx.db.iterator_cf(txo_cf, IteratorMode::Start) {
        let (key, value) = result?;
        let row: TxoRow = bincode::deserialize(&value)?;
        if row.is_spent() || !txo_types.contains(&row.txo_type) || !batch.contains(row.height) {
            continue;
        }
        let claim_id = match &row.claim_id {
            Some(id) => id.clone(),
            None => continue,
        };
        let mut claim: ClaimRow = match ctx.get_row(CF_CLAIM, &claim_id)? {
            Some(claim) => claim,
            None => continue,
        };
        if claim.txo_key == key.as_ref() || row.height < claim.height {
            continue;
        }
        claim.claim_type = row.txo_type;
        if let Some(name) = &row.claim_name {
            claim.name = name.clone();
        }
        claim.txo_key = key.to_vec();
        claim.amount = row.amount;
        claim.height = row.height;
        claim.channel_id = row.channel_id.clone();
        writer.put(CF_CLAIM, claim_id, bincode::serialize(&claim)?);
        updated += 1;
        if writer.should_flush() {
            if ctx.interrupted() {
                return Err(SyncError::new("claim update interrupted").into());
            }
            writer.flush()?;
            progress.add(CLAIM_FLUSH_SIZE as u64);
        }
    }
    writer.flush()?;
    debug!(updated, batch = %batch, "claims updated");
    Ok(updated)
}

/// Delete claims whose TXO has been abandoned. `expected` is the planning
/// count, used for progress only.
pub fn claims_delete(ctx: &TaskContext, expected: usize) -> Result<usize, BoxedError> {
    let progress = ctx.progress(CLAIM_MAIN_EVENT);
    let mut writer = BatchWriter::new(ctx.db.clone(), CLAIM_FLUSH_SIZE);
    let mut deleted = 0usize;

    let claim_cf = ctx.cf(CF_CLAIM)?;
    for result in ctx.db.iterator_cf(claim_cf, IteratorMode::Start) {
        let (claim_id, value) = result?;
        let claim: ClaimRow = bincode::deserialize(&value)?;
        let txo: Option<TxoRow> = ctx.get_row(CF_TXO, &claim.txo_key)?;
        if !matches!(txo, Some(row) if row.is_spent()) {
            continue;
        }
        if claim.claim_type == TXO_TYPE_CHANNEL {
            writer.delete(CF_CHANNEL_STATS, claim_id.to_vec());
        }
        writer.delete(CF_CLAIM, claim_id.to_vec());
        deleted += 1;
        if writer.should_flush() {
            if ctx.interrupted() {
                return Err(SyncError::new("claim delete interrupted").into());
            }
            writer.flush()?;
        }
    }
    writer.flush()?;
    progress.add(deleted as u64);
    debug!(deleted, expected, "abandoned claims deleted");
    Ok(deleted)
}

/// Apply the node's takeover journal for the added range: rewrite the
/// winner-at-name relation and stamp the takeover height on the winning
/// claim. Claims inserted earlier in the same cycle are visible here.
pub fn update_takeovers(
    ctx: &TaskContext,
    blocks: BlockRange,
    expected: usize,
) -> Result<usize, BoxedError> {
    let takeovers = ctx.chain.get_takeovers(blocks.start, blocks.end)?;
    let progress = ctx.progress(CLAIM_MAIN_EVENT);
    let mut writer = BatchWriter::new(ctx.db.clone(), CLAIM_FLUSH_SIZE);
    let mut applied = 0usize;

    for (height, takeover) in takeovers {
        let row = TakeoverRow {
            claim_id: takeover.claim_id.clone(),
            height,
        };
        writer.put(
            CF_TAKEOVER,
            takeover.name.as_bytes().to_vec(),
            bincode::serialize(&row)?,
        );
        if let Some(mut claim) = ctx.get_row::<ClaimRow>(CF_CLAIM, &takeover.claim_id)? {
            claim.takeover_height = Some(height);
            writer.put(CF_CLAIM, takeover.claim_id.clone(), bincode::serialize(&claim)?);
        }
        applied += 1;
    }
    writer.flush()?;
    progress.add(applied as u64);
    debug!(applied, expected, blocks = %blocks, "takeovers applied");
    Ok(applied)
}

/// Recompute `support_total` for claims whose support set changed in
/// `blocks`. Sums only supports whose TXO is still unspent, so abandoned
/// supports stop counting the cycle their spend is resolved.
pub fn update_stakes(
    ctx: &TaskContext,
    blocks: BlockRange,
    expected: usize,
) -> Result<usize, BoxedError> {
    let changed = queries::claims_with_changed_supports(ctx, blocks)?;
    if changed.is_empty() {
        return Ok(0);
    }

    let mut totals: HashMap<Vec<u8>, u64> = HashMap::new();
    let support_cf = ctx.cf(CF_SUPPORT)?;
    for result in ctx.db.iterator_cf(support_cf, IteratorMode::Start) {
        let (key, value) = result?;
        let support: SupportRow = bincode::deserialize(&value)?;
        if !changed.contains(&support.claim_id) {
            continue;
        }
        let txo: Option<TxoRow> = ctx.get_row(CF_TXO, &key)?;
        if matches!(txo, Some(row) if !row.is_spent()) {
            *totals.entry(support.claim_id.clone()).or_insert(0) += support.amount;
        }
    }

    let progress = ctx.progress(CLAIM_MAIN_EVENT);
    let mut writer = BatchWriter::new(ctx.db.clone(), CLAIM_FLUSH_SIZE);
    let mut updated = 0usize;
    for claim_id in &changed {
        let mut claim: ClaimRow = match ctx.get_row(CF_CLAIM, claim_id)? {
            Some(claim) => claim,
            None => continue, // support for a claim we have not indexed yet
        };
        claim.support_total = totals.get(claim_id).copied().unwrap_or(0);
        writer.put(CF_CLAIM, claim_id.clone(), bincode::serialize(&claim)?);
        updated += 1;
    }
    writer.flush()?;
    progress.add(updated as u64);
    debug!(updated, expected, blocks = %blocks, "stakes recomputed");
    Ok(updated)
}

/// Recompute content statistics for flagged channels. The initial-sync bulk
/// path scans every channel instead of only the flagged set.
pub fn update_channel_stats(
    ctx: &TaskContext,
    blocks: Option<BlockRange>,
    initial_sync: bool,
    expected: usize,
) -> Result<usize, BoxedError> {
    let targets: HashSet<Vec<u8>> = if initial_sync {
        let claim_cf = ctx.cf(CF_CLAIM)?;
        let mut channels = HashSet::new();
        for result in ctx.db.iterator_cf(claim_cf, IteratorMode::Start) {
            let (claim_id, value) = result?;
            let claim: ClaimRow = bincode::deserialize(&value)?;
            if claim.claim_type == TXO_TYPE_CHANNEL {
                channels.insert(claim_id.to_vec());
            }
        }
        channels
    } else {
        let blocks = blocks.ok_or("channel stats need a block range outside initial sync")?;
        queries::channels_with_changed_content(ctx, blocks)?
    };
    if targets.is_empty() {
        return Ok(0);
    }

    let mut stats: HashMap<Vec<u8>, ChannelStatsRow> = HashMap::new();
    let claim_cf = ctx.cf(CF_CLAIM)?;
    for result in ctx.db.iterator_cf(claim_cf, IteratorMode::Start) {
        let (_, value) = result?;
        let claim: ClaimRow = bincode::deserialize(&value)?;
        if claim.claim_type == TXO_TYPE_CHANNEL {
            continue;
        }
        if let Some(channel_id) = &claim.channel_id {
            if targets.contains(channel_id) {
                let entry = stats.entry(channel_id.clone()).or_default();
                entry.content_count += 1;
                entry.aggregate_amount += claim.amount;
            }
        }
    }

    let mut writer = BatchWriter::new(ctx.db.clone(), CLAIM_FLUSH_SIZE);
    let mut written = 0usize;
    for channel_id in targets {
        let row = stats.remove(&channel_id).unwrap_or_default();
        writer.put(CF_CHANNEL_STATS, channel_id, bincode::serialize(&row)?);
        written += 1;
    }
    writer.flush()?;
    debug!(written, expected, initial_sync, "channel stats recomputed");
    Ok(written)
}
