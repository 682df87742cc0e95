/// Planning Queries
///
/// Counting and load-distribution passes the synchronizer runs before
/// committing a phase. Everything here is read-only over the index CFs;
/// the phase workers in `block_phase`/`claim_phase`/`support_phase` do the
/// writes.

use std::collections::HashSet;

use rocksdb::IteratorMode;

use crate::constants::{CF_BLOCK, CF_CLAIM, CF_FILTER, CF_SUPPORT, CF_TXO, TXO_TYPE_SUPPORT};
use crate::db::TaskContext;
use crate::types::{BlockRange, BoxedError, ClaimRow, TxoRow};

/// Extra restrictions applied when matching unspent TXOs
#[derive(Debug, Clone, Copy, Default)]
pub struct TxoFilter {
    /// Only TXOs with no row in the supports table
    pub missing_in_supports: bool,
    /// Only TXOs whose claim id has no row in the claims table
    pub missing_in_claims: bool,
    /// Only TXOs whose claim row is absent or points at an older TXO
    pub missing_or_stale_in_claims: bool,
}

pub fn has_rows(ctx: &TaskContext, cf_name: &str) -> Result<bool, BoxedError> {
    let cf = ctx.cf(cf_name)?;
    for result in ctx.db.iterator_cf(cf, IteratorMode::Start) {
        result?;
        return Ok(true);
    }
    Ok(false)
}

fn txo_matches(
    ctx: &TaskContext,
    key: &[u8],
    row: &TxoRow,
    txo_types: &[u8],
    blocks: Option<BlockRange>,
    filter: TxoFilter,
) -> Result<bool, BoxedError> {
    if row.is_spent() || !txo_types.contains(&row.txo_type) {
        return Ok(false);
    }
    if let Some(range) = blocks {
        if !range.contains(row.height) {
            return Ok(false);
        }
    }
    if filter.missing_in_supports {
        let cf = ctx.cf(CF_SUPPORT)?;
        if ctx.db.get_cf(cf, key)?.is_some() {
            return Ok(false);
        }
    }
    if filter.missing_in_claims || filter.missing_or_stale_in_claims {
        let claim_id = match &row.claim_id {
            Some(id) => id.clone(),
            None => return Ok(false),
        };
        let claim: Option<ClaimRow> = ctx.get_row(CF_CLAIM, &claim_id)?;
        match claim {
            None => {}
            Some(claim) => {
                if filter.missing_in_claims {
                    return Ok(false);
                }
                // stale means the claim row still points at an older TXO
                if claim.txo_key == key {
                    return Ok(false);
                }
            }
        }
    }
    Ok(true)
}

/// Visit every matching unspent TXO
fn for_each_unspent_txo(
    ctx: &TaskContext,
    txo_types: &[u8],
    blocks: Option<BlockRange>,
    filter: TxoFilter,
    mut visit: impl FnMut(&[u8], &TxoRow) -> Result<(), BoxedError>,
) -> Result<(), BoxedError> {
    let cf = ctx.cf(CF_TXO)?;
    for result in ctx.db.iterator_cf(cf, IteratorMode::Start) {
        let (key, value) = result?;
        let row: TxoRow = bincode::deserialize(&value)?;
        if txo_matches(ctx, &key, &row, txo_types, blocks, filter)? {
            visit(&key, &row)?;
        }
    }
    Ok(())
}

pub fn count_unspent_txos(
    ctx: &TaskContext,
    txo_types: &[u8],
    blocks: Option<BlockRange>,
    filter: TxoFilter,
) -> Result<usize, BoxedError> {
    let mut count = 0usize;
    for_each_unspent_txo(ctx, txo_types, blocks, filter, |_, _| {
        count += 1;
        Ok(())
    })?;
    Ok(count)
}

/// Count matching unspent TXOs and split them into height-range batches of
/// roughly `chunk_size` TXOs each. Batches never split a height, so workers
/// operating on different batches touch disjoint rows.
pub fn distribute_unspent_txos(
    ctx: &TaskContext,
    txo_types: &[u8],
    blocks: Option<BlockRange>,
    filter: TxoFilter,
    chunk_size: usize,
) -> Result<(usize, Vec<BlockRange>), BoxedError> {
    let mut heights = Vec::new();
    for_each_unspent_txo(ctx, txo_types, blocks, filter, |_, row| {
        heights.push(row.height);
        Ok(())
    })?;
    heights.sort_unstable();
    let total = heights.len();
    let mut batches = Vec::new();
    let mut index = 0usize;
    while index < total {
        let start = heights[index];
        let mut end = heights[index];
        let mut in_batch = 0usize;
        while index < total {
            // keep all TXOs of one height in the same batch
            if in_batch >= chunk_size && heights[index] != end {
                break;
            }
            end = heights[index];
            in_batch += 1;
            index += 1;
        }
        batches.push(BlockRange::new(start, end));
    }
    Ok((total, batches))
}

/// Claims whose current TXO has been spent
pub fn count_abandoned_claims(ctx: &TaskContext) -> Result<usize, BoxedError> {
    let cf = ctx.cf(CF_CLAIM)?;
    let mut count = 0usize;
    for result in ctx.db.iterator_cf(cf, IteratorMode::Start) {
        let (_, value) = result?;
        let claim: ClaimRow = bincode::deserialize(&value)?;
        let txo: Option<TxoRow> = ctx.get_row(CF_TXO, &claim.txo_key)?;
        if matches!(txo, Some(row) if row.is_spent()) {
            count += 1;
        }
    }
    Ok(count)
}

/// Supports whose TXO has been spent
pub fn count_abandoned_supports(ctx: &TaskContext) -> Result<usize, BoxedError> {
    let cf = ctx.cf(CF_SUPPORT)?;
    let mut count = 0usize;
    for result in ctx.db.iterator_cf(cf, IteratorMode::Start) {
        let (key, _) = result?;
        let txo: Option<TxoRow> = ctx.get_row(CF_TXO, &key)?;
        if matches!(txo, Some(row) if row.is_spent()) {
            count += 1;
        }
    }
    Ok(count)
}

/// Distinct claims whose support set changed inside `blocks`: a support TXO
/// appeared in the range or was spent in the range.
pub fn count_claims_with_changed_supports(
    ctx: &TaskContext,
    blocks: BlockRange,
) -> Result<usize, BoxedError> {
    Ok(claims_with_changed_supports(ctx, blocks)?.len())
}

pub fn claims_with_changed_supports(
    ctx: &TaskContext,
    blocks: BlockRange,
) -> Result<HashSet<Vec<u8>>, BoxedError> {
    let cf = ctx.cf(CF_TXO)?;
    let mut claim_ids = HashSet::new();
    for result in ctx.db.iterator_cf(cf, IteratorMode::Start) {
        let (_, value) = result?;
        let row: TxoRow = bincode::deserialize(&value)?;
        if row.txo_type != TXO_TYPE_SUPPORT {
            continue;
        }
        let touched = blocks.contains(row.height)
            || matches!(row.spent_height, Some(h) if blocks.contains(h));
        if touched {
            if let Some(claim_id) = &row.claim_id {
                claim_ids.insert(claim_id.clone());
            }
        }
    }
    Ok(claim_ids)
}

/// Distinct channels whose content set changed inside `blocks`: a content
/// claim TXO appeared in the range or was spent in the range.
pub fn count_channels_with_changed_content(
    ctx: &TaskContext,
    blocks: BlockRange,
) -> Result<usize, BoxedError> {
    Ok(channels_with_changed_content(ctx, blocks)?.len())
}

pub fn channels_with_changed_content(
    ctx: &TaskContext,
    blocks: BlockRange,
) -> Result<HashSet<Vec<u8>>, BoxedError> {
    let cf = ctx.cf(CF_TXO)?;
    let mut channel_ids = HashSet::new();
    for result in ctx.db.iterator_cf(cf, IteratorMode::Start) {
        let (_, value) = result?;
        let row: TxoRow = bincode::deserialize(&value)?;
        if !crate::constants::is_content_type(row.txo_type) {
            continue;
        }
        let touched = blocks.contains(row.height)
            || matches!(row.spent_height, Some(h) if blocks.contains(h));
        if touched {
            if let Some(channel_id) = &row.channel_id {
                channel_ids.insert(channel_id.clone());
            }
        }
    }
    Ok(channel_ids)
}

/// Contiguous height ranges of indexed blocks that have no filter yet,
/// split into chunks of at most `chunk_size` blocks.
pub fn missing_filter_ranges(
    ctx: &TaskContext,
    chunk_size: usize,
) -> Result<Vec<BlockRange>, BoxedError> {
    let block_cf = ctx.cf(CF_BLOCK)?;
    let filter_cf = ctx.cf(CF_FILTER)?;
    let mut ranges: Vec<BlockRange> = Vec::new();
    for result in ctx.db.iterator_cf(block_cf, IteratorMode::Start) {
        let (key, _) = result?;
        if key.len() != 4 {
            continue;
        }
        let height = i32::from_be_bytes([key[0], key[1], key[2], key[3]]);
        if ctx.db.get_cf(filter_cf, &key)?.is_some() {
            continue;
        }
        match ranges.last_mut() {
            Some(last) if last.end + 1 == height && last.len() < chunk_size as u64 => {
                last.end = height;
            }
            _ => ranges.push(BlockRange::new(height, height)),
        }
    }
    Ok(ranges)
}
