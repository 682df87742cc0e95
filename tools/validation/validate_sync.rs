/// Offline invariant checker for a synced index:
/// - per-file height contiguity (file progress matches the block rows)
/// - spend journal fully applied
/// - every live claim points at an unspent, claim-typed TXO
/// - stake totals match live supports (reported only; totals may lag one
///   cycle for supports that landed with their claim)

use std::collections::HashMap;

use rocksdb::{IteratorMode, Options, DB};
use rustysync::config::{get_db_path, load_config};
use rustysync::constants::{
    is_claim_type, CF_BLOCK, CF_CLAIM, CF_FILE_PROGRESS, CF_SUPPORT, CF_TXI, CF_TXO,
    COLUMN_FAMILIES,
};
use rustysync::types::{decode_file_progress, BlockRow, ClaimRow, SupportRow, TxoRow, BoxedError};

fn main() -> Result<(), BoxedError> {
    let config = load_config()?;
    let db_path = get_db_path(&config)?;

    let mut cf_names = vec!["default"];
    cf_names.extend(COLUMN_FAMILIES);
    let opts = Options::default();
    let db = DB::open_cf_for_read_only(&opts, db_path, &cf_names, false)?;

    let mut violations = 0usize;

    // file contiguity: collect per-file heights from the block rows
    let block_cf = db.cf_handle(CF_BLOCK).ok_or("block CF not found")?;
    let mut heights_by_file: HashMap<u32, Vec<i32>> = HashMap::new();
    for result in db.iterator_cf(block_cf, IteratorMode::Start) {
        let (key, value) = result?;
        if key.len() != 4 {
            continue;
        }
        let height = i32::from_be_bytes([key[0], key[1], key[2], key[3]]);
        let row: BlockRow = bincode::deserialize(&value)?;
        heights_by_file.entry(row.file_number).or_default().push(height);
    }
    let progress_cf = db.cf_handle(CF_FILE_PROGRESS).ok_or("file_progress CF not found")?;
    for result in db.iterator_cf(progress_cf, IteratorMode::Start) {
        let (key, value) = result?;
        if key.len() != 4 {
            continue;
        }
        let file_number = u32::from_be_bytes([key[0], key[1], key[2], key[3]]);
        let best = decode_file_progress(Some(value.to_vec()));
        match heights_by_file.get_mut(&file_number) {
            None => {
                println!("VIOLATION: file {} has progress {} but no blocks", file_number, best);
                violations += 1;
            }
            Some(heights) => {
                heights.sort_unstable();
                let max = *heights.last().unwrap();
                if max != best {
                    println!(
                        "VIOLATION: file {} progress {} but highest block {}",
                        file_number, best, max
                    );
                    violations += 1;
                }
                for pair in heights.windows(2) {
                    if pair[1] != pair[0] + 1 {
                        println!(
                            "VIOLATION: file {} height gap between {} and {}",
                            file_number, pair[0], pair[1]
                        );
                        violations += 1;
                    }
                }
            }
        }
    }

    // spend journal fully applied
    let txi_cf = db.cf_handle(CF_TXI).ok_or("txi CF not found")?;
    let pending = db.iterator_cf(txi_cf, IteratorMode::Start).count();
    if pending > 0 {
        println!("VIOLATION: {} unapplied spend journal entries", pending);
        violations += 1;
    }

    // claims point at unspent TXOs; stake totals match live supports
    let txo_cf = db.cf_handle(CF_TXO).ok_or("txo CF not found")?;
    let support_cf = db.cf_handle(CF_SUPPORT).ok_or("support CF not found")?;
    let mut live_support_totals: HashMap<Vec<u8>, u64> = HashMap::new();
    for result in db.iterator_cf(support_cf, IteratorMode::Start) {
        let (key, value) = result?;
        let support: SupportRow = bincode::deserialize(&value)?;
        let unspent = match db.get_cf(&txo_cf, &key)? {
            Some(bytes) => {
                let txo: TxoRow = bincode::deserialize(&bytes)?;
                txo.spent_height.is_none()
            }
            None => false,
        };
        if unspent {
            *live_support_totals.entry(support.claim_id).or_insert(0) += support.amount;
        }
    }

    let claim_cf = db.cf_handle(CF_CLAIM).ok_or("claim CF not found")?;
    for result in db.iterator_cf(claim_cf, IteratorMode::Start) {
        let (claim_id, value) = result?;
        let claim: ClaimRow = bincode::deserialize(&value)?;
        match db.get_cf(&txo_cf, &claim.txo_key)? {
            None => {
                println!("VIOLATION: claim {} has no TXO row", hex::encode(&claim_id));
                violations += 1;
            }
            Some(bytes) => {
                let txo: TxoRow = bincode::deserialize(&bytes)?;
                if txo.spent_height.is_some() {
                    println!("VIOLATION: claim {} points at a spent TXO", hex::encode(&claim_id));
                    violations += 1;
                }
                if !is_claim_type(txo.txo_type) {
                    println!(
                        "VIOLATION: claim {} points at a non-claim TXO (type {})",
                        hex::encode(&claim_id),
                        txo.txo_type
                    );
                    violations += 1;
                }
            }
        }
        let live = live_support_totals.get(claim_id.as_ref()).copied().unwrap_or(0);
        if claim.support_total != live {
            // may be the one-cycle stake lag, so report without failing
            println!(
                "NOTE: claim {} support_total {} vs live supports {}",
                hex::encode(&claim_id),
                claim.support_total,
                live
            );
        }
    }

    if violations == 0 {
        println!("OK: all invariants hold");
        Ok(())
    } else {
        Err(format!("{} invariant violations", violations).into())
    }
}
