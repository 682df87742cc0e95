use serde::Deserialize;
use serde::Serialize;
use std::fmt;

use crate::constants::{HEIGHT_GENESIS, HEIGHT_NONE};

/// Production-ready error type with context
#[derive(Debug, Clone)]
pub struct SyncError {
    pub message: String,
}

impl SyncError {
    /// Create a new error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SyncError {}

/// Boxed error type used across async task boundaries
pub type BoxedError = Box<dyn std::error::Error + Send + Sync>;

/// An inclusive range of block heights, `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub start: i32,
    pub end: i32,
}

impl BlockRange {
    pub fn new(start: i32, end: i32) -> Self {
        Self { start, end }
    }

    #[inline]
    pub fn contains(&self, height: i32) -> bool {
        height >= self.start && height <= self.end
    }

    /// True when this range begins at genesis (enables bulk ingest paths)
    #[inline]
    pub fn is_initial(&self) -> bool {
        self.start == HEIGHT_GENESIS
    }

    #[inline]
    pub fn len(&self) -> u64 {
        if self.end < self.start {
            0
        } else {
            (self.end - self.start) as u64 + 1
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Summary of one node block file, as reported by the chain's block index
#[derive(Debug, Clone)]
pub struct BlockFileInfo {
    pub file_number: u32,
    pub best_height: i32,
    pub txs: u32,
    pub blocks: u32,
}

/// Row stored in the `block` CF, keyed by big-endian height
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRow {
    /// Block hash (internal byte order)
    pub hash: Vec<u8>,
    /// Node block file this block was read from
    pub file_number: u32,
    pub tx_count: u32,
}

/// Row stored in the `txo` CF, keyed by txid + big-endian nout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxoRow {
    pub height: i32,
    pub txo_type: u8,
    pub amount: u64,
    pub script: Vec<u8>,
    /// Height of the block that consumed this output, set by the TXIO phase
    pub spent_height: Option<i32>,
    pub claim_id: Option<Vec<u8>>,
    pub claim_name: Option<String>,
    pub channel_id: Option<Vec<u8>>,
}

impl TxoRow {
    #[inline]
    pub fn is_spent(&self) -> bool {
        self.spent_height.is_some()
    }
}

/// Spend-journal row stored in the `txi` CF, keyed by the spent outpoint.
/// Entries are deleted once applied to the matching `txo` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxiRow {
    /// Height of the spending block
    pub height: i32,
}

/// Row stored in the `claim` CF, keyed by the 20-byte claim id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRow {
    pub claim_type: u8,
    pub name: String,
    /// Key of the claim's current (unspent) TXO
    pub txo_key: Vec<u8>,
    pub amount: u64,
    pub height: i32,
    pub channel_id: Option<Vec<u8>>,
    pub support_total: u64,
    pub takeover_height: Option<i32>,
}

/// Row stored in the `support` CF, keyed by txid + nout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupportRow {
    pub claim_id: Vec<u8>,
    pub amount: u64,
    pub height: i32,
}

/// Row stored in the `takeover` CF, keyed by claim name bytes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeoverRow {
    pub claim_id: Vec<u8>,
    pub height: i32,
}

/// Row stored in the `channel_stats` CF, keyed by channel claim id
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelStatsRow {
    pub content_count: u64,
    pub aggregate_amount: u64,
}

/// Build the `txo`/`txi`/`support` CF key for an outpoint
pub fn txo_key(txid: &[u8], nout: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(txid.len() + 4);
    key.extend_from_slice(txid);
    key.extend_from_slice(&nout.to_be_bytes());
    key
}

/// Decode a `file_progress` CF value, defaulting to "nothing indexed"
pub fn decode_file_progress(bytes: Option<Vec<u8>>) -> i32 {
    match bytes {
        Some(b) if b.len() == 4 => i32::from_le_bytes([b[0], b[1], b[2], b[3]]),
        _ => HEIGHT_NONE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_range_contains() {
        let range = BlockRange::new(10, 20);
        assert!(range.contains(10));
        assert!(range.contains(20));
        assert!(!range.contains(9));
        assert!(!range.contains(21));
        assert_eq!(range.len(), 11);
    }

    #[test]
    fn test_block_range_initial() {
        assert!(BlockRange::new(0, 5).is_initial());
        assert!(!BlockRange::new(1, 5).is_initial());
    }

    #[test]
    fn test_txo_key_layout() {
        let txid = vec![0xab; 32];
        let key = txo_key(&txid, 7);
        assert_eq!(key.len(), 36);
        assert_eq!(&key[..32], txid.as_slice());
        assert_eq!(&key[32..], &7u32.to_be_bytes());
    }

    #[test]
    fn test_decode_file_progress_missing() {
        assert_eq!(decode_file_progress(None), HEIGHT_NONE);
        assert_eq!(decode_file_progress(Some(9i32.to_le_bytes().to_vec())), 9);
    }
}
