/// Chain and Index Constants
///
/// These constants ensure consistent handling of TXO type codes, special
/// height values and column family names across the codebase. All type and
/// height logic should use these constants instead of magic numbers.

/// Genesis block height (the first block in the chain)
pub const HEIGHT_GENESIS: i32 = 0;

/// "Nothing indexed" marker - returned for files and tips with no blocks
pub const HEIGHT_NONE: i32 = -1;

/// TXO type codes. The claim-script opcode (and for claims, the shape of
/// the name) determines the code stored on each output row.
pub const TXO_TYPE_OTHER: u8 = 0;
pub const TXO_TYPE_STREAM: u8 = 1;
pub const TXO_TYPE_CHANNEL: u8 = 2;
pub const TXO_TYPE_SUPPORT: u8 = 3;
pub const TXO_TYPE_PURCHASE: u8 = 4;
pub const TXO_TYPE_COLLECTION: u8 = 5;
pub const TXO_TYPE_REPOST: u8 = 6;

/// Type codes that count as "content" (claims that can live inside a channel)
pub const CONTENT_TYPE_CODES: [u8; 3] = [TXO_TYPE_STREAM, TXO_TYPE_COLLECTION, TXO_TYPE_REPOST];

/// Type codes for channel claims
pub const CHANNEL_TYPE_CODES: [u8; 1] = [TXO_TYPE_CHANNEL];

/// Type codes for supports
pub const SUPPORT_TYPE_CODES: [u8; 1] = [TXO_TYPE_SUPPORT];

/// Claim-script opcodes (prefix byte of the scriptPubKey)
pub const OP_CLAIM_NAME: u8 = 0xb5;
pub const OP_SUPPORT_CLAIM: u8 = 0xb6;
pub const OP_UPDATE_CLAIM: u8 = 0xb7;

/// Tag byte marking a channel signature envelope at the front of a claim value
pub const CHANNEL_SIG_TAG: u8 = 0x01;

/// Block file record prefix (network magic)
pub const BLOCK_MAGIC: [u8; 4] = [0xfa, 0xe4, 0xaa, 0xf1];

/// Column family names for the index database
pub const CF_BLOCK: &str = "block";
pub const CF_TXO: &str = "txo";
pub const CF_TXI: &str = "txi";
pub const CF_CLAIM: &str = "claim";
pub const CF_SUPPORT: &str = "support";
pub const CF_TAKEOVER: &str = "takeover";
pub const CF_CHANNEL_STATS: &str = "channel_stats";
pub const CF_FILTER: &str = "filter";
pub const CF_FILE_PROGRESS: &str = "file_progress";

pub const COLUMN_FAMILIES: [&str; 9] = [
    CF_BLOCK,
    CF_TXO,
    CF_TXI,
    CF_CLAIM,
    CF_SUPPORT,
    CF_TAKEOVER,
    CF_CHANNEL_STATS,
    CF_FILTER,
    CF_FILE_PROGRESS,
];

/// Flush thresholds used inside phase workers. Per-cycle chunking is
/// configured on the synchronizer; these bound memory within one task.
pub const CLAIM_FLUSH_SIZE: usize = 10_000;
pub const SUPPORT_FLUSH_SIZE: usize = 10_000;
pub const TXIO_FLUSH_SIZE: usize = 20_000;

/// Check if a TXO type code counts as content
#[inline]
pub fn is_content_type(txo_type: u8) -> bool {
    CONTENT_TYPE_CODES.contains(&txo_type)
}

/// Check if a TXO type code is a claim of any kind (channel or content)
#[inline]
pub fn is_claim_type(txo_type: u8) -> bool {
    txo_type == TXO_TYPE_CHANNEL || is_content_type(txo_type)
}
