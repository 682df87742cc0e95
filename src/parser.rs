/// Block and Transaction Parser
///
/// Deserializes raw blocks out of the node's block files:
/// - 112-byte block headers (version, prev, merkle, claim trie root, time, bits, nonce)
/// - transactions with their inputs and outputs
/// - claim scripts (OP_CLAIM_NAME / OP_SUPPORT_CLAIM / OP_UPDATE_CLAIM prefixes)
///
/// Claim ids for fresh claims are derived from the outpoint:
/// ripemd160(sha256(txid || nout)).

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use ripemd160::Ripemd160;
use sha2::{Digest, Sha256};

use crate::constants::{
    CHANNEL_SIG_TAG, OP_CLAIM_NAME, OP_SUPPORT_CLAIM, OP_UPDATE_CLAIM, TXO_TYPE_CHANNEL,
    TXO_TYPE_OTHER, TXO_TYPE_STREAM, TXO_TYPE_SUPPORT,
};
use crate::types::SyncError;

/// Size of the serialized block header
pub const HEADER_SIZE: usize = 112;

#[derive(Debug, Clone)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_hash: Vec<u8>,
    pub merkle_root: Vec<u8>,
    pub claim_trie_root: Vec<u8>,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

#[derive(Debug, Clone)]
pub struct TxInput {
    pub prev_txid: Vec<u8>,
    pub prev_nout: u32,
    pub script: Vec<u8>,
    pub sequence: u32,
}

impl TxInput {
    /// Coinbase inputs reference the null outpoint and never spend a TXO
    pub fn is_coinbase(&self) -> bool {
        self.prev_nout == u32::MAX && self.prev_txid.iter().all(|b| *b == 0)
    }
}

#[derive(Debug, Clone)]
pub struct TxOutput {
    pub amount: u64,
    pub script: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub txid: Vec<u8>,
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub hash: Vec<u8>,
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

/// Parsed claim-script prefix
#[derive(Debug, Clone)]
pub struct ClaimScriptInfo {
    pub op: u8,
    pub name: String,
    /// Present for OP_UPDATE_CLAIM and OP_SUPPORT_CLAIM scripts
    pub claim_id: Option<Vec<u8>>,
    /// Claim value (metadata envelope), empty for supports
    pub value: Vec<u8>,
}

pub fn sha256d(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let first = hasher.finalize();
    let mut hasher = Sha256::new();
    hasher.update(&first);
    hasher.finalize().to_vec()
}

/// Claim id for a fresh OP_CLAIM_NAME output: ripemd160(sha256(txid || nout))
pub fn claim_id_from_outpoint(txid: &[u8], nout: u32) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(txid);
    hasher.update(&nout.to_le_bytes());
    let sha = hasher.finalize();
    let mut ripemd = Ripemd160::new();
    ripemd.update(&sha);
    ripemd.finalize().to_vec()
}

/// Read a Bitcoin-style compact size
///
/// Format:
/// - 0x00-0xFC: value itself
/// - 0xFD: next 2 bytes (little-endian u16)
/// - 0xFE: next 4 bytes (little-endian u32)
/// - 0xFF: next 8 bytes (little-endian u64)
pub fn read_compact_size(cursor: &mut Cursor<&[u8]>) -> Result<u64, SyncError> {
    let mut byte = [0u8; 1];
    cursor
        .read_exact(&mut byte)
        .map_err(|e| SyncError::new(format!("compact size read failed: {}", e)))?;
    let value = match byte[0] {
        0xFF => cursor
            .read_u64::<LittleEndian>()
            .map_err(|e| SyncError::new(format!("compact size u64: {}", e)))?,
        0xFE => cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| SyncError::new(format!("compact size u32: {}", e)))? as u64,
        0xFD => cursor
            .read_u16::<LittleEndian>()
            .map_err(|e| SyncError::new(format!("compact size u16: {}", e)))? as u64,
        n => n as u64,
    };
    Ok(value)
}

fn read_bytes(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>, SyncError> {
    let mut buf = vec![0u8; len];
    cursor
        .read_exact(&mut buf)
        .map_err(|e| SyncError::new(format!("short read of {} bytes: {}", len, e)))?;
    Ok(buf)
}

pub fn parse_block_header(cursor: &mut Cursor<&[u8]>) -> Result<BlockHeader, SyncError> {
    let version = cursor
        .read_u32::<LittleEndian>()
        .map_err(|e| SyncError::new(format!("header version: {}", e)))?;
    let prev_hash = read_bytes(cursor, 32)?;
    let merkle_root = read_bytes(cursor, 32)?;
    let claim_trie_root = read_bytes(cursor, 32)?;
    let time = cursor
        .read_u32::<LittleEndian>()
        .map_err(|e| SyncError::new(format!("header time: {}", e)))?;
    let bits = cursor
        .read_u32::<LittleEndian>()
        .map_err(|e| SyncError::new(format!("header bits: {}", e)))?;
    let nonce = cursor
        .read_u32::<LittleEndian>()
        .map_err(|e| SyncError::new(format!("header nonce: {}", e)))?;
    Ok(BlockHeader {
        version,
        prev_hash,
        merkle_root,
        claim_trie_root,
        time,
        bits,
        nonce,
    })
}

/// Parse one transaction; the txid is sha256d over the transaction's byte span
pub fn parse_transaction(data: &[u8], cursor: &mut Cursor<&[u8]>) -> Result<Transaction, SyncError> {
    let start = cursor.position() as usize;

    let version = cursor
        .read_u32::<LittleEndian>()
        .map_err(|e| SyncError::new(format!("tx version: {}", e)))?;

    let input_count = read_compact_size(cursor)?;
    let mut inputs = Vec::with_capacity(input_count as usize);
    for _ in 0..input_count {
        let prev_txid = read_bytes(cursor, 32)?;
        let prev_nout = cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| SyncError::new(format!("input nout: {}", e)))?;
        let script_len = read_compact_size(cursor)? as usize;
        let script = read_bytes(cursor, script_len)?;
        let sequence = cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| SyncError::new(format!("input sequence: {}", e)))?;
        inputs.push(TxInput {
            prev_txid,
            prev_nout,
            script,
            sequence,
        });
    }

    let output_count = read_compact_size(cursor)?;
    let mut outputs = Vec::with_capacity(output_count as usize);
    for _ in 0..output_count {
        let amount = cursor
            .read_u64::<LittleEndian>()
            .map_err(|e| SyncError::new(format!("output amount: {}", e)))?;
        let script_len = read_compact_size(cursor)? as usize;
        let script = read_bytes(cursor, script_len)?;
        outputs.push(TxOutput { amount, script });
    }

    let lock_time = cursor
        .read_u32::<LittleEndian>()
        .map_err(|e| SyncError::new(format!("tx lock_time: {}", e)))?;

    let end = cursor.position() as usize;
    let txid = sha256d(&data[start..end]);

    Ok(Transaction {
        txid,
        version,
        inputs,
        outputs,
        lock_time,
    })
}

/// Parse a full block: 112-byte header, compact tx count, transactions
pub fn parse_block(data: &[u8]) -> Result<Block, SyncError> {
    if data.len() < HEADER_SIZE {
        return Err(SyncError::new(format!(
            "block shorter than header: {} bytes",
            data.len()
        )));
    }
    let hash = sha256d(&data[..HEADER_SIZE]);
    let mut cursor = Cursor::new(data);
    let header = parse_block_header(&mut cursor)?;
    let tx_count = read_compact_size(&mut cursor)?;
    let mut transactions = Vec::with_capacity(tx_count as usize);
    for _ in 0..tx_count {
        transactions.push(parse_transaction(data, &mut cursor)?);
    }
    Ok(Block {
        hash,
        header,
        transactions,
    })
}

/// Read one script push; supports direct pushes and PUSHDATA1/2
fn read_push(script: &[u8], offset: &mut usize) -> Option<Vec<u8>> {
    if *offset >= script.len() {
        return None;
    }
    let op = script[*offset];
    *offset += 1;
    let len = match op {
        1..=75 => op as usize,
        0x4c => {
            if *offset >= script.len() {
                return None;
            }
            let l = script[*offset] as usize;
            *offset += 1;
            l
        }
        0x4d => {
            if *offset + 2 > script.len() {
                return None;
            }
            let l = u16::from_le_bytes([script[*offset], script[*offset + 1]]) as usize;
            *offset += 2;
            l
        }
        _ => return None,
    };
    if *offset + len > script.len() {
        return None;
    }
    let data = script[*offset..*offset + len].to_vec();
    *offset += len;
    Some(data)
}

/// Classify a scriptPubKey: returns the claim-script prefix if present.
/// Non-claim scripts (plain payments) return None.
pub fn parse_claim_script(script: &[u8]) -> Option<ClaimScriptInfo> {
    if script.is_empty() {
        return None;
    }
    let op = script[0];
    if op != OP_CLAIM_NAME && op != OP_SUPPORT_CLAIM && op != OP_UPDATE_CLAIM {
        return None;
    }
    let mut offset = 1;
    let name_bytes = read_push(script, &mut offset)?;
    let name = String::from_utf8_lossy(&name_bytes).into_owned();
    match op {
        OP_CLAIM_NAME => {
            let value = read_push(script, &mut offset)?;
            Some(ClaimScriptInfo {
                op,
                name,
                claim_id: None,
                value,
            })
        }
        OP_UPDATE_CLAIM => {
            let claim_id = read_push(script, &mut offset)?;
            if claim_id.len() != 20 {
                return None;
            }
            let value = read_push(script, &mut offset)?;
            Some(ClaimScriptInfo {
                op,
                name,
                claim_id: Some(claim_id),
                value,
            })
        }
        OP_SUPPORT_CLAIM => {
            let claim_id = read_push(script, &mut offset)?;
            if claim_id.len() != 20 {
                return None;
            }
            Some(ClaimScriptInfo {
                op,
                name,
                claim_id: Some(claim_id),
                value: Vec::new(),
            })
        }
        _ => None,
    }
}

/// TXO type code for a parsed claim script
pub fn txo_type_for(info: &ClaimScriptInfo) -> u8 {
    if info.op == OP_SUPPORT_CLAIM {
        TXO_TYPE_SUPPORT
    } else if info.name.starts_with('@') {
        TXO_TYPE_CHANNEL
    } else {
        TXO_TYPE_STREAM
    }
}

/// TXO type code for an arbitrary scriptPubKey
pub fn classify_script(script: &[u8]) -> u8 {
    match parse_claim_script(script) {
        Some(info) => txo_type_for(&info),
        None => TXO_TYPE_OTHER,
    }
}

/// Extract the signing-channel id from a claim value envelope. The envelope
/// optionally starts with a tag byte followed by the 20-byte channel claim id.
pub fn channel_id_from_value(value: &[u8]) -> Option<Vec<u8>> {
    if value.len() >= 21 && value[0] == CHANNEL_SIG_TAG {
        Some(value[1..21].to_vec())
    } else {
        None
    }
}

/// Serializers used to construct raw blocks in tests and fixtures.
#[cfg(test)]
pub mod build {
    use super::*;

    fn write_compact_size(out: &mut Vec<u8>, n: u64) {
        if n <= 0xFC {
            out.push(n as u8);
        } else if n <= 0xFFFF {
            out.push(0xFD);
            out.extend_from_slice(&(n as u16).to_le_bytes());
        } else if n <= 0xFFFF_FFFF {
            out.push(0xFE);
            out.extend_from_slice(&(n as u32).to_le_bytes());
        } else {
            out.push(0xFF);
            out.extend_from_slice(&n.to_le_bytes());
        }
    }

    fn push_data(out: &mut Vec<u8>, data: &[u8]) {
        if data.len() <= 75 {
            out.push(data.len() as u8);
        } else if data.len() <= 255 {
            out.push(0x4c);
            out.push(data.len() as u8);
        } else {
            out.push(0x4d);
            out.extend_from_slice(&(data.len() as u16).to_le_bytes());
        }
        out.extend_from_slice(data);
    }

    pub fn claim_name_script(name: &str, value: &[u8]) -> Vec<u8> {
        let mut script = vec![OP_CLAIM_NAME];
        push_data(&mut script, name.as_bytes());
        push_data(&mut script, value);
        script.push(0x6d); // OP_2DROP
        script.push(0x75); // OP_DROP
        script
    }

    pub fn update_claim_script(name: &str, claim_id: &[u8], value: &[u8]) -> Vec<u8> {
        let mut script = vec![OP_UPDATE_CLAIM];
        push_data(&mut script, name.as_bytes());
        push_data(&mut script, claim_id);
        push_data(&mut script, value);
        script.push(0x6d);
        script.push(0x6d);
        script
    }

    pub fn support_claim_script(name: &str, claim_id: &[u8]) -> Vec<u8> {
        let mut script = vec![OP_SUPPORT_CLAIM];
        push_data(&mut script, name.as_bytes());
        push_data(&mut script, claim_id);
        script.push(0x6d);
        script.push(0x75);
        script
    }

    /// Claim value carrying a channel signature envelope
    pub fn channel_signed_value(channel_id: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut value = vec![CHANNEL_SIG_TAG];
        value.extend_from_slice(channel_id);
        value.extend_from_slice(payload);
        value
    }

    pub struct TxSpec {
        pub inputs: Vec<(Vec<u8>, u32)>,
        pub outputs: Vec<(u64, Vec<u8>)>,
    }

    impl TxSpec {
        /// Coinbase-style tx; `tag` keeps txids distinct across blocks
        pub fn coinbase(tag: u64) -> Self {
            Self {
                inputs: vec![(vec![0u8; 32], u32::MAX)],
                outputs: vec![(5_000_000_000 + tag, vec![0x51])],
            }
        }

        pub fn spending(inputs: Vec<(Vec<u8>, u32)>) -> Self {
            Self {
                inputs,
                outputs: Vec::new(),
            }
        }

        pub fn output(mut self, amount: u64, script: Vec<u8>) -> Self {
            self.outputs.push((amount, script));
            self
        }
    }

    pub fn serialize_tx(spec: &TxSpec) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&1u32.to_le_bytes());
        write_compact_size(&mut out, spec.inputs.len() as u64);
        for (prev_txid, prev_nout) in &spec.inputs {
            out.extend_from_slice(prev_txid);
            out.extend_from_slice(&prev_nout.to_le_bytes());
            write_compact_size(&mut out, 0); // empty script sig
            out.extend_from_slice(&u32::MAX.to_le_bytes());
        }
        write_compact_size(&mut out, spec.outputs.len() as u64);
        for (amount, script) in &spec.outputs {
            out.extend_from_slice(&amount.to_le_bytes());
            write_compact_size(&mut out, script.len() as u64);
            out.extend_from_slice(script);
        }
        out.extend_from_slice(&0u32.to_le_bytes());
        out
    }

    pub fn txid_of(spec: &TxSpec) -> Vec<u8> {
        sha256d(&serialize_tx(spec))
    }

    pub fn serialize_block(height: i32, txs: &[TxSpec]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&1u32.to_le_bytes());
        // fold the height into prev_hash so every block is distinct
        let mut prev = vec![0u8; 32];
        prev[..4].copy_from_slice(&height.to_le_bytes());
        out.extend_from_slice(&prev);
        out.extend_from_slice(&[0u8; 32]); // merkle root
        out.extend_from_slice(&[0u8; 32]); // claim trie root
        out.extend_from_slice(&(1_600_000_000u32 + height as u32).to_le_bytes());
        out.extend_from_slice(&0x1f00_ffffu32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(out.len(), HEADER_SIZE);
        write_compact_size(&mut out, txs.len() as u64);
        for tx in txs {
            out.extend_from_slice(&serialize_tx(tx));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_round_trip() {
        let claim_script = build::claim_name_script("@chan", b"meta");
        let txs = vec![
            build::TxSpec::coinbase(5),
            build::TxSpec::spending(vec![(vec![9u8; 32], 0)]).output(1000, claim_script.clone()),
        ];
        let raw = build::serialize_block(5, &txs);
        let block = parse_block(&raw).unwrap();
        assert_eq!(block.transactions.len(), 2);
        assert!(block.transactions[0].inputs[0].is_coinbase());
        let tx = &block.transactions[1];
        assert_eq!(tx.outputs.len(), 1);
        assert_eq!(tx.outputs[0].amount, 1000);
        assert_eq!(tx.outputs[0].script, claim_script);
        assert_eq!(tx.txid, build::txid_of(&txs[1]));
    }

    #[test]
    fn test_classify_claim_scripts() {
        let channel = build::claim_name_script("@music", b"m");
        let stream = build::claim_name_script("video", b"v");
        let support = build::support_claim_script("video", &[7u8; 20]);
        assert_eq!(classify_script(&channel), TXO_TYPE_CHANNEL);
        assert_eq!(classify_script(&stream), TXO_TYPE_STREAM);
        assert_eq!(classify_script(&support), TXO_TYPE_SUPPORT);
        assert_eq!(classify_script(&[0x76, 0xa9]), TXO_TYPE_OTHER);

        let info = parse_claim_script(&support).unwrap();
        assert_eq!(info.claim_id.as_deref(), Some(&[7u8; 20][..]));
        assert_eq!(info.name, "video");
    }

    #[test]
    fn test_update_script_carries_claim_id() {
        let id = [3u8; 20];
        let script = build::update_claim_script("video", &id, b"v2");
        let info = parse_claim_script(&script).unwrap();
        assert_eq!(info.op, OP_UPDATE_CLAIM);
        assert_eq!(info.claim_id.as_deref(), Some(&id[..]));
        assert_eq!(info.value, b"v2");
    }

    #[test]
    fn test_channel_id_envelope() {
        let id = vec![5u8; 20];
        let value = build::channel_signed_value(&id, b"payload");
        assert_eq!(channel_id_from_value(&value), Some(id));
        assert_eq!(channel_id_from_value(b"plain"), None);
    }

    #[test]
    fn test_claim_id_is_deterministic() {
        let txid = vec![1u8; 32];
        let a = claim_id_from_outpoint(&txid, 0);
        let b = claim_id_from_outpoint(&txid, 0);
        let c = claim_id_from_outpoint(&txid, 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 20);
    }
}
