//! End-to-end advance-cycle tests
//!
//! Each test builds a fixture node datadir (block files plus the leveldb
//! index) and a fresh index database, then drives full `advance()` cycles
//! and asserts on column family state, progress messages and the outbound
//! block event.

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;

use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinSet;

use crate::chain::{Chain, ChainBlockRecord, ChainClaimActivity, ChainTakeover};
use crate::config::SyncSettings;
use crate::constants::{
    CF_BLOCK, CF_CHANNEL_STATS, CF_CLAIM, CF_FILTER, CF_SUPPORT, CF_TAKEOVER, CF_TXO,
};
use crate::db::Database;
use crate::events::{EventBroadcaster, SyncEvent};
use crate::parser::build::{self, TxSpec};
use crate::parser::{claim_id_from_outpoint, sha256d, HEADER_SIZE};
use crate::progress::ProgressMessage;
use crate::sync::BlockchainSync;
use crate::types::{decode_file_progress, txo_key, BoxedError, ChannelStatsRow, ClaimRow, TakeoverRow};

struct Harness {
    chain: Arc<Chain>,
    db: Arc<Database>,
    broadcaster: Arc<EventBroadcaster>,
    sync: Arc<BlockchainSync>,
    progress_rx: UnboundedReceiver<ProgressMessage>,
    next_height: i32,
    _dirs: (TempDir, TempDir),
}

impl Harness {
    fn new() -> Self {
        Self::with_settings(SyncSettings::default())
    }

    fn with_settings(settings: SyncSettings) -> Self {
        let chain_dir = TempDir::new().unwrap();
        let db_dir = TempDir::new().unwrap();
        let chain = Arc::new(Chain::open(chain_dir.path(), settings.poll_interval_secs).unwrap());
        let db = Arc::new(Database::open(db_dir.path(), chain.db_arc()).unwrap());
        let broadcaster = Arc::new(EventBroadcaster::new());
        let progress_rx = db.take_message_receiver().unwrap();
        let sync = Arc::new(BlockchainSync::new(
            chain.clone(),
            db.clone(),
            broadcaster.clone(),
            settings,
        ));
        Self {
            chain,
            db,
            broadcaster,
            sync,
            progress_rx,
            next_height: 0,
            _dirs: (chain_dir, db_dir),
        }
    }

    /// Append a block to a node block file and register it in the index
    fn add_block(&mut self, file_number: u32, txs: Vec<TxSpec>) -> i32 {
        let height = self.next_height;
        self.next_height += 1;

        let raw = build::serialize_block(height, &txs);
        let path = self.chain.db().block_file_path(file_number);
        let mut file = OpenOptions::new().create(true).append(true).open(&path).unwrap();
        let data_pos = file.metadata().unwrap().len();
        file.write_all(&crate::constants::BLOCK_MAGIC).unwrap();
        file.write_all(&(raw.len() as u32).to_le_bytes()).unwrap();
        file.write_all(&raw).unwrap();

        self.chain
            .db()
            .put_block_record(
                height,
                &ChainBlockRecord {
                    hash: sha256d(&raw[..HEADER_SIZE]),
                    file_number,
                    data_pos,
                    tx_count: txs.len() as u32,
                },
            )
            .unwrap();
        self.chain.db().set_best_height(height).unwrap();
        height
    }

    fn add_takeover(&self, height: i32, name: &str, claim_id: &[u8]) {
        self.chain
            .db()
            .put_claim_activity(
                height,
                &ChainClaimActivity {
                    claims: 0,
                    supports: 0,
                    takeovers: vec![ChainTakeover {
                        name: name.to_string(),
                        claim_id: claim_id.to_vec(),
                    }],
                },
            )
            .unwrap();
    }

    async fn advance(&self) -> Result<(), BoxedError> {
        self.sync.clone().advance().await
    }

    fn count_cf(&self, cf_name: &str) -> usize {
        let ctx = self.db.task_context();
        let cf = ctx.cf(cf_name).unwrap();
        ctx.db
            .iterator_cf(cf, rocksdb::IteratorMode::Start)
            .map(|r| r.unwrap())
            .count()
    }

    fn file_progress(&self, file_number: u32) -> i32 {
        let ctx = self.db.task_context();
        let cf = ctx.cf(crate::constants::CF_FILE_PROGRESS).unwrap();
        decode_file_progress(ctx.db.get_cf(cf, file_number.to_be_bytes()).unwrap())
    }

    fn get_claim(&self, claim_id: &[u8]) -> Option<ClaimRow> {
        self.db.task_context().get_row(CF_CLAIM, claim_id).unwrap()
    }

    fn drain_progress(&mut self) -> Vec<ProgressMessage> {
        let mut messages = Vec::new();
        while let Ok(msg) = self.progress_rx.try_recv() {
            messages.push(msg);
        }
        messages
    }
}

/// A fresh claim transaction with a null (coinbase-style) input, so it never
/// references a TXO the index does not hold. `tag` keeps txids distinct.
/// Returns the spec and the derived claim id.
fn claim_tx(name: &str, amount: u64, channel_id: Option<&[u8]>, tag: u8) -> (TxSpec, Vec<u8>) {
    let value = match channel_id {
        Some(id) => build::channel_signed_value(id, &[b'm', tag]),
        None => vec![b'm', tag],
    };
    let script = build::claim_name_script(name, &value);
    let spec = TxSpec::spending(vec![(vec![0u8; 32], u32::MAX)]).output(amount, script);
    let claim_id = claim_id_from_outpoint(&build::txid_of(&spec), 0);
    (spec, claim_id)
}

fn support_tx(name: &str, claim_id: &[u8], amount: u64, tag: u8) -> TxSpec {
    let mut script = build::support_claim_script(name, claim_id);
    script.push(tag);
    TxSpec::spending(vec![(vec![0u8; 32], u32::MAX)]).output(amount, script)
}

#[tokio::test]
async fn test_cold_start_empty_chain() {
    let mut harness = Harness::new();
    let mut events = harness.broadcaster.subscribe();

    harness.advance().await.unwrap();

    assert!(events.try_recv().is_err());
    assert_eq!(harness.count_cf(CF_BLOCK), 0);
    assert_eq!(harness.count_cf(CF_CLAIM), 0);
    assert_eq!(harness.count_cf(CF_SUPPORT), 0);
    // the block planning phase still announced itself
    let progress = harness.drain_progress();
    assert!(progress.iter().any(|m| m.event == "blockchain.sync.block.init"));
}

#[tokio::test]
async fn test_cold_start_full_pipeline() {
    let mut harness = Harness::new();
    let mut events = harness.broadcaster.subscribe();

    let (alpha_tx, alpha_id) = claim_tx("@alpha", 1_000, None, 101);
    let (beta_tx, beta_id) = claim_tx("@beta", 2_000, None, 102);
    let (one_tx, one_id) = claim_tx("one", 100, Some(&alpha_id), 103);
    let (two_tx, _two_id) = claim_tx("two", 200, Some(&alpha_id), 104);
    let (three_tx, _three_id) = claim_tx("three", 300, None, 105);
    let support = support_tx("one", &one_id, 300, 106);

    harness.add_block(0, vec![TxSpec::coinbase(0)]);
    harness.add_block(0, vec![TxSpec::coinbase(1), alpha_tx]);
    harness.add_block(0, vec![TxSpec::coinbase(2), beta_tx]);
    harness.add_block(0, vec![TxSpec::coinbase(3), one_tx]);
    harness.add_block(0, vec![TxSpec::coinbase(4), two_tx]);
    harness.add_block(0, vec![TxSpec::coinbase(5), three_tx]);
    harness.add_block(0, vec![TxSpec::coinbase(6), support]);
    for i in 7..10u64 {
        harness.add_block(0, vec![TxSpec::coinbase(i)]);
    }

    harness.advance().await.unwrap();

    assert_eq!(harness.count_cf(CF_BLOCK), 10);
    assert_eq!(harness.file_progress(0), 9);
    assert_eq!(harness.count_cf(CF_CLAIM), 5);
    assert_eq!(harness.count_cf(CF_SUPPORT), 1);

    // initial sync: channel stats took the bulk path over both channels
    assert_eq!(harness.count_cf(CF_CHANNEL_STATS), 2);
    let ctx = harness.db.task_context();
    let alpha_stats: ChannelStatsRow = ctx.get_row(CF_CHANNEL_STATS, &alpha_id).unwrap().unwrap();
    assert_eq!(alpha_stats.content_count, 2);
    assert_eq!(alpha_stats.aggregate_amount, 300);
    let beta_stats: ChannelStatsRow = ctx.get_row(CF_CHANNEL_STATS, &beta_id).unwrap().unwrap();
    assert_eq!(beta_stats.content_count, 0);

    // stake totals lag one cycle for supports landing with their claim
    assert_eq!(harness.get_claim(&one_id).unwrap().support_total, 0);

    match events.try_recv().unwrap() {
        SyncEvent::BlockAdded { height } => assert_eq!(height, 9),
    }
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_second_advance_is_noop() {
    let mut harness = Harness::new();
    let (alpha_tx, _) = claim_tx("@alpha", 1_000, None, 101);
    harness.add_block(0, vec![TxSpec::coinbase(0)]);
    harness.add_block(0, vec![TxSpec::coinbase(1), alpha_tx]);

    harness.advance().await.unwrap();
    let claims = harness.count_cf(CF_CLAIM);
    let txos = harness.count_cf(CF_TXO);
    let mut events = harness.broadcaster.subscribe();

    harness.advance().await.unwrap();

    assert!(events.try_recv().is_err());
    assert_eq!(harness.count_cf(CF_CLAIM), claims);
    assert_eq!(harness.count_cf(CF_TXO), txos);
    assert_eq!(harness.file_progress(0), 1);
}

#[tokio::test]
async fn test_incremental_advance() {
    let mut harness = Harness::new();

    let (alpha_tx, alpha_id) = claim_tx("@alpha", 1_000, None, 101);
    let (one_tx, one_id) = claim_tx("one", 100, Some(&alpha_id), 103);
    let first_support = support_tx("one", &one_id, 300, 106);
    harness.add_block(0, vec![TxSpec::coinbase(0)]);
    harness.add_block(0, vec![TxSpec::coinbase(1), alpha_tx]);
    harness.add_block(0, vec![TxSpec::coinbase(2), one_tx]);
    harness.add_block(0, vec![TxSpec::coinbase(3), first_support]);
    harness.advance().await.unwrap();
    assert_eq!(harness.get_claim(&one_id).unwrap().support_total, 0);

    let mut events = harness.broadcaster.subscribe();

    // +5 blocks: one new content claim, one new support for "one", a takeover
    let (four_tx, four_id) = claim_tx("four", 400, Some(&alpha_id), 110);
    let second_support = support_tx("one", &one_id, 200, 111);
    let takeover_height = harness.add_block(0, vec![TxSpec::coinbase(10), four_tx]);
    harness.add_takeover(takeover_height, "one", &one_id);
    harness.add_block(0, vec![TxSpec::coinbase(11), second_support]);
    for i in 12..15u64 {
        harness.add_block(0, vec![TxSpec::coinbase(i)]);
    }

    harness.advance().await.unwrap();

    assert_eq!(harness.count_cf(CF_CLAIM), 3);
    assert_eq!(harness.count_cf(CF_SUPPORT), 2);
    assert!(harness.get_claim(&four_id).is_some());

    // the first support is now folded into the stake; the one that landed
    // this cycle lags until the next advance
    assert_eq!(harness.get_claim(&one_id).unwrap().support_total, 300);

    // takeover journal applied
    let ctx = harness.db.task_context();
    let takeover: TakeoverRow = ctx.get_row(CF_TAKEOVER, b"one").unwrap().unwrap();
    assert_eq!(takeover.claim_id, one_id);
    assert_eq!(takeover.height, takeover_height);
    assert_eq!(harness.get_claim(&one_id).unwrap().takeover_height, Some(takeover_height));

    // channel stats recomputed for the flagged channel
    let stats: ChannelStatsRow = ctx.get_row(CF_CHANNEL_STATS, &alpha_id).unwrap().unwrap();
    assert_eq!(stats.content_count, 2);

    match events.try_recv().unwrap() {
        SyncEvent::BlockAdded { height } => assert_eq!(height, 8),
    }
}

#[tokio::test]
async fn test_abandoned_claim_and_support_are_deleted() {
    let mut harness = Harness::new();

    let (one_tx, one_id) = claim_tx("one", 100, None, 50);
    let one_txid = build::txid_of(&one_tx);
    let support = support_tx("one", &one_id, 300, 51);
    let support_txid = build::txid_of(&support);
    harness.add_block(0, vec![TxSpec::coinbase(0)]);
    harness.add_block(0, vec![TxSpec::coinbase(1), one_tx]);
    harness.add_block(0, vec![TxSpec::coinbase(2), support]);
    harness.advance().await.unwrap();
    assert_eq!(harness.count_cf(CF_CLAIM), 1);
    assert_eq!(harness.count_cf(CF_SUPPORT), 1);

    // spend both the claim txo and the support txo
    let spend = TxSpec::spending(vec![(one_txid, 0), (support_txid, 0)]);
    harness.add_block(0, vec![TxSpec::coinbase(3), spend]);
    harness.advance().await.unwrap();

    assert_eq!(harness.count_cf(CF_CLAIM), 0);
    assert_eq!(harness.count_cf(CF_SUPPORT), 0);
}

#[tokio::test]
async fn test_mid_file_resume() {
    let mut harness = Harness::new();
    for i in 0..6u64 {
        harness.add_block(0, vec![TxSpec::coinbase(i)]);
    }
    harness.advance().await.unwrap();
    assert_eq!(harness.file_progress(0), 5);
    harness.drain_progress();

    for i in 6..10u64 {
        harness.add_block(0, vec![TxSpec::coinbase(i)]);
    }
    harness.advance().await.unwrap();

    assert_eq!(harness.count_cf(CF_BLOCK), 10);
    assert_eq!(harness.file_progress(0), 9);

    // the planner refetched the file restricted to the missing suffix
    let progress = harness.drain_progress();
    let main = progress
        .iter()
        .find(|m| m.event == "blockchain.sync.block.main" && m.data.get("starting_height").is_some())
        .expect("block main progress with extras");
    assert_eq!(main.data["starting_height"], 6);
    assert_eq!(main.data["ending_height"], 9);
    assert_eq!(main.data["blocks"], 4);
}

#[tokio::test]
async fn test_blocks_across_multiple_files() {
    let mut harness = Harness::new();
    for i in 0..3u64 {
        harness.add_block(0, vec![TxSpec::coinbase(i)]);
    }
    for i in 3..5u64 {
        harness.add_block(1, vec![TxSpec::coinbase(i)]);
    }
    harness.advance().await.unwrap();

    assert_eq!(harness.count_cf(CF_BLOCK), 5);
    assert_eq!(harness.file_progress(0), 2);
    assert_eq!(harness.file_progress(1), 4);
}

#[tokio::test]
async fn test_filter_generation() {
    let mut settings = SyncSettings::default();
    settings.spv_address_filters = true;
    let mut harness = Harness::with_settings(settings);
    for i in 0..4u64 {
        harness.add_block(0, vec![TxSpec::coinbase(i)]);
    }
    harness.advance().await.unwrap();

    assert_eq!(harness.count_cf(CF_FILTER), 4);
    let ctx = harness.db.task_context();
    let cf = ctx.cf(CF_FILTER).unwrap();
    let filter = ctx.db.get_cf(cf, 0i32.to_be_bytes()).unwrap().unwrap();
    assert!(!filter.is_empty());
    assert_eq!(filter.len() % 4, 0);

    // second cycle finds nothing left to generate
    harness.advance().await.unwrap();
    assert_eq!(harness.count_cf(CF_FILTER), 4);
}

#[tokio::test]
async fn test_run_tasks_first_exception_cancels_siblings() {
    let harness = Harness::new();
    let mut tasks: JoinSet<Result<i32, BoxedError>> = JoinSet::new();
    tasks.spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        Err("boom".into())
    });
    for _ in 0..2 {
        tasks.spawn(async move {
            futures::future::pending::<()>().await;
            Ok(0)
        });
    }

    let err = harness.sync.run_tasks(tasks).await.unwrap_err();
    assert_eq!(err.to_string(), "boom");
    assert!(harness.db.stop_event().is_cancelled());
}

#[tokio::test]
async fn test_edge_coalescing() {
    let mut harness = Harness::new();
    for i in 0..3u64 {
        harness.add_block(0, vec![TxSpec::coinbase(i)]);
    }

    harness.sync.clone().start().await.unwrap();
    harness.drain_progress();

    // several edges while no cycle is waiting: they collapse into one permit
    for _ in 0..5 {
        harness.sync.advance_loop_event.notify_one();
    }
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    let progress = harness.drain_progress();
    let cycles = progress
        .iter()
        .filter(|m| m.event == "blockchain.sync.block.init" && m.data.get("steps").is_some())
        .count();
    assert_eq!(cycles, 1);

    harness.sync.stop().await;
}

#[tokio::test]
async fn test_spend_resolution_is_complete() {
    let mut harness = Harness::new();
    let (one_tx, _) = claim_tx("one", 100, None, 60);
    let one_txid = build::txid_of(&one_tx);
    harness.add_block(0, vec![TxSpec::coinbase(0)]);
    harness.add_block(0, vec![TxSpec::coinbase(1), one_tx]);
    let spend = TxSpec::spending(vec![(one_txid.clone(), 0)]);
    let spend_height = harness.add_block(0, vec![TxSpec::coinbase(2), spend]);
    harness.advance().await.unwrap();

    // journal fully applied and the txo carries the spending height
    assert_eq!(harness.count_cf(crate::constants::CF_TXI), 0);
    let ctx = harness.db.task_context();
    let row: crate::types::TxoRow = ctx.get_row(CF_TXO, &txo_key(&one_txid, 0)).unwrap().unwrap();
    assert_eq!(row.spent_height, Some(spend_height));
}
