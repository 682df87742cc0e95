/// Blockchain Synchronizer - multi-phase advance coordinator
///
/// Drives one "advance cycle" per upstream block edge:
/// 1. block phase - ingest missing blocks, one parallel task per file
/// 2. txio phase - resolve the spend journal onto TXO rows
/// 3. claim phase - insert/update/delete claims, takeovers, stakes
/// 4. support phase - insert/delete supports
/// 5. channel-stats phase - recompute stats for flagged channels
///
/// Filter generation and trend computation run concurrently as detached
/// tasks; they read only previously-committed block data. Phases 2-5 are
/// strictly sequential. The outbound block event fires only after every
/// in-cycle task has completed.
///
/// The advance loop is edge-triggered: the event is cleared once per cycle
/// before work begins, so any number of edges arriving mid-cycle collapse
/// into exactly one follow-up cycle.

use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};

use crate::block_phase;
use crate::chain::Chain;
use crate::claim_phase;
use crate::config::SyncSettings;
use crate::constants::{CHANNEL_TYPE_CODES, CONTENT_TYPE_CODES, SUPPORT_TYPE_CODES};
use crate::db::Database;
use crate::events::EventBroadcaster;
use crate::progress::{Event, Progress};
use crate::queries::{self, TxoFilter};
use crate::support_phase;
use crate::types::{BlockRange, BoxedError};

pub const BLOCK_INIT_EVENT: Event = Event { name: "blockchain.sync.block.init", unit: "steps" };
pub const BLOCK_MAIN_EVENT: Event = Event { name: "blockchain.sync.block.main", unit: "txs" };
pub const FILTER_INIT_EVENT: Event = Event { name: "blockchain.sync.filter.init", unit: "steps" };
pub const FILTER_MAIN_EVENT: Event = Event { name: "blockchain.sync.filter.main", unit: "blocks" };
pub const CLAIM_INIT_EVENT: Event = Event { name: "blockchain.sync.claims.init", unit: "steps" };
pub const CLAIM_MAIN_EVENT: Event = Event { name: "blockchain.sync.claims.main", unit: "claims" };
pub const SUPPORT_INIT_EVENT: Event = Event { name: "blockchain.sync.supports.init", unit: "steps" };
pub const SUPPORT_MAIN_EVENT: Event = Event { name: "blockchain.sync.supports.main", unit: "supports" };
pub const TREND_INIT_EVENT: Event = Event { name: "blockchain.sync.trends.init", unit: "steps" };
pub const TREND_MAIN_EVENT: Event = Event { name: "blockchain.sync.trends.main", unit: "blocks" };

pub struct BlockchainSync {
    chain: Arc<Chain>,
    db: Arc<Database>,
    broadcaster: Arc<EventBroadcaster>,
    settings: SyncSettings,
    /// Edge-triggered advance signal: multiple sets before a read collapse
    /// into a single stored permit
    pub(crate) advance_loop_event: Notify,
    advance_loop_task: Mutex<Option<JoinHandle<()>>>,
    on_block_task: Mutex<Option<JoinHandle<()>>>,
}

impl BlockchainSync {
    pub fn new(
        chain: Arc<Chain>,
        db: Arc<Database>,
        broadcaster: Arc<EventBroadcaster>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            chain,
            db,
            broadcaster,
            settings,
            advance_loop_event: Notify::new(),
            advance_loop_task: Mutex::new(None),
            on_block_task: Mutex::new(None),
        }
    }

    /// Run one synchronous catch-up cycle, then subscribe to the chain's
    /// new-block notifications and launch the advance loop.
    pub async fn start(self: Arc<Self>) -> Result<(), BoxedError> {
        self.clone().advance().await?;
        self.chain.subscribe();

        let this = self.clone();
        let mut on_block = self.chain.on_block();
        *self.on_block_task.lock().unwrap() = Some(tokio::spawn(async move {
            loop {
                match on_block.recv().await {
                    Ok(_) => this.advance_loop_event.notify_one(),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        // only the edge matters; a missed payload is still an edge
                        this.advance_loop_event.notify_one();
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        let this = self.clone();
        *self.advance_loop_task.lock().unwrap() = Some(tokio::spawn(this.advance_loop()));
        Ok(())
    }

    /// Unsubscribe, signal the database stop event (observed by in-flight
    /// tasks at their next cooperative check) and cancel the loop.
    pub async fn stop(&self) {
        self.chain.unsubscribe();
        if let Some(task) = self.on_block_task.lock().unwrap().take() {
            task.abort();
        }
        self.db.stop_event().cancel();
        if let Some(task) = self.advance_loop_task.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Await a set of phase tasks under first-exception semantics: if any
    /// task fails, signal the stop event, cancel the rest and surface the
    /// first error. A phase is only meaningful if every batch commits.
    pub(crate) async fn run_tasks<T: Send + 'static>(
        &self,
        mut tasks: JoinSet<Result<T, BoxedError>>,
    ) -> Result<Vec<T>, BoxedError> {
        let mut results = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(result) => result,
                Err(e) => Err(Box::new(e) as BoxedError),
            };
            match outcome {
                Ok(value) => results.push(value),
                Err(e) => {
                    self.db.stop_event().cancel();
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    return Err(e);
                }
            }
        }
        Ok(results)
    }

    async fn get_best_block_height_for_file(&self, file_number: u32) -> Result<i32, BoxedError> {
        self.db
            .run(move |ctx| block_phase::best_height_for_file(ctx, file_number))
            .await
    }

    async fn count_unspent_txos(
        &self,
        txo_types: &'static [u8],
        blocks: Option<BlockRange>,
        filter: TxoFilter,
    ) -> Result<usize, BoxedError> {
        self.db
            .run(move |ctx| queries::count_unspent_txos(ctx, txo_types, blocks, filter))
            .await
    }

    async fn distribute_unspent_txos(
        &self,
        txo_types: &'static [u8],
        chunk_size: usize,
    ) -> Result<(usize, Vec<BlockRange>), BoxedError> {
        self.db
            .run(move |ctx| {
                queries::distribute_unspent_txos(ctx, txo_types, None, TxoFilter::default(), chunk_size)
            })
            .await
    }

    /// Compare per-file chain tips against the indexed tips and ingest every
    /// file with missing blocks in parallel. Returns the height range newly
    /// added, or None when nothing was missing.
    async fn sync_blocks(&self) -> Result<Option<BlockRange>, BoxedError> {
        let mut tasks: JoinSet<Result<i32, BoxedError>> = JoinSet::new();
        let mut starting_height: Option<i32> = None;
        let mut tx_count = 0u64;
        let mut block_count = 0u64;
        let ending_height;
        {
            let mut p = Progress::new(self.db.message_queue(), BLOCK_INIT_EVENT);
            ending_height = self.chain.db().get_best_height()?;
            let files = self.chain.db().get_block_files(None, None)?;
            p.start(files.len() as u64);
            for mut chain_file in files {
                p.step();
                // block files may be read and saved out of order, so check
                // each file individually for missing blocks
                let our_best_file_height =
                    self.get_best_block_height_for_file(chain_file.file_number).await?;
                if our_best_file_height == chain_file.best_height {
                    continue;
                }
                if our_best_file_height > -1 && our_best_file_height < chain_file.best_height {
                    // we have some of this file; refetch restricted to the
                    // missing suffix for exact tx/block counts
                    chain_file = self
                        .chain
                        .db()
                        .get_block_files(Some(chain_file.file_number), Some(our_best_file_height + 1))?
                        .into_iter()
                        .next()
                        .ok_or("block file disappeared while planning sync")?;
                }
                tx_count += chain_file.txs as u64;
                block_count += chain_file.blocks as u64;
                let start_height = our_best_file_height + 1;
                starting_height =
                    Some(starting_height.map_or(start_height, |s| s.min(start_height)));

                let db = self.db.clone();
                let file_number = chain_file.file_number;
                let expected_txs = chain_file.txs;
                let flush_size = self.settings.tx_flush_size;
                tasks.spawn(async move {
                    db.run(move |ctx| {
                        block_phase::sync_block_file(
                            ctx,
                            file_number,
                            start_height,
                            expected_txs,
                            flush_size,
                        )
                    })
                    .await
                });
            }
        }

        let starting_height = match starting_height {
            Some(height) => height,
            None => return Ok(None),
        };

        let mut p = Progress::new(self.db.message_queue(), BLOCK_MAIN_EVENT);
        p.start_with_extras(json!({
            "blocks": block_count,
            "txs": tx_count,
            "starting_height": starting_height,
            "ending_height": ending_height,
            "files": tasks.len(),
            "claims": self.chain.db().get_claim_metadata_count(starting_height, ending_height)?,
            "supports": self.chain.db().get_support_metadata_count(starting_height, ending_height)?,
        }));
        let completed = self.run_tasks(tasks).await?;
        let best_height_processed = completed
            .into_iter()
            .max()
            .ok_or("block sync produced no results")?;
        Ok(Some(BlockRange::new(starting_height, best_height_processed)))
    }

    /// Materialize the TXO spend relation over the added range. Idempotent.
    async fn sync_txios(&self, blocks_added: Option<BlockRange>) -> Result<(), BoxedError> {
        if let Some(range) = blocks_added {
            let initial_sync = range.is_initial();
            self.db
                .run(move |ctx| block_phase::sync_txoi(ctx, initial_sync))
                .await?;
        }
        Ok(())
    }

    /// Generate compact address filters for blocks missing one. Independent
    /// of the claim/support phases; runs detached from `advance`.
    async fn sync_filters(&self) -> Result<(), BoxedError> {
        if !self.settings.spv_address_filters {
            return Ok(());
        }
        let chunks;
        {
            let mut p = Progress::new(self.db.message_queue(), FILTER_INIT_EVENT);
            p.start(1);
            let chunk_size = self.settings.filter_chunk_size;
            chunks = self
                .db
                .run(move |ctx| queries::missing_filter_ranges(ctx, chunk_size))
                .await?;
            p.step();
        }
        let mut p = Progress::new(self.db.message_queue(), FILTER_MAIN_EVENT);
        p.start(chunks.iter().map(|range| range.len()).sum());
        if chunks.is_empty() {
            return Ok(());
        }
        let mut tasks: JoinSet<Result<usize, BoxedError>> = JoinSet::new();
        for range in chunks {
            let db = self.db.clone();
            let flush_size = self.settings.filter_flush_size;
            tasks.spawn(async move {
                db.run(move |ctx| block_phase::sync_filters_chunk(ctx, range, flush_size))
                    .await
            });
        }
        self.run_tasks(tasks).await?;
        Ok(())
    }

    /// Placeholder trend hook: runs every cycle when enabled, reads only
    /// committed data, recomputes nothing yet.
    async fn sync_trends(&self) -> Result<(), BoxedError> {
        if !self.settings.trending {
            return Ok(());
        }
        let mut p = Progress::new(self.db.message_queue(), TREND_INIT_EVENT);
        p.start(0);
        debug!("trend computation hook invoked");
        Ok(())
    }

    /// Claim phase. Returns `(initial_sync, channels_with_changed_content)`
    /// when the coordinator should trigger channel stats afterwards.
    async fn sync_claims(
        &self,
        blocks: Option<BlockRange>,
    ) -> Result<Option<(bool, usize)>, BoxedError> {
        let initial_sync = !self.db.has_claims().await?;
        let mut total = 0u64;
        let mut delete_claims = 0usize;
        let mut takeovers = 0usize;
        let mut claims_with_changed_supports = 0usize;
        let channels_with_changed_content;
        let channel_batches: Vec<BlockRange>;
        let content_batches: Vec<BlockRange>;
        {
            let mut p = Progress::new(self.db.message_queue(), CLAIM_INIT_EVENT);
            if initial_sync {
                p.start(2);
                // 1. distribute channel insertion load
                let (channels, batches) = self
                    .distribute_unspent_txos(&CHANNEL_TYPE_CODES, self.settings.claim_chunk_size)
                    .await?;
                channel_batches = batches;
                channels_with_changed_content = channels;
                total += channels as u64;
                p.step();
                // 2. distribute content insertion load
                let (content, batches) = self
                    .distribute_unspent_txos(&CONTENT_TYPE_CODES, self.settings.claim_chunk_size)
                    .await?;
                content_batches = batches;
                total += content as u64;
                p.step();
            } else if let Some(blocks) = blocks {
                p.start(6);
                let stale = TxoFilter {
                    missing_or_stale_in_claims: true,
                    ..Default::default()
                };
                // 1. channel claims to be inserted or updated
                let channels = self
                    .count_unspent_txos(&CHANNEL_TYPE_CODES, Some(blocks), stale)
                    .await?;
                channel_batches = if channels > 0 { vec![blocks] } else { Vec::new() };
                total += channels as u64;
                p.step();
                // 2. content claims to be inserted or updated
                let content = self
                    .count_unspent_txos(&CONTENT_TYPE_CODES, Some(blocks), stale)
                    .await?;
                content_batches = if content > 0 { vec![blocks] } else { Vec::new() };
                total += content as u64;
                p.step();
                // 3. claims to be deleted
                delete_claims = self.db.run(|ctx| queries::count_abandoned_claims(ctx)).await?;
                total += delete_claims as u64;
                p.step();
                // 4. claims to be updated with new support totals
                claims_with_changed_supports = self
                    .db
                    .run(move |ctx| queries::count_claims_with_changed_supports(ctx, blocks))
                    .await?;
                total += claims_with_changed_supports as u64;
                p.step();
                // 5. channels to be updated with changed content totals
                channels_with_changed_content = self
                    .db
                    .run(move |ctx| queries::count_channels_with_changed_content(ctx, blocks))
                    .await?;
                total += channels_with_changed_content as u64;
                p.step();
                // 6. claims to be updated due to name takeovers
                takeovers = self.chain.db().get_takeover_count(blocks.start, blocks.end)?;
                total += takeovers as u64;
                p.step();
            } else {
                return Ok(None);
            }
        }

        let mut p = Progress::new(self.db.message_queue(), CLAIM_MAIN_EVENT);
        p.start(total);
        let insertions: [(&'static [u8], &Vec<BlockRange>); 2] = [
            (&CHANNEL_TYPE_CODES, &channel_batches),
            (&CONTENT_TYPE_CODES, &content_batches),
        ];
        for (txo_types, batches) in insertions {
            if batches.is_empty() {
                continue;
            }
            let mut tasks: JoinSet<Result<usize, BoxedError>> = JoinSet::new();
            for &batch in batches {
                let db = self.db.clone();
                let only_missing = !initial_sync;
                tasks.spawn(async move {
                    db.run(move |ctx| claim_phase::claims_insert(ctx, txo_types, batch, only_missing))
                        .await
                });
            }
            self.run_tasks(tasks).await?;
            if !initial_sync {
                let mut tasks: JoinSet<Result<usize, BoxedError>> = JoinSet::new();
                for &batch in batches {
                    let db = self.db.clone();
                    tasks.spawn(async move {
                        db.run(move |ctx| claim_phase::claims_update(ctx, txo_types, batch)).await
                    });
                }
                self.run_tasks(tasks).await?;
            }
        }
        if delete_claims > 0 {
            self.db
                .run(move |ctx| claim_phase::claims_delete(ctx, delete_claims))
                .await?;
        }
        if takeovers > 0 {
            if let Some(blocks) = blocks {
                self.db
                    .run(move |ctx| claim_phase::update_takeovers(ctx, blocks, takeovers))
                    .await?;
            }
        }
        if claims_with_changed_supports > 0 {
            if let Some(blocks) = blocks {
                self.db
                    .run(move |ctx| {
                        claim_phase::update_stakes(ctx, blocks, claims_with_changed_supports)
                    })
                    .await?;
            }
        }
        if channels_with_changed_content > 0 {
            return Ok(Some((initial_sync, channels_with_changed_content)));
        }
        Ok(None)
    }

    /// Support phase: insert new supports, delete abandoned ones.
    async fn sync_supports(&self, blocks: Option<BlockRange>) -> Result<(), BoxedError> {
        let initial_sync = !self.db.has_supports().await?;
        let mut delete_supports = 0usize;
        let total;
        let support_batches: Vec<BlockRange>;
        {
            let mut p = Progress::new(self.db.message_queue(), SUPPORT_INIT_EVENT);
            if initial_sync {
                let (count, batches) = self
                    .distribute_unspent_txos(&SUPPORT_TYPE_CODES, self.settings.support_chunk_size)
                    .await?;
                support_batches = batches;
                total = count as u64;
            } else if let Some(blocks) = blocks {
                p.start(2);
                // 1. supports to be inserted
                let missing = TxoFilter {
                    missing_in_supports: true,
                    ..Default::default()
                };
                let count = self
                    .count_unspent_txos(&SUPPORT_TYPE_CODES, Some(blocks), missing)
                    .await?;
                support_batches = if count > 0 { vec![blocks] } else { Vec::new() };
                p.step();
                // 2. supports to be deleted
                delete_supports = self
                    .db
                    .run(|ctx| queries::count_abandoned_supports(ctx))
                    .await?;
                total = (count + delete_supports) as u64;
                p.step();
            } else {
                return Ok(());
            }
        }

        let mut p = Progress::new(self.db.message_queue(), SUPPORT_MAIN_EVENT);
        p.start(total);
        if !support_batches.is_empty() {
            let mut tasks: JoinSet<Result<usize, BoxedError>> = JoinSet::new();
            for &batch in &support_batches {
                let db = self.db.clone();
                let only_missing = !initial_sync;
                tasks.spawn(async move {
                    db.run(move |ctx| support_phase::supports_insert(ctx, batch, only_missing))
                        .await
                });
            }
            self.run_tasks(tasks).await?;
        }
        if delete_supports > 0 {
            self.db
                .run(move |ctx| support_phase::supports_delete(ctx, delete_supports))
                .await?;
        }
        Ok(())
    }

    /// Channel-stats phase, run only when the claim phase flagged channels.
    async fn sync_channel_stats(
        &self,
        blocks: Option<BlockRange>,
        initial_sync: bool,
        channels_with_changed_content: usize,
    ) -> Result<(), BoxedError> {
        if channels_with_changed_content > 0 {
            self.db
                .run(move |ctx| {
                    claim_phase::update_channel_stats(
                        ctx,
                        blocks,
                        initial_sync,
                        channels_with_changed_content,
                    )
                })
                .await?;
        }
        Ok(())
    }

    /// One full advance cycle. See the module docs for the phase contract.
    pub async fn advance(self: Arc<Self>) -> Result<(), BoxedError> {
        let blocks_added = self.sync_blocks().await?;

        let this = self.clone();
        let sync_filters_task = tokio::spawn(async move { this.sync_filters().await });
        let this = self.clone();
        let sync_trends_task = tokio::spawn(async move { this.sync_trends().await });

        self.sync_txios(blocks_added).await?;
        let channel_stats = self.sync_claims(blocks_added).await?;
        self.sync_supports(blocks_added).await?;
        if let Some((initial_sync, channels)) = channel_stats {
            self.sync_channel_stats(blocks_added, initial_sync, channels).await?;
        }
        sync_trends_task.await??;
        sync_filters_task.await??;

        if let Some(range) = blocks_added {
            info!(height = range.end, "indexed tip advanced");
            self.broadcaster.broadcast_block(range.end);
        }
        Ok(())
    }

    /// Block on the advance event, clear it, run one cycle. Any failure is
    /// logged and shuts the synchronizer down; the operator restarts after
    /// inspecting logs - sync failures indicate corrupt source data or
    /// schema drift, which a tight retry loop cannot fix.
    async fn advance_loop(self: Arc<Self>) {
        loop {
            self.advance_loop_event.notified().await;
            if let Err(e) = self.clone().advance().await {
                error!(error = %e, "sync cycle failed, shutting down");
                self.stop().await;
                return;
            }
        }
    }
}
