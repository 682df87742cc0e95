/// Chain Collaborator - the trusted node's on-disk block store
///
/// Responsibilities:
/// - Read the node's leveldb block index (per-height file number, data
///   position and tx count) and its claim-activity journal
/// - Map file numbers to block file paths for the ingest workers
/// - Poll the node's best height and broadcast an edge on every new block
///
/// rusty-leveldb is a single-threaded store, so the handle lives on a
/// dedicated thread and callers submit closures over a job channel.
///
/// The node never rolls back below our indexed tip; a lower best height is
/// logged and ignored.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusty_leveldb::{LdbIterator, Options, DB};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::constants::HEIGHT_NONE;
use crate::types::{BlockFileInfo, BoxedError, SyncError};

const BLOCK_KEY_PREFIX: u8 = b'b';
const ACTIVITY_KEY_PREFIX: u8 = b'c';
const BEST_HEIGHT_KEY: &[u8] = b"best";

/// Per-block entry in the node's block index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainBlockRecord {
    /// Block hash (internal byte order)
    pub hash: Vec<u8>,
    /// Block file holding this block
    pub file_number: u32,
    /// Byte offset of the magic prefix inside the block file
    pub data_pos: u64,
    pub tx_count: u32,
}

/// One takeover recorded by the node's claim trie
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainTakeover {
    pub name: String,
    pub claim_id: Vec<u8>,
}

/// Per-height claim metadata journal entry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainClaimActivity {
    pub claims: u32,
    pub supports: u32,
    pub takeovers: Vec<ChainTakeover>,
}

fn height_key(prefix: u8, height: i32) -> Vec<u8> {
    let mut key = Vec::with_capacity(5);
    key.push(prefix);
    key.extend_from_slice(&(height as u32).to_be_bytes());
    key
}

type ChainJob = Box<dyn FnOnce(&mut DB) + Send>;

/// Reader over the node's leveldb index. Also carries the write methods the
/// import tooling and test fixtures use to build an index.
pub struct ChainDb {
    dir: PathBuf,
    jobs: Mutex<mpsc::Sender<ChainJob>>,
}

impl ChainDb {
    pub fn open(chain_dir: &Path) -> Result<Self, BoxedError> {
        std::fs::create_dir_all(chain_dir.join("blocks"))?;
        let index_path = chain_dir.join("index");

        let (jobs_tx, jobs_rx) = mpsc::channel::<ChainJob>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), String>>();
        std::thread::Builder::new()
            .name("chain-index".to_string())
            .spawn(move || {
                let mut opts = Options::default();
                opts.create_if_missing = true;
                let mut db = match DB::open(&index_path, opts) {
                    Ok(db) => {
                        let _ = ready_tx.send(Ok(()));
                        db
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("{}", e)));
                        return;
                    }
                };
                while let Ok(job) = jobs_rx.recv() {
                    job(&mut db);
                }
            })?;
        ready_rx
            .recv()
            .map_err(|_| SyncError::new("chain index thread died during open"))?
            .map_err(SyncError::new)?;

        Ok(Self {
            dir: chain_dir.to_path_buf(),
            jobs: Mutex::new(jobs_tx),
        })
    }

    /// Run a closure against the leveldb handle on its thread
    fn exec<T, F>(&self, f: F) -> Result<T, BoxedError>
    where
        T: Send + 'static,
        F: FnOnce(&mut DB) -> Result<T, BoxedError> + Send + 'static,
    {
        let (result_tx, result_rx) = mpsc::channel();
        let job: ChainJob = Box::new(move |db| {
            let _ = result_tx.send(f(db));
        });
        self.jobs
            .lock()
            .unwrap()
            .send(job)
            .map_err(|_| SyncError::new("chain index thread gone"))?;
        result_rx
            .recv()
            .map_err(|_| SyncError::new("chain index thread gone"))?
    }

    /// Path of a node block file
    pub fn block_file_path(&self, file_number: u32) -> PathBuf {
        self.dir.join("blocks").join(format!("blk{:05}.dat", file_number))
    }

    /// Current best height, or -1 for an empty chain
    pub fn get_best_height(&self) -> Result<i32, BoxedError> {
        self.exec(|db| match db.get(BEST_HEIGHT_KEY) {
            Some(bytes) if bytes.len() == 4 => {
                Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
            _ => Ok(HEIGHT_NONE),
        })
    }

    /// Summarize block files, optionally restricted to one file and to
    /// heights at or above `start_height`. Matches what the ingest planner
    /// needs: per file, the tip height plus tx/block counts of the
    /// not-yet-indexed suffix.
    pub fn get_block_files(
        &self,
        file_number: Option<u32>,
        start_height: Option<i32>,
    ) -> Result<Vec<BlockFileInfo>, BoxedError> {
        let records = self.exec(move |db| read_block_records(db, file_number, start_height))?;
        let mut files: BTreeMap<u32, BlockFileInfo> = BTreeMap::new();
        for (height, record) in records {
            let entry = files.entry(record.file_number).or_insert(BlockFileInfo {
                file_number: record.file_number,
                best_height: HEIGHT_NONE,
                txs: 0,
                blocks: 0,
            });
            entry.best_height = entry.best_height.max(height);
            entry.txs += record.tx_count;
            entry.blocks += 1;
        }
        Ok(files.into_values().collect())
    }

    /// Block index entries of one file from `start_height` up, in height order
    pub fn get_block_records_for_file(
        &self,
        file_number: u32,
        start_height: i32,
    ) -> Result<Vec<(i32, ChainBlockRecord)>, BoxedError> {
        self.exec(move |db| read_block_records(db, Some(file_number), Some(start_height)))
    }

    pub fn get_claim_metadata_count(
        &self,
        start_height: i32,
        end_height: i32,
    ) -> Result<usize, BoxedError> {
        Ok(self
            .exec(move |db| read_activity(db, start_height, end_height))?
            .iter()
            .map(|(_, a)| a.claims as usize)
            .sum())
    }

    pub fn get_support_metadata_count(
        &self,
        start_height: i32,
        end_height: i32,
    ) -> Result<usize, BoxedError> {
        Ok(self
            .exec(move |db| read_activity(db, start_height, end_height))?
            .iter()
            .map(|(_, a)| a.supports as usize)
            .sum())
    }

    pub fn get_takeover_count(&self, start_height: i32, end_height: i32) -> Result<usize, BoxedError> {
        Ok(self
            .exec(move |db| read_activity(db, start_height, end_height))?
            .iter()
            .map(|(_, a)| a.takeovers.len())
            .sum())
    }

    /// Takeover journal entries for a height range, in height order
    pub fn get_takeovers(
        &self,
        start_height: i32,
        end_height: i32,
    ) -> Result<Vec<(i32, ChainTakeover)>, BoxedError> {
        let mut takeovers = Vec::new();
        for (height, activity) in self.exec(move |db| read_activity(db, start_height, end_height))? {
            for takeover in activity.takeovers {
                takeovers.push((height, takeover));
            }
        }
        Ok(takeovers)
    }

    /// Record a block in the index (import tooling and fixtures)
    pub fn put_block_record(&self, height: i32, record: &ChainBlockRecord) -> Result<(), BoxedError> {
        let key = height_key(BLOCK_KEY_PREFIX, height);
        let value = bincode::serialize(record)?;
        self.exec(move |db| {
            db.put(&key, &value)?;
            db.flush()?;
            Ok(())
        })
    }

    /// Record claim activity for a height (import tooling and fixtures)
    pub fn put_claim_activity(
        &self,
        height: i32,
        activity: &ChainClaimActivity,
    ) -> Result<(), BoxedError> {
        let key = height_key(ACTIVITY_KEY_PREFIX, height);
        let value = bincode::serialize(activity)?;
        self.exec(move |db| {
            db.put(&key, &value)?;
            db.flush()?;
            Ok(())
        })
    }

    pub fn set_best_height(&self, height: i32) -> Result<(), BoxedError> {
        self.exec(move |db| {
            db.put(BEST_HEIGHT_KEY, &height.to_le_bytes())?;
            db.flush()?;
            Ok(())
        })
    }
}

fn read_block_records(
    db: &mut DB,
    file_number: Option<u32>,
    start_height: Option<i32>,
) -> Result<Vec<(i32, ChainBlockRecord)>, BoxedError> {
    let mut iter = db.new_iter()?;
    let mut records = Vec::new();
    while let Some((key, value)) = LdbIterator::next(&mut iter) {
        if key.len() != 5 || key[0] != BLOCK_KEY_PREFIX {
            continue;
        }
        let height = u32::from_be_bytes([key[1], key[2], key[3], key[4]]) as i32;
        if let Some(start) = start_height {
            if height < start {
                continue;
            }
        }
        let record: ChainBlockRecord = bincode::deserialize(&value)?;
        if let Some(number) = file_number {
            if record.file_number != number {
                continue;
            }
        }
        records.push((height, record));
    }
    records.sort_by_key(|(height, _)| *height);
    Ok(records)
}

fn read_activity(
    db: &mut DB,
    start_height: i32,
    end_height: i32,
) -> Result<Vec<(i32, ChainClaimActivity)>, BoxedError> {
    let mut iter = db.new_iter()?;
    let mut entries = Vec::new();
    while let Some((key, value)) = LdbIterator::next(&mut iter) {
        if key.len() != 5 || key[0] != ACTIVITY_KEY_PREFIX {
            continue;
        }
        let height = u32::from_be_bytes([key[1], key[2], key[3], key[4]]) as i32;
        if height < start_height || height > end_height {
            continue;
        }
        let activity: ChainClaimActivity = bincode::deserialize(&value)?;
        entries.push((height, activity));
    }
    entries.sort_by_key(|(height, _)| *height);
    Ok(entries)
}

/// The chain as seen by the synchronizer: index queries plus an
/// edge-triggered new-block stream fed by a tip poller.
pub struct Chain {
    db: Arc<ChainDb>,
    on_block_tx: broadcast::Sender<i32>,
    poll_interval: Duration,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl Chain {
    pub fn open(chain_dir: &Path, poll_interval_secs: u64) -> Result<Self, BoxedError> {
        let db = Arc::new(ChainDb::open(chain_dir)?);
        let (on_block_tx, _) = broadcast::channel(64);
        Ok(Self {
            db,
            on_block_tx,
            poll_interval: Duration::from_secs(poll_interval_secs),
            poll_task: Mutex::new(None),
        })
    }

    pub fn db(&self) -> &ChainDb {
        &self.db
    }

    pub fn db_arc(&self) -> Arc<ChainDb> {
        self.db.clone()
    }

    /// New-block edge stream. Only the edge matters; the payload is the
    /// height the poller observed.
    pub fn on_block(&self) -> broadcast::Receiver<i32> {
        self.on_block_tx.subscribe()
    }

    /// Start the tip poller. Idempotent: a second call is a no-op while a
    /// poller is running.
    pub fn subscribe(&self) {
        let mut guard = self.poll_task.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let db = self.db.clone();
        let tx = self.on_block_tx.clone();
        let interval = self.poll_interval;
        *guard = Some(tokio::spawn(async move {
            let mut last = db.get_best_height().unwrap_or(HEIGHT_NONE);
            loop {
                tokio::time::sleep(interval).await;
                match db.get_best_height() {
                    Ok(height) if height > last => {
                        debug!(height, last, "chain tip advanced");
                        last = height;
                        let _ = tx.send(height);
                    }
                    Ok(height) if height < last => {
                        warn!(height, last, "chain tip moved backwards, ignoring");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "failed to poll chain tip");
                    }
                }
            }
        }));
    }

    /// Stop the tip poller
    pub fn unsubscribe(&self) {
        if let Some(task) = self.poll_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(file_number: u32, data_pos: u64, tx_count: u32) -> ChainBlockRecord {
        ChainBlockRecord {
            hash: vec![0xaa; 32],
            file_number,
            data_pos,
            tx_count,
        }
    }

    #[test]
    fn test_empty_chain() {
        let tmp = TempDir::new().unwrap();
        let db = ChainDb::open(tmp.path()).unwrap();
        assert_eq!(db.get_best_height().unwrap(), HEIGHT_NONE);
        assert!(db.get_block_files(None, None).unwrap().is_empty());
    }

    #[test]
    fn test_block_file_grouping() {
        let tmp = TempDir::new().unwrap();
        let db = ChainDb::open(tmp.path()).unwrap();
        for height in 0..4 {
            db.put_block_record(height, &record(0, height as u64 * 100, 2)).unwrap();
        }
        for height in 4..6 {
            db.put_block_record(height, &record(1, (height - 4) as u64 * 100, 3)).unwrap();
        }
        db.set_best_height(5).unwrap();

        let files = db.get_block_files(None, None).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].file_number, 0);
        assert_eq!(files[0].best_height, 3);
        assert_eq!(files[0].blocks, 4);
        assert_eq!(files[0].txs, 8);
        assert_eq!(files[1].file_number, 1);
        assert_eq!(files[1].best_height, 5);
        assert_eq!(files[1].txs, 6);
        assert_eq!(db.get_best_height().unwrap(), 5);
    }

    #[test]
    fn test_block_files_restricted_to_suffix() {
        let tmp = TempDir::new().unwrap();
        let db = ChainDb::open(tmp.path()).unwrap();
        for height in 0..10 {
            db.put_block_record(height, &record(0, height as u64 * 100, 1)).unwrap();
        }
        let files = db.get_block_files(Some(0), Some(6)).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].best_height, 9);
        assert_eq!(files[0].blocks, 4);
        assert_eq!(files[0].txs, 4);
    }

    #[test]
    fn test_claim_activity_counts() {
        let tmp = TempDir::new().unwrap();
        let db = ChainDb::open(tmp.path()).unwrap();
        db.put_claim_activity(
            3,
            &ChainClaimActivity {
                claims: 2,
                supports: 1,
                takeovers: vec![ChainTakeover {
                    name: "video".to_string(),
                    claim_id: vec![1u8; 20],
                }],
            },
        )
        .unwrap();
        db.put_claim_activity(
            7,
            &ChainClaimActivity {
                claims: 1,
                supports: 0,
                takeovers: Vec::new(),
            },
        )
        .unwrap();

        assert_eq!(db.get_claim_metadata_count(0, 10).unwrap(), 3);
        assert_eq!(db.get_claim_metadata_count(4, 10).unwrap(), 1);
        assert_eq!(db.get_support_metadata_count(0, 10).unwrap(), 1);
        assert_eq!(db.get_takeover_count(0, 10).unwrap(), 1);
        assert_eq!(db.get_takeover_count(4, 10).unwrap(), 0);
        let takeovers = db.get_takeovers(0, 10).unwrap();
        assert_eq!(takeovers.len(), 1);
        assert_eq!(takeovers[0].0, 3);
        assert_eq!(takeovers[0].1.name, "video");
    }
}
