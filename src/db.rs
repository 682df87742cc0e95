/// Database Collaborator - RocksDB-backed index with a blocking task pool
///
/// Responsibilities:
/// - Own the RocksDB handle and its column families
/// - Run CPU-bound phase workers on the blocking pool (`run`)
/// - Carry the stop event that in-flight tasks observe cooperatively
/// - Carry the message queue progress events are published on

use std::path::Path;
use std::sync::{Arc, Mutex};

use rocksdb::{ColumnFamily, Options, DB};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_util::sync::CancellationToken;

use crate::chain::ChainDb;
use crate::constants::{CF_CLAIM, CF_SUPPORT, COLUMN_FAMILIES};
use crate::progress::{Event, ProgressMessage, ProgressPub, ProgressQueue};
use crate::queries;
use crate::types::BoxedError;

/// Everything a phase worker needs, passed by value onto the blocking pool
#[derive(Clone)]
pub struct TaskContext {
    pub db: Arc<DB>,
    pub chain: Arc<ChainDb>,
    pub queue: ProgressQueue,
    pub stop_event: CancellationToken,
}

impl TaskContext {
    pub fn cf(&self, name: &str) -> Result<&ColumnFamily, BoxedError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| format!("{} CF not found", name).into())
    }

    /// Fetch and decode one row
    pub fn get_row<T: DeserializeOwned>(
        &self,
        cf_name: &str,
        key: &[u8],
    ) -> Result<Option<T>, BoxedError> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Worker-side progress publisher for flush-time updates
    pub fn progress(&self, event: Event) -> ProgressPub {
        ProgressPub::new(self.queue.clone(), event)
    }

    /// True once `stop()` has fired; workers check this between batches
    pub fn interrupted(&self) -> bool {
        self.stop_event.is_cancelled()
    }
}

pub struct Database {
    db: Arc<DB>,
    chain: Arc<ChainDb>,
    queue_tx: ProgressQueue,
    queue_rx: Mutex<Option<UnboundedReceiver<ProgressMessage>>>,
    stop: CancellationToken,
}

impl Database {
    pub fn open(path: &Path, chain: Arc<ChainDb>) -> Result<Self, BoxedError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let mut cf_names = vec!["default"];
        cf_names.extend(COLUMN_FAMILIES);

        let db = DB::open_cf(&opts, path, &cf_names)?;
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Ok(Self {
            db: Arc::new(db),
            chain,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            stop: CancellationToken::new(),
        })
    }

    /// Sink for progress events
    pub fn message_queue(&self) -> ProgressQueue {
        self.queue_tx.clone()
    }

    /// The receiving end of the message queue; the daemon drains it into
    /// the log. Can only be taken once.
    pub fn take_message_receiver(&self) -> Option<UnboundedReceiver<ProgressMessage>> {
        self.queue_rx.lock().unwrap().take()
    }

    /// Settable stop signal observed by in-flight tasks
    pub fn stop_event(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub(crate) fn task_context(&self) -> TaskContext {
        TaskContext {
            db: self.db.clone(),
            chain: self.chain.clone(),
            queue: self.queue_tx.clone(),
            stop_event: self.stop.clone(),
        }
    }

    /// Run a phase worker on the blocking pool and await its result
    pub async fn run<T, F>(&self, f: F) -> Result<T, BoxedError>
    where
        T: Send + 'static,
        F: FnOnce(&TaskContext) -> Result<T, BoxedError> + Send + 'static,
    {
        let ctx = self.task_context();
        match tokio::task::spawn_blocking(move || f(&ctx)).await {
            Ok(result) => result,
            Err(e) => Err(Box::new(e)),
        }
    }

    pub async fn has_claims(&self) -> Result<bool, BoxedError> {
        self.run(|ctx| queries::has_rows(ctx, CF_CLAIM)).await
    }

    pub async fn has_supports(&self) -> Result<bool, BoxedError> {
        self.run(|ctx| queries::has_rows(ctx, CF_SUPPORT)).await
    }
}
