use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use rustysync::chain::Chain;
use rustysync::config::{get_chain_dir, get_db_path, get_global_config, init_global_config, SyncSettings};
use rustysync::db::Database;
use rustysync::events::EventBroadcaster;
use rustysync::sync::BlockchainSync;
use rustysync::telemetry::{init_tracing, TelemetryConfig};
use rustysync::types::BoxedError;

/// Blockchain synchronizer daemon: indexes a node's block-file store into
/// a local claim/support index and follows the chain tip.
#[derive(Parser)]
#[command(name = "rustysync", version)]
struct Args {
    /// Path to the config file
    #[arg(long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), BoxedError> {
    let args = Args::parse();
    init_global_config(&args.config)?;
    let config = get_global_config();

    let _telemetry_guard = init_tracing(TelemetryConfig::default())?;

    let db_path = get_db_path(config)?;
    let chain_dir = get_chain_dir(config)?;
    let settings = SyncSettings::from_config(config);

    let chain = Arc::new(Chain::open(Path::new(&chain_dir), settings.poll_interval_secs)?);
    let db = Arc::new(Database::open(Path::new(&db_path), chain.db_arc())?);
    let broadcaster = Arc::new(EventBroadcaster::new());

    // drain progress events into the log
    let mut progress_rx = db
        .take_message_receiver()
        .ok_or("progress receiver already taken")?;
    tokio::spawn(async move {
        while let Some(msg) = progress_rx.recv().await {
            info!(event = %msg.event, data = %msg.data, "sync progress");
        }
    });

    let sync = Arc::new(BlockchainSync::new(
        chain.clone(),
        db.clone(),
        broadcaster.clone(),
        settings,
    ));
    sync.clone().start().await?;
    info!(chain_dir = %chain_dir, db_path = %db_path, "rustysync started");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    sync.stop().await;
    Ok(())
}
