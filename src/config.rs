pub use config::Config;
pub use once_cell::sync::OnceCell;

use crate::types::BoxedError;

static GLOBAL_CONFIG: OnceCell<Config> = OnceCell::new();

pub fn init_global_config(path: &str) -> Result<(), BoxedError> {
    let config = Config::builder()
        .add_source(config::File::with_name(path))
        .build()?;
    GLOBAL_CONFIG
        .set(config)
        .map_err(|_| "Config already set")?;
    Ok(())
}

pub fn get_global_config() -> &'static Config {
    GLOBAL_CONFIG.get().unwrap_or_else(|| {
        eprintln!("FATAL: Config not initialized - call init_global_config() first");
        std::process::exit(1);
    })
}

/// Load config for standalone binaries/utilities
pub fn load_config() -> Result<Config, BoxedError> {
    Config::builder()
        .add_source(config::File::with_name("config.toml"))
        .build()
        .map_err(|e| Box::new(e) as BoxedError)
}

/// Get db_path from config, with `~` expansion
pub fn get_db_path(config: &Config) -> Result<String, BoxedError> {
    let raw = config
        .get_string("paths.db_path")
        .map_err(|e| format!("Missing paths.db_path in config: {}", e))?;
    Ok(shellexpand::tilde(&raw).into_owned())
}

/// Get the node datadir (block files + index) from config, with `~` expansion
pub fn get_chain_dir(config: &Config) -> Result<String, BoxedError> {
    let raw = config
        .get_string("paths.chain_dir")
        .map_err(|e| format!("Missing paths.chain_dir in config: {}", e))?;
    Ok(shellexpand::tilde(&raw).into_owned())
}

/// Tuning knobs for the synchronizer. These bound per-task memory and
/// progress granularity; they are not correctness parameters.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Flush to db after processing this many TXs and update progress
    pub tx_flush_size: usize,
    /// Split filter generation tasks into this size block chunks
    pub filter_chunk_size: usize,
    /// Flush to db after processing this many filters and update progress
    pub filter_flush_size: usize,
    /// Split claim sync tasks into this size chunks
    pub claim_chunk_size: usize,
    /// Split support sync tasks into this size chunks
    pub support_chunk_size: usize,
    /// Generate compact address filters for light clients
    pub spv_address_filters: bool,
    /// Run the (placeholder) trend computation every cycle
    pub trending: bool,
    /// Seconds between chain tip polls once subscribed
    pub poll_interval_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            tx_flush_size: 20_000,
            filter_chunk_size: 100_000,
            filter_flush_size: 10_000,
            claim_chunk_size: 50_000,
            support_chunk_size: 50_000,
            spv_address_filters: false,
            trending: false,
            poll_interval_secs: 5,
        }
    }
}

impl SyncSettings {
    pub fn from_config(config: &Config) -> Self {
        let defaults = Self::default();
        Self {
            tx_flush_size: config
                .get_int("sync.tx_flush_size")
                .map(|v| v as usize)
                .unwrap_or(defaults.tx_flush_size),
            filter_chunk_size: config
                .get_int("sync.filter_chunk_size")
                .map(|v| v as usize)
                .unwrap_or(defaults.filter_chunk_size),
            filter_flush_size: config
                .get_int("sync.filter_flush_size")
                .map(|v| v as usize)
                .unwrap_or(defaults.filter_flush_size),
            claim_chunk_size: config
                .get_int("sync.claim_chunk_size")
                .map(|v| v as usize)
                .unwrap_or(defaults.claim_chunk_size),
            support_chunk_size: config
                .get_int("sync.support_chunk_size")
                .map(|v| v as usize)
                .unwrap_or(defaults.support_chunk_size),
            spv_address_filters: config
                .get_bool("sync.spv_address_filters")
                .unwrap_or(defaults.spv_address_filters),
            trending: config.get_bool("sync.trending").unwrap_or(defaults.trending),
            poll_interval_secs: config
                .get_int("sync.poll_interval_secs")
                .map(|v| v as u64)
                .unwrap_or(defaults.poll_interval_secs),
        }
    }
}
