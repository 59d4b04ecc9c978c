pub use config::Config;
pub use once_cell::sync::OnceCell;
use serde::Deserialize;
use std::error::Error;

static GLOBAL_CONFIG: OnceCell<Config> = OnceCell::new();
static GLOBAL_ENGINE_CONFIG: OnceCell<EngineConfig> = OnceCell::new();

/// `bitcoin.*` endpoint settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BitcoinConfig {
    pub rpc_url: String,
    pub rpc_username: String,
    pub rpc_password: String,
    pub zmq_url: Option<String>,
    #[serde(default = "default_bitcoin_reorg_window")]
    pub reorg_window: u64,
    /// "mainnet" | "testnet" | "regtest" | "signet" - selects the Stacks
    /// burnchain op magic bytes and address encoding.
    #[serde(default = "default_bitcoin_network")]
    pub network: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_bitcoin_network() -> String {
    "mainnet".to_string()
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_bitcoin_reorg_window() -> u64 {
    7
}

/// `stacks.*` event-observer settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StacksConfig {
    pub event_observer_bind: String,
    #[serde(default = "default_stacks_reorg_window")]
    pub reorg_window: u64,
}

fn default_stacks_reorg_window() -> u64 {
    7
}

/// `pool.*` bootstrap/eviction settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub bootstrap_safety_margin: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { bootstrap_safety_margin: default_bootstrap_safety_margin() }
    }
}

fn default_bootstrap_safety_margin() -> u64 {
    16
}

/// `threads.*` worker pool sizes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThreadsConfig {
    pub max_number_of_concurrent_bitcoin_scans: usize,
    pub max_number_of_concurrent_stacks_scans: usize,
    pub max_number_of_processing_threads: usize,
    pub max_number_of_networking_threads: usize,
}

impl Default for ThreadsConfig {
    fn default() -> Self {
        Self {
            max_number_of_concurrent_bitcoin_scans: default_concurrent_scans(),
            max_number_of_concurrent_stacks_scans: default_concurrent_scans(),
            max_number_of_processing_threads: default_processing_threads(),
            max_number_of_networking_threads: default_networking_threads(),
        }
    }
}

fn default_concurrent_scans() -> usize {
    4
}

fn default_processing_threads() -> usize {
    4
}

fn default_networking_threads() -> usize {
    8
}

/// `dispatch.*` sink settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub http_timeout_secs: u64,
    pub body_size_limit_bytes: usize,
    pub per_predicate_queue_depth: usize,
    pub max_retries: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            http_timeout_secs: default_http_timeout_secs(),
            body_size_limit_bytes: default_body_size_limit_bytes(),
            per_predicate_queue_depth: default_queue_depth(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_body_size_limit_bytes() -> usize {
    20 * 1024 * 1024
}

fn default_queue_depth() -> usize {
    256
}

fn default_max_retries() -> u32 {
    8
}

/// `management.*` settings for the predicate management HTTP surface.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManagementConfig {
    pub bind_address: String,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self { bind_address: default_management_bind() }
    }
}

fn default_management_bind() -> String {
    "0.0.0.0:3000".to_string()
}

/// `paths.*` storage locations.
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    pub db_path: String,
    pub predicate_registry_path: Option<String>,
    pub block_index_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub bitcoin: BitcoinConfig,
    pub stacks: StacksConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub threads: ThreadsConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub management: ManagementConfig,
    pub paths: PathsConfig,
}

/// `config_path` overrides the default `config.toml` lookup, e.g. from a
/// `--config` CLI flag.
pub fn init_global_config(config_path: Option<&str>) -> Result<(), Box<dyn Error>> {
    let config = Config::builder()
        .add_source(config::File::with_name(config_path.unwrap_or("config.toml")))
        .add_source(config::Environment::with_prefix("CHAINHOOK").separator("__"))
        .build()?;

    let engine_config: EngineConfig = config.clone().try_deserialize()?;

    GLOBAL_CONFIG.set(config).map_err(|_| "Config already set")?;
    GLOBAL_ENGINE_CONFIG
        .set(engine_config)
        .map_err(|_| "EngineConfig already set")?;
    Ok(())
}

pub fn get_global_config() -> &'static Config {
    GLOBAL_CONFIG.get().unwrap_or_else(|| {
        eprintln!("FATAL: Config not initialized - call init_global_config() first");
        std::process::exit(1);
    })
}

pub fn get_engine_config() -> &'static EngineConfig {
    GLOBAL_ENGINE_CONFIG.get().unwrap_or_else(|| {
        eprintln!("FATAL: EngineConfig not initialized - call init_global_config() first");
        std::process::exit(1);
    })
}

/// Load config for standalone binaries/utilities (scan CLI, etc.).
pub fn load_config() -> Result<Config, Box<dyn Error>> {
    Config::builder()
        .add_source(config::File::with_name("config.toml"))
        .build()
        .map_err(|e| Box::new(e) as Box<dyn Error>)
}

/// Get db_path from config.
pub fn get_db_path(config: &Config) -> Result<String, Box<dyn Error>> {
    config
        .get_string("paths.db_path")
        .map_err(|e| format!("Missing paths.db_path in config: {}", e).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_dispatch_fields() {
        let d = DispatchConfig::default();
        assert_eq!(d.http_timeout_secs, 30);
        assert_eq!(d.max_retries, 8);
    }

    #[test]
    fn defaults_fill_missing_threads_fields() {
        let t = ThreadsConfig::default();
        assert_eq!(t.max_number_of_networking_threads, 8);
    }
}
