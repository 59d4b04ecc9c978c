use std::sync::Arc;

use clap::Parser;
use rocksdb::{ColumnFamilyDescriptor, Options, DB};
use tracing::{error, info};

use chainhook_engine::api::{self, ApiState};
use chainhook_engine::chain::bitcoin::BitcoinAdapter;
use chainhook_engine::chain::stacks::StacksAdapter;
use chainhook_engine::config::{get_engine_config, init_global_config};
use chainhook_engine::db_handles::DbHandles;
use chainhook_engine::dispatch::DispatchHandle;
use chainhook_engine::lifecycle::scan::ScanCoordinator;
use chainhook_engine::lifecycle::LifecycleController;
use chainhook_engine::metrics;
use chainhook_engine::pool::BlockPool;
use chainhook_engine::predicates::store::PredicateStore;
use chainhook_engine::stream::StreamCoordinator;
use chainhook_engine::telemetry::{self, TelemetryConfig};
use chainhook_engine::types::Chain;

const COLUMN_FAMILIES: [&str; 5] = [
    "predicate_registry",
    "predicate_status",
    "block_index_bitcoin",
    "block_index_stacks",
    "scan_checkpoints",
];

fn open_db(db_path: &str) -> Result<Arc<DB>, Box<dyn std::error::Error>> {
    let mut options = Options::default();
    options.create_if_missing(true);
    options.create_missing_column_families(true);
    options.set_compression_type(rocksdb::DBCompressionType::Lz4);
    options.increase_parallelism(num_cpus_hint());

    let cf_descriptors = COLUMN_FAMILIES
        .iter()
        .map(|cf| ColumnFamilyDescriptor::new(*cf, Options::default()))
        .collect::<Vec<_>>();

    let db = DB::open_cf_descriptors(&options, db_path, cf_descriptors)?;
    Ok(Arc::new(db))
}

fn num_cpus_hint() -> i32 {
    std::thread::available_parallelism().map(|n| n.get() as i32).unwrap_or(4)
}

#[derive(Parser, Debug)]
#[clap(name = "chainhook-engine")]
#[clap(about = "Reorg-aware transaction indexing and predicate dispatch engine", long_about = None)]
struct Args {
    /// Path to the TOML config file, default "config.toml"
    #[clap(long)]
    config: Option<String>,

    /// Overrides RUST_LOG / the config's default log level
    #[clap(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut telemetry_config = TelemetryConfig::default();
    if let Some(log_level) = args.log_level {
        telemetry_config.log_level = log_level;
    }
    telemetry::init_tracing(telemetry_config)?;
    init_global_config(args.config.as_deref())?;
    metrics::init_metrics()?;

    let config = get_engine_config();

    let db = open_db(&config.paths.db_path)?;
    DbHandles::new(db.clone()).map_err(|e| -> Box<dyn std::error::Error> { e.into() })?;

    let store = Arc::new(PredicateStore::new(db.clone()));
    let dispatch = DispatchHandle::new(store.clone(), config.dispatch.clone());
    let scan = Arc::new(ScanCoordinator::new(db.clone(), &config.threads));
    let lifecycle = LifecycleController::new(store.clone(), dispatch, scan);
    lifecycle.restore().await?;

    let stream_coordinator = Arc::new(StreamCoordinator::new(lifecycle.clone()));

    let bitcoin_adapter = Arc::new(BitcoinAdapter::new(config.bitcoin.clone()));
    lifecycle.set_tip_source(Chain::Bitcoin, bitcoin_adapter.clone()).await;
    let bitcoin_pool = BlockPool::new(Chain::Bitcoin, config.bitcoin.reorg_window);
    {
        let coordinator = stream_coordinator.clone();
        let adapter = bitcoin_adapter.clone();
        tokio::spawn(async move {
            coordinator.run(Chain::Bitcoin, adapter.as_ref(), bitcoin_pool).await;
        });
    }

    let stacks_adapter = Arc::new(StacksAdapter::new(config.stacks.clone()));
    lifecycle.set_tip_source(Chain::Stacks, stacks_adapter.clone()).await;
    let stacks_pool = BlockPool::new(Chain::Stacks, config.stacks.reorg_window);
    {
        let coordinator = stream_coordinator.clone();
        let adapter = stacks_adapter.clone();
        tokio::spawn(async move {
            coordinator.run(Chain::Stacks, adapter.as_ref(), stacks_pool).await;
        });
    }

    let api_state = ApiState { lifecycle: lifecycle.clone() };
    let app = api::router(api_state)
        .route("/ws/chain-updates", axum::routing::get(chainhook_engine::websocket::ws_chain_updates_handler))
        .route("/ws/predicate-status", axum::routing::get(chainhook_engine::websocket::ws_predicate_status_handler))
        .layer(axum::extract::Extension(stream_coordinator))
        .layer(axum::extract::Extension(lifecycle));

    let addr = config.management.bind_address.clone();
    info!(%addr, "management http surface listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "management http server exited");
    }

    Ok(())
}
