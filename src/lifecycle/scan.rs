//! Historical scan worker pool. Reads blocks from the read-only block
//! index (`block_index_{bitcoin,stacks}`, seeded out-of-band from a chain
//! archive) and evaluates a single predicate against them until it catches
//! up to `tip - reorg_window`, then hands off to live streaming (§4.3).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rocksdb::DB;
use tokio::sync::{RwLock, Semaphore};
use tracing::info;

use crate::config::ThreadsConfig;
use crate::error::EngineError;
use crate::metrics;
use crate::predicates::types::Predicate;
use crate::types::{Block, Chain};

use super::LifecycleController;

fn block_index_cf(chain: Chain) -> &'static str {
    match chain {
        Chain::Bitcoin => "block_index_bitcoin",
        Chain::Stacks => "block_index_stacks",
    }
}

const CF_CHECKPOINTS: &str = "scan_checkpoints";

pub struct ScanCoordinator {
    db: Arc<DB>,
    bitcoin_semaphore: Arc<Semaphore>,
    stacks_semaphore: Arc<Semaphore>,
    cancel_flags: RwLock<HashMap<String, Arc<AtomicBool>>>,
}

impl ScanCoordinator {
    pub fn new(db: Arc<DB>, threads: &ThreadsConfig) -> Self {
        Self {
            db,
            bitcoin_semaphore: Arc::new(Semaphore::new(threads.max_number_of_concurrent_bitcoin_scans.max(1))),
            stacks_semaphore: Arc::new(Semaphore::new(threads.max_number_of_concurrent_stacks_scans.max(1))),
            cancel_flags: RwLock::new(HashMap::new()),
        }
    }

    pub async fn cancel(&self, uuid: &str) {
        if let Some(flag) = self.cancel_flags.read().await.get(uuid) {
            flag.store(true, Ordering::Relaxed);
        }
    }

    async fn read_checkpoint(&self, uuid: &str) -> Result<Option<u64>, EngineError> {
        let db = self.db.clone();
        let uuid = uuid.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<u64>, EngineError> {
            let cf = db
                .cf_handle(CF_CHECKPOINTS)
                .ok_or_else(|| EngineError::scan("scan_checkpoints cf missing"))?;
            match db.get_cf(&cf, uuid.as_bytes())? {
                Some(bytes) if bytes.len() == 8 => {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(&bytes);
                    Ok(Some(u64::from_be_bytes(buf)))
                }
                _ => Ok(None),
            }
        })
        .await
        .map_err(|e| EngineError::scan(e.to_string()))?
    }

    async fn write_checkpoint(&self, uuid: &str, height: u64) -> Result<(), EngineError> {
        let db = self.db.clone();
        let uuid = uuid.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), EngineError> {
            let cf = db
                .cf_handle(CF_CHECKPOINTS)
                .ok_or_else(|| EngineError::scan("scan_checkpoints cf missing"))?;
            db.put_cf(&cf, uuid.as_bytes(), height.to_be_bytes())?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::scan(e.to_string()))?
    }

    async fn read_block(&self, chain: Chain, height: u64) -> Result<Option<Block>, EngineError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<Block>, EngineError> {
            let cf = db
                .cf_handle(block_index_cf(chain))
                .ok_or_else(|| EngineError::scan(format!("{} cf missing", block_index_cf(chain))))?;
            match db.get_cf(&cf, height.to_be_bytes())? {
                Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| EngineError::scan(e.to_string()))?
    }

    /// Scans `predicate` from its last checkpoint (or `start_block`) up to
    /// `tip - reorg_window`, then hands it to the controller to promote to
    /// `Streaming`. Cancellable: checkpointing every block means a
    /// cancelled scan resumes exactly where it left off.
    pub async fn run(self: Arc<Self>, predicate: Predicate, controller: Arc<LifecycleController>) -> Result<(), EngineError> {
        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.cancel_flags.write().await.insert(predicate.uuid.clone(), cancel_flag.clone());

        let semaphore = match predicate.chain() {
            Chain::Bitcoin => self.bitcoin_semaphore.clone(),
            Chain::Stacks => self.stacks_semaphore.clone(),
        };

        let mut height = match self.read_checkpoint(&predicate.uuid).await? {
            Some(checkpoint) => checkpoint + 1,
            None => predicate.start_block.unwrap_or(0),
        };

        info!(uuid = %predicate.uuid, from = height, "scan starting");

        loop {
            if cancel_flag.load(Ordering::Relaxed) {
                info!(uuid = %predicate.uuid, at = height, "scan cancelled, checkpoint preserved");
                return Ok(());
            }

            let ceiling = controller.scan_ceiling(&predicate).await?;
            if height > ceiling {
                break;
            }

            let permit = semaphore.acquire().await.expect("semaphore never closed");
            let block = self.read_block(predicate.chain(), height).await?;
            drop(permit);

            let Some(block) = block else {
                metrics::increment_scan_failures(&predicate.chain().to_string());
                return Err(EngineError::scan(format!("block index missing height {}", height)));
            };

            controller.evaluate_scanned_block(&predicate, &block).await?;
            self.write_checkpoint(&predicate.uuid, height).await?;
            metrics::set_scan_lag_blocks(&predicate.uuid, ceiling.saturating_sub(height) as i64);

            height += 1;
        }

        controller.promote_to_streaming(&predicate, height.saturating_sub(1)).await?;
        self.cancel_flags.write().await.remove(&predicate.uuid);
        metrics::set_scan_lag_blocks(&predicate.uuid, 0);
        Ok(())
    }
}
