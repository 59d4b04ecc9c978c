//! Stream coordinator: one task per chain, bridging a `BlockSourceAdapter`
//! through the chain's `BlockPool` into the lifecycle controller, and
//! broadcasting a status-stream summary for `websocket`.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{error, info};

use crate::chain::BlockSourceAdapter;
use crate::error::EngineError;
use crate::lifecycle::LifecycleController;
use crate::metrics;
use crate::pool::BlockPool;
use crate::types::{Chain, ChainUpdate};

/// A lightweight summary of a `ChainUpdate`, broadcast for status
/// observers (the websocket surface); the full block data stays internal
/// to dispatch so we don't duplicate potentially large payloads.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChainUpdateSummary {
    pub chain: Chain,
    pub apply_heights: Vec<u64>,
    pub rollback_heights: Vec<u64>,
}

#[derive(Clone)]
pub struct StreamCoordinator {
    lifecycle: Arc<LifecycleController>,
    updates_tx: broadcast::Sender<ChainUpdateSummary>,
}

impl StreamCoordinator {
    pub fn new(lifecycle: Arc<LifecycleController>) -> Self {
        let (updates_tx, _) = broadcast::channel(256);
        Self { lifecycle, updates_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChainUpdateSummary> {
        self.updates_tx.subscribe()
    }

    /// Runs the ingest loop for one chain until the adapter's channel
    /// closes (adapter task died or shutdown). Intended to be spawned as
    /// its own task per chain.
    pub async fn run<A: BlockSourceAdapter>(&self, chain: Chain, adapter: &A, mut pool: BlockPool) {
        let mut blocks = adapter.subscribe();
        metrics::set_adapter_connected(&chain.to_string(), true);
        info!(%chain, "stream coordinator attached to adapter");

        while let Some(block) = blocks.recv().await {
            metrics::increment_blocks_processed(&chain.to_string());
            match pool.process(block) {
                Ok(Some(update)) => self.handle_update(chain, update).await,
                Ok(None) => {}
                Err(e) => {
                    error!(%chain, error = %e, "pool rejected block");
                    if e.is_interrupting() {
                        metrics::increment_pool_invariant_violations(&chain.to_string());
                        if let Err(persist_err) = self.lifecycle.interrupt_chain(chain, e.interrupt_reason()).await {
                            error!(%chain, error = %persist_err, "failed to mark predicates interrupted");
                        }
                    }
                }
            }
        }

        metrics::set_adapter_connected(&chain.to_string(), false);
        info!(%chain, "stream coordinator adapter channel closed");
    }

    async fn handle_update(&self, chain: Chain, update: ChainUpdate) {
        if !update.rollback.is_empty() {
            metrics::increment_reorg_events(&chain.to_string());
            metrics::record_reorg_depth(&chain.to_string(), update.rollback.len() as u64);
        }

        let summary = ChainUpdateSummary {
            chain,
            apply_heights: update.apply.iter().map(|b| b.id.index).collect(),
            rollback_heights: update.rollback.iter().map(|b| b.id.index).collect(),
        };

        if let Err(e) = self.lifecycle.handle_update(chain, &update).await {
            error!(%chain, error = %e, "lifecycle controller failed to process chain update");
        }

        // No receivers is the common case when nobody's watching the
        // status stream; that's not an error.
        let _ = self.updates_tx.send(summary);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_update_summary_is_serializable() {
        let summary = ChainUpdateSummary { chain: Chain::Bitcoin, apply_heights: vec![1, 2], rollback_heights: vec![] };
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("apply_heights"));
    }
}
