//! Block source adapters: normalize Bitcoin (RPC+ZMQ) and Stacks (HTTP
//! event-observer) into a common `RawBlock` stream.

pub mod bitcoin;
mod script_utils;
pub mod stacks;

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc::Receiver;

use crate::error::EngineError;
use crate::types::{BlockIdentifier, RawBlock};

/// Common surface the pool/stream coordinator drives each chain through.
/// `subscribe` starts (or reuses) the adapter's background ingest task and
/// returns a channel of normalized blocks in arrival order; it does not
/// guarantee canonical ordering, that's the pool's job.
#[allow(async_fn_in_trait)]
pub trait BlockSourceAdapter {
    fn subscribe(&self) -> Receiver<RawBlock>;
    async fn fetch_block(&self, id: &BlockIdentifier) -> Result<RawBlock, EngineError>;
    async fn tip(&self) -> Result<BlockIdentifier, EngineError>;
}

/// Type-erased tip query, so the lifecycle controller can consult an
/// adapter's live tip without being generic over which adapter backs a
/// chain. Implemented for every `BlockSourceAdapter`.
pub trait TipSource: Send + Sync {
    fn tip(&self) -> Pin<Box<dyn Future<Output = Result<BlockIdentifier, EngineError>> + Send + '_>>;
}

impl<A: BlockSourceAdapter + Send + Sync> TipSource for A {
    fn tip(&self) -> Pin<Box<dyn Future<Output = Result<BlockIdentifier, EngineError>> + Send + '_>> {
        Box::pin(BlockSourceAdapter::tip(self))
    }
}
