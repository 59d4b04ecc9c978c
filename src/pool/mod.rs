//! Block pool (fork tracker): a bounded DAG of recently received blocks
//! per chain, canonical-tip detection, and `ChainUpdate` emission.
//!
//! Represented as `arena<Block>` with integer ids; children stored as
//! `Vec<BlockId>`; canonical tip is a single `BlockId`. Eviction is a
//! sweep over ids no longer reachable from tip within the reorg window.

pub mod chainwork;

use std::collections::{HashMap, HashSet};

use crate::error::EngineError;
use crate::types::{Block, BlockIdentifier, Chain, ChainUpdate, RawBlock};
use chainwork::calculate_work_from_bits;
use num_bigint::BigUint;

type ArenaId = usize;

struct PoolNode {
    block: Block,
    parent: Option<ArenaId>,
    /// Bitcoin only: cumulative work from genesis to this block.
    cumulative_work: BigUint,
}

/// Per-chain fork tracker. One instance per chain (Bitcoin, Stacks).
pub struct BlockPool {
    chain: Chain,
    reorg_window: u64,
    arena: Vec<PoolNode>,
    by_hash: HashMap<String, ArenaId>,
    children: HashMap<ArenaId, Vec<ArenaId>>,
    canonical_tip: Option<ArenaId>,
    /// Lowest block height still retained; blocks below this are evicted.
    root_height: u64,
    /// Blocks buffered because their parent hasn't arrived yet, keyed by
    /// the missing parent's hash.
    orphans: HashMap<String, Vec<RawBlock>>,
}

impl BlockPool {
    pub fn new(chain: Chain, reorg_window: u64) -> Self {
        Self {
            chain,
            reorg_window,
            arena: Vec::new(),
            by_hash: HashMap::new(),
            children: HashMap::new(),
            canonical_tip: None,
            root_height: 0,
            orphans: HashMap::new(),
        }
    }

    pub fn get_canonical_tip(&self) -> Option<BlockIdentifier> {
        self.canonical_tip.map(|id| self.arena[id].block.id.clone())
    }

    pub fn get_block(&self, id: &BlockIdentifier) -> Option<&Block> {
        self.by_hash.get(&id.hash).map(|&idx| &self.arena[idx].block)
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.by_hash.contains_key(hash)
    }

    /// Ingest a block. Returns `Ok(Some(update))` when the canonical chain
    /// changed, `Ok(None)` when it didn't (duplicate, orphan buffered, or
    /// a non-canonical fork extension that doesn't beat the current tip).
    pub fn process(&mut self, block: RawBlock) -> Result<Option<ChainUpdate>, EngineError> {
        if self.by_hash.contains_key(&block.id.hash) {
            return Ok(None);
        }

        if block.is_genesis() {
            return Ok(self.insert_and_reconcile(block, None)?);
        }

        if let Some(&parent_idx) = self.by_hash.get(&block.parent_id.hash) {
            let update = self.insert_and_reconcile(block, Some(parent_idx))?;
            self.attach_buffered_orphans(update.clone())
        } else if block.parent_id.index >= self.root_height {
            // Parent plausibly still fetchable; buffer until it (or a
            // request for it) arrives via a later `process` call.
            self.orphans.entry(block.parent_id.hash.clone()).or_default().push(block);
            Ok(None)
        } else {
            // Parent already evicted below the retained window: this
            // block cannot be connected to anything we track. Dropping it
            // is safe because it cannot out-rank the canonical chain
            // without a parent newer than our root.
            Ok(None)
        }
    }

    /// After successfully attaching `block`, pull in any blocks that were
    /// waiting on it as their parent, recursively. Returns whichever
    /// `ChainUpdate` resulted from the *last* reconciliation, merging with
    /// the update produced when `block` itself was inserted is the
    /// caller's responsibility via `combine`.
    fn attach_buffered_orphans(
        &mut self,
        mut latest: Option<ChainUpdate>,
    ) -> Result<Option<ChainUpdate>, EngineError> {
        loop {
            let tip_hash = match &latest {
                Some(_) => self.canonical_tip.map(|id| self.arena[id].block.id.hash.clone()),
                None => self.canonical_tip.map(|id| self.arena[id].block.id.hash.clone()),
            };
            let Some(hash) = tip_hash else { break };
            let Some(waiting) = self.orphans.remove(&hash) else { break };
            if waiting.is_empty() {
                break;
            }
            for child in waiting {
                if let Some(&parent_idx) = self.by_hash.get(&child.parent_id.hash) {
                    let update = self.insert_and_reconcile(child, Some(parent_idx))?;
                    latest = combine_updates(latest, update);
                }
            }
        }
        Ok(latest)
    }

    fn insert_and_reconcile(
        &mut self,
        block: RawBlock,
        parent: Option<ArenaId>,
    ) -> Result<Option<ChainUpdate>, EngineError> {
        let cumulative_work = match (self.chain, parent) {
            (Chain::Bitcoin, Some(p)) => {
                let work = calculate_work_from_bits(block.chain_metadata.n_bits.unwrap_or(0));
                &self.arena[p].cumulative_work + BigUint::from_bytes_be(&work)
            }
            (Chain::Bitcoin, None) => {
                BigUint::from_bytes_be(&calculate_work_from_bits(block.chain_metadata.n_bits.unwrap_or(0)))
            }
            _ => BigUint::from(0u32),
        };

        let idx = self.arena.len();
        self.by_hash.insert(block.id.hash.clone(), idx);
        if let Some(p) = parent {
            self.children.entry(p).or_default().push(idx);
        }
        self.arena.push(PoolNode { block, parent, cumulative_work });

        let previous_tip = self.canonical_tip;
        let candidate_better = match previous_tip {
            None => true,
            Some(tip) => self.is_strictly_better(idx, tip),
        };

        if !candidate_better {
            return Ok(None);
        }

        let update = self.build_update(previous_tip, idx)?;
        self.canonical_tip = Some(idx);
        self.advance_root(idx);
        Ok(Some(update))
    }

    /// Bitcoin: highest cumulative work. Stacks: greatest index, then
    /// lexicographically greatest `stacks_block_hash` (or block hash) as
    /// a deterministic tiebreak. Ties keep the existing tip (§4.1
    /// anti-oscillation rule).
    fn is_strictly_better(&self, candidate: ArenaId, incumbent: ArenaId) -> bool {
        match self.chain {
            Chain::Bitcoin => {
                self.arena[candidate].cumulative_work > self.arena[incumbent].cumulative_work
            }
            Chain::Stacks => {
                let c = &self.arena[candidate].block;
                let i = &self.arena[incumbent].block;
                if c.id.index != i.id.index {
                    c.id.index > i.id.index
                } else {
                    let c_key = c.chain_metadata.stacks_block_hash.as_deref().unwrap_or(&c.id.hash);
                    let i_key = i.chain_metadata.stacks_block_hash.as_deref().unwrap_or(&i.id.hash);
                    c_key > i_key
                }
            }
        }
    }

    fn ancestors(&self, mut node: ArenaId) -> Vec<ArenaId> {
        let mut path = vec![node];
        while let Some(p) = self.arena[node].parent {
            path.push(p);
            node = p;
        }
        path
    }

    fn build_update(
        &self,
        previous_tip: Option<ArenaId>,
        new_tip: ArenaId,
    ) -> Result<ChainUpdate, EngineError> {
        let Some(prev) = previous_tip else {
            // Pool was empty: apply everything from root to new_tip.
            let mut apply_path = self.ancestors(new_tip);
            apply_path.reverse();
            return Ok(ChainUpdate {
                apply: apply_path.into_iter().map(|idx| self.arena[idx].block.clone()).collect(),
                rollback: vec![],
            });
        };

        if self.is_ancestor_of(prev, new_tip) {
            // Direct descendant: apply is the path strictly above `prev`.
            let mut path = Vec::new();
            let mut cur = new_tip;
            while cur != prev {
                path.push(cur);
                cur = self.arena[cur].parent.expect("prev is an ancestor of cur");
            }
            path.reverse();
            return Ok(ChainUpdate {
                apply: path.into_iter().map(|idx| self.arena[idx].block.clone()).collect(),
                rollback: vec![],
            });
        }

        // Different branch: walk both tips to their LCA.
        let prev_ancestors: Vec<ArenaId> = self.ancestors(prev);
        let new_ancestors: Vec<ArenaId> = self.ancestors(new_tip);
        let prev_set: HashSet<ArenaId> = prev_ancestors.iter().copied().collect();

        let lca = new_ancestors
            .iter()
            .copied()
            .find(|a| prev_set.contains(a))
            .ok_or_else(|| EngineError::pool_invariant("no common ancestor between forks"))?;

        let rollback: Vec<ArenaId> = prev_ancestors.into_iter().take_while(|&a| a != lca).collect();
        let mut apply: Vec<ArenaId> = new_ancestors.into_iter().take_while(|&a| a != lca).collect();
        apply.reverse();

        if rollback.len() as u64 > self.reorg_window {
            return Err(EngineError::pool_invariant("rollback exceeds window"));
        }

        Ok(ChainUpdate {
            apply: apply.into_iter().map(|idx| self.arena[idx].block.clone()).collect(),
            rollback: rollback.into_iter().map(|idx| self.arena[idx].block.clone()).collect(),
        })
    }

    fn is_ancestor_of(&self, ancestor: ArenaId, mut node: ArenaId) -> bool {
        loop {
            if node == ancestor {
                return true;
            }
            match self.arena[node].parent {
                Some(p) => node = p,
                None => return false,
            }
        }
    }

    /// Advance the retained window: the root becomes the block at
    /// `tip.index - reorg_window` on the canonical chain, and anything
    /// below it is compacted out of the arena so it doesn't grow without
    /// bound for the life of the process.
    fn advance_root(&mut self, tip: ArenaId) {
        let tip_height = self.arena[tip].block.id.index;
        let new_root_height = tip_height.saturating_sub(self.reorg_window);
        if new_root_height <= self.root_height {
            return;
        }
        self.root_height = new_root_height;
        self.compact();
    }

    /// Rebuild `arena` keeping only nodes at or above `root_height`,
    /// remapping every `ArenaId` referenced from `by_hash`, `children`,
    /// and `canonical_tip` to match. Nodes below the root are unreachable
    /// from the canonical tip within the reorg window and can never be
    /// re-attached (`process` already refuses blocks whose parent is
    /// below `root_height`), so dropping them is safe.
    fn compact(&mut self) {
        let root_height = self.root_height;
        let old_arena = std::mem::take(&mut self.arena);
        let mut old_to_new: HashMap<ArenaId, ArenaId> = HashMap::with_capacity(old_arena.len());
        let mut new_arena = Vec::with_capacity(old_arena.len());

        for (old_idx, node) in old_arena.into_iter().enumerate() {
            if node.block.id.index < root_height {
                continue;
            }
            let new_idx = new_arena.len();
            old_to_new.insert(old_idx, new_idx);
            // Parents are always inserted before their children, so the
            // parent's remapping is already known here.
            let parent = node.parent.and_then(|p| old_to_new.get(&p).copied());
            new_arena.push(PoolNode { block: node.block, parent, cumulative_work: node.cumulative_work });
        }

        self.by_hash.retain(|_, idx| old_to_new.contains_key(idx));
        for idx in self.by_hash.values_mut() {
            *idx = old_to_new[idx];
        }

        let old_children = std::mem::take(&mut self.children);
        let mut new_children: HashMap<ArenaId, Vec<ArenaId>> = HashMap::with_capacity(old_children.len());
        for (old_parent, kids) in old_children {
            let Some(&new_parent) = old_to_new.get(&old_parent) else { continue };
            let remapped: Vec<ArenaId> = kids.into_iter().filter_map(|k| old_to_new.get(&k).copied()).collect();
            if !remapped.is_empty() {
                new_children.insert(new_parent, remapped);
            }
        }

        self.arena = new_arena;
        self.children = new_children;
        self.canonical_tip = self.canonical_tip.and_then(|t| old_to_new.get(&t).copied());
    }

    pub fn root_height(&self) -> u64 {
        self.root_height
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }
}

fn combine_updates(a: Option<ChainUpdate>, b: Option<ChainUpdate>) -> Option<ChainUpdate> {
    match (a, b) {
        (None, None) => None,
        (Some(x), None) => Some(x),
        (None, Some(y)) => Some(y),
        (Some(mut x), Some(mut y)) => {
            x.apply.append(&mut y.apply);
            x.rollback.append(&mut y.rollback);
            Some(x)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChainMetadata;

    fn block(chain: Chain, index: u64, hash: &str, parent_hash: &str, n_bits: u32) -> RawBlock {
        RawBlock {
            chain,
            id: BlockIdentifier::new(index, hash),
            parent_id: BlockIdentifier::new(index.saturating_sub(1), parent_hash),
            timestamp: index,
            transactions: vec![],
            chain_metadata: ChainMetadata { n_bits: Some(n_bits), ..Default::default() },
        }
    }

    #[test]
    fn genesis_emits_apply_only() {
        let mut pool = BlockPool::new(Chain::Bitcoin, 7);
        let genesis = RawBlock {
            chain: Chain::Bitcoin,
            id: BlockIdentifier::new(0, "genesis"),
            parent_id: BlockIdentifier::new(0, "genesis"),
            timestamp: 0,
            transactions: vec![],
            chain_metadata: ChainMetadata { n_bits: Some(0x1d00ffff), ..Default::default() },
        };
        let update = pool.process(genesis).unwrap().unwrap();
        assert_eq!(update.apply.len(), 1);
        assert!(update.rollback.is_empty());
        assert_eq!(pool.get_canonical_tip().unwrap().hash, "genesis");
    }

    #[test]
    fn linear_extension_is_direct_apply() {
        let mut pool = BlockPool::new(Chain::Bitcoin, 7);
        pool.process(block(Chain::Bitcoin, 0, "g", "g", 0x1d00ffff)).unwrap();
        let update = pool.process(block(Chain::Bitcoin, 1, "b1", "g", 0x1d00ffff)).unwrap().unwrap();
        assert_eq!(update.apply.len(), 1);
        assert_eq!(update.apply[0].id.hash, "b1");
        assert!(update.rollback.is_empty());
    }

    #[test]
    fn duplicate_block_is_noop() {
        let mut pool = BlockPool::new(Chain::Bitcoin, 7);
        pool.process(block(Chain::Bitcoin, 0, "g", "g", 0x1d00ffff)).unwrap();
        pool.process(block(Chain::Bitcoin, 1, "b1", "g", 0x1d00ffff)).unwrap();
        let again = pool.process(block(Chain::Bitcoin, 1, "b1", "g", 0x1d00ffff)).unwrap();
        assert!(again.is_none());
    }

    #[test]
    fn higher_work_fork_triggers_reorg() {
        let mut pool = BlockPool::new(Chain::Bitcoin, 7);
        pool.process(block(Chain::Bitcoin, 0, "g", "g", 0x1d00ffff)).unwrap();
        pool.process(block(Chain::Bitcoin, 1, "x", "g", 0x1d00ffff)).unwrap();

        // Two blocks on a competing branch with higher difficulty (lower
        // target), so their combined work beats the single block "x".
        pool.process(block(Chain::Bitcoin, 1, "y1", "g", 0x1b0404cb)).unwrap();
        let update = pool.process(block(Chain::Bitcoin, 2, "y2", "y1", 0x1b0404cb)).unwrap().unwrap();

        assert_eq!(update.rollback.len(), 1);
        assert_eq!(update.rollback[0].id.hash, "x");
        assert_eq!(update.apply.iter().map(|b| b.id.hash.clone()).collect::<Vec<_>>(), vec!["y1", "y2"]);
        assert_eq!(pool.get_canonical_tip().unwrap().hash, "y2");
    }

    #[test]
    fn equal_work_fork_does_not_oscillate() {
        let mut pool = BlockPool::new(Chain::Bitcoin, 7);
        pool.process(block(Chain::Bitcoin, 0, "g", "g", 0x1d00ffff)).unwrap();
        pool.process(block(Chain::Bitcoin, 1, "a", "g", 0x1d00ffff)).unwrap();
        let second = pool.process(block(Chain::Bitcoin, 1, "b", "g", 0x1d00ffff)).unwrap();
        assert!(second.is_none());
        assert_eq!(pool.get_canonical_tip().unwrap().hash, "a");
    }

    #[test]
    fn rollback_beyond_window_is_pool_invariant_error() {
        let mut pool = BlockPool::new(Chain::Bitcoin, 2);
        pool.process(block(Chain::Bitcoin, 0, "g", "g", 0x1d00ffff)).unwrap();
        pool.process(block(Chain::Bitcoin, 1, "a1", "g", 0x1d00ffff)).unwrap();
        pool.process(block(Chain::Bitcoin, 2, "a2", "a1", 0x1d00ffff)).unwrap();
        pool.process(block(Chain::Bitcoin, 3, "a3", "a2", 0x1d00ffff)).unwrap();

        // A competing fork rooted at genesis, 4 deep with overwhelming
        // work, forces a rollback of all 3 "a" blocks - deeper than the
        // window of 2.
        pool.process(block(Chain::Bitcoin, 1, "b1", "g", 0x1b0404cb)).unwrap();
        pool.process(block(Chain::Bitcoin, 2, "b2", "b1", 0x1b0404cb)).unwrap();
        pool.process(block(Chain::Bitcoin, 3, "b3", "b2", 0x1b0404cb)).unwrap();
        let result = pool.process(block(Chain::Bitcoin, 4, "b4", "b3", 0x1b0404cb));
        assert!(result.is_err());
    }

    #[test]
    fn stacks_tiebreak_prefers_greater_hash_at_equal_index() {
        let mut pool = BlockPool::new(Chain::Stacks, 7);
        pool.process(block(Chain::Stacks, 0, "g", "g", 0)).unwrap();
        pool.process(block(Chain::Stacks, 1, "aaa", "g", 0)).unwrap();
        let update = pool.process(block(Chain::Stacks, 1, "bbb", "g", 0)).unwrap();
        assert!(update.is_some());
        assert_eq!(pool.get_canonical_tip().unwrap().hash, "bbb");
    }

    #[test]
    fn advance_root_compacts_arena() {
        let mut pool = BlockPool::new(Chain::Bitcoin, 2);
        pool.process(block(Chain::Bitcoin, 0, "g", "g", 0x1d00ffff)).unwrap();
        for i in 1..=20u64 {
            let hash = format!("b{i}");
            let parent = if i == 1 { "g".to_string() } else { format!("b{}", i - 1) };
            pool.process(block(Chain::Bitcoin, i, &hash, &parent, 0x1d00ffff)).unwrap();
        }
        // A reorg window of 2 should keep the arena from growing linearly
        // with the number of blocks ever seen.
        assert!(pool.arena.len() <= 4);
        assert_eq!(pool.get_canonical_tip().unwrap().hash, "b20");
    }

    #[test]
    fn orphan_is_buffered_until_parent_arrives() {
        let mut pool = BlockPool::new(Chain::Bitcoin, 7);
        pool.process(block(Chain::Bitcoin, 0, "g", "g", 0x1d00ffff)).unwrap();
        // b2 arrives before its parent b1.
        let buffered = pool.process(block(Chain::Bitcoin, 2, "b2", "b1", 0x1d00ffff)).unwrap();
        assert!(buffered.is_none());
        assert!(!pool.contains("b2"));

        let update = pool.process(block(Chain::Bitcoin, 1, "b1", "g", 0x1d00ffff)).unwrap().unwrap();
        assert_eq!(update.apply.iter().map(|b| b.id.hash.clone()).collect::<Vec<_>>(), vec!["b1", "b2"]);
    }
}
