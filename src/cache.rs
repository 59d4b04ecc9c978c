/// In-memory caching for the block pool and predicate store.
///
/// Cached items:
/// - Recent blocks (by BlockIdentifier), to avoid round-tripping through
///   the adapter when the pool needs to re-walk a fork.
/// - Predicate status snapshots, read far more often than they're written.
/// - A generic JSON cache with TTL for anything else that benefits from it.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use serde::{Serialize, Deserialize};
use serde::de::DeserializeOwned;

use crate::types::RawBlock;

#[derive(Debug, Clone)]
struct CachedEntry<T> {
    value: T,
    expires_at: Instant,
}

impl<T> CachedEntry<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self { value, expires_at: Instant::now() + ttl }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    fn value(&self) -> &T {
        &self.value
    }
}

/// Global cache manager holding all LRU caches.
pub struct CacheManager {
    /// Blocks cached by `"{chain}:{hash}"` key.
    blocks_by_key: Arc<RwLock<LruCache<String, RawBlock>>>,

    /// Generic JSON cache with TTL support, used for predicate status
    /// snapshots and anything else the management surface serves.
    json_cache: Arc<RwLock<LruCache<String, CachedEntry<serde_json::Value>>>>,
}

impl CacheManager {
    /// Default sizes: 2000 blocks (enough to cover the reorg window with
    /// margin on both chains) and 5000 JSON entries.
    pub fn new() -> Self {
        Self::with_capacities(2000, 5000)
    }

    pub fn with_capacities(blocks_cap: usize, json_cap: usize) -> Self {
        Self {
            blocks_by_key: Arc::new(RwLock::new(
                LruCache::new(NonZeroUsize::new(blocks_cap).unwrap())
            )),
            json_cache: Arc::new(RwLock::new(
                LruCache::new(NonZeroUsize::new(json_cap).unwrap())
            )),
        }
    }

    fn block_key(chain: &str, hash: &str) -> String {
        format!("{}:{}", chain, hash)
    }

    pub async fn get_block(&self, chain: &str, hash: &str) -> Option<RawBlock> {
        let mut cache = self.blocks_by_key.write().await;
        cache.get(&Self::block_key(chain, hash)).cloned()
    }

    pub async fn put_block(&self, chain: &str, block: RawBlock) {
        let key = Self::block_key(chain, &block.id.hash);
        let mut cache = self.blocks_by_key.write().await;
        cache.put(key, block);
    }

    /// Invalidate a block from the cache (used on pool eviction/rollback).
    pub async fn invalidate_block(&self, chain: &str, hash: &str) {
        let mut cache = self.blocks_by_key.write().await;
        cache.pop(&Self::block_key(chain, hash));
    }

    // ========== Generic JSON Cache with TTL ==========

    pub async fn get_json<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned,
    {
        let mut cache = self.json_cache.write().await;
        if let Some(entry) = cache.get(&key.to_string()) {
            if !entry.is_expired() {
                if let Ok(value) = serde_json::from_value::<T>(entry.value().clone()) {
                    return Some(value);
                }
            } else {
                cache.pop(&key.to_string());
            }
        }
        None
    }

    pub async fn set_json<T>(&self, key: &str, value: &T, ttl: Duration)
    where
        T: Serialize,
    {
        if let Ok(json_value) = serde_json::to_value(value) {
            let entry = CachedEntry::new(json_value, ttl);
            let mut cache = self.json_cache.write().await;
            cache.put(key.to_string(), entry);
        }
    }

    pub async fn invalidate(&self, key: &str) {
        let mut cache = self.json_cache.write().await;
        cache.pop(&key.to_string());
    }

    /// Cache key for a predicate's status snapshot.
    pub fn predicate_status_key(uuid: &str) -> String {
        format!("predicate_status:{}", uuid)
    }

    pub async fn get_stats(&self) -> CacheStats {
        CacheStats {
            blocks_count: self.blocks_by_key.read().await.len(),
            json_cache_count: self.json_cache.read().await.len(),
        }
    }

    /// Clear all caches (used after a deep reorg or in tests).
    pub async fn clear_all(&self) {
        self.blocks_by_key.write().await.clear();
        self.json_cache.write().await.clear();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub blocks_count: usize,
    pub json_cache_count: usize,
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlockIdentifier, Chain, ChainMetadata};

    fn sample_block(hash: &str, index: u64) -> RawBlock {
        RawBlock {
            chain: Chain::Bitcoin,
            id: BlockIdentifier::new(index, hash),
            parent_id: BlockIdentifier::new(index.saturating_sub(1), "parent"),
            timestamp: 0,
            transactions: vec![],
            chain_metadata: ChainMetadata::default(),
        }
    }

    #[tokio::test]
    async fn test_block_cache() {
        let cache = CacheManager::new();
        assert!(cache.get_block("bitcoin", "abc123").await.is_none());

        cache.put_block("bitcoin", sample_block("abc123", 100)).await;
        assert!(cache.get_block("bitcoin", "abc123").await.is_some());

        cache.invalidate_block("bitcoin", "abc123").await;
        assert!(cache.get_block("bitcoin", "abc123").await.is_none());
    }

    #[tokio::test]
    async fn test_json_cache_ttl() {
        let cache = CacheManager::new();
        let key = CacheManager::predicate_status_key("11111111-1111-1111-1111-111111111111");

        cache.set_json(&key, &"Streaming", Duration::from_millis(20)).await;
        assert_eq!(cache.get_json::<String>(&key).await, Some("Streaming".to_string()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get_json::<String>(&key).await, None);
    }

    #[tokio::test]
    async fn test_cache_stats() {
        let cache = CacheManager::with_capacities(100, 100);
        cache.put_block("bitcoin", sample_block("h1", 1)).await;
        let stats = cache.get_stats().await;
        assert_eq!(stats.blocks_count, 1);
        assert_eq!(stats.json_cache_count, 0);
    }
}
