//! Existence and recency index over the cache tier
//!
//! A member of the cache set means "this key has been populated"; its score
//! is the time of last access, which orders eviction. A second set tracks
//! keys written through the cache but not yet persisted durably.

use crate::error::Result;
use crate::io::IndexStore;
use crate::keys::CuboidKey;
use crate::utils::now_score;
use std::sync::Arc;

pub struct CacheIndex {
    store: Arc<dyn IndexStore>,
    cache_key: String,
    dirty_key: String,
}

fn members(keys: &[CuboidKey]) -> Vec<String> {
    keys.iter().map(|k| k.to_string()).collect()
}

fn parse_members(entries: Vec<(String, f64)>) -> Result<Vec<CuboidKey>> {
    entries.into_iter().map(|(m, _)| m.parse()).collect()
}

impl CacheIndex {
    pub fn new(
        store: Arc<dyn IndexStore>,
        cache_key: impl Into<String>,
        dirty_key: impl Into<String>,
    ) -> Self {
        Self {
            store,
            cache_key: cache_key.into(),
            dirty_key: dirty_key.into(),
        }
    }

    pub async fn contains(&self, key: &CuboidKey) -> Result<bool> {
        let scores = self
            .store
            .scores(&self.cache_key, &[key.to_string()])
            .await?;
        Ok(scores.first().is_some_and(|s| s.is_some()))
    }

    /// Keys of `keys` that are not cached, in input order
    pub async fn missing(&self, keys: &[CuboidKey]) -> Result<Vec<CuboidKey>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let scores = self.store.scores(&self.cache_key, &members(keys)).await?;
        Ok(keys
            .iter()
            .zip(scores)
            .filter(|(_, s)| s.is_none())
            .map(|(k, _)| k.clone())
            .collect())
    }

    /// Record the keys as cached, refreshing their recency
    pub async fn register(&self, keys: &[CuboidKey]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let score = now_score();
        let entries: Vec<(String, f64)> = keys.iter().map(|k| (k.to_string(), score)).collect();
        self.store.add(&self.cache_key, &entries).await
    }

    /// Refresh recency on a hit
    pub async fn touch(&self, keys: &[CuboidKey]) -> Result<()> {
        self.register(keys).await
    }

    pub async fn mark_dirty(&self, keys: &[CuboidKey]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let score = now_score();
        let entries: Vec<(String, f64)> = keys.iter().map(|k| (k.to_string(), score)).collect();
        self.store.add(&self.dirty_key, &entries).await
    }

    pub async fn clear_dirty(&self, keys: &[CuboidKey]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.store.remove(&self.dirty_key, &members(keys)).await
    }

    /// Which of `keys` are dirty, aligned with the input
    pub async fn dirty_among(&self, keys: &[CuboidKey]) -> Result<Vec<bool>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let scores = self.store.scores(&self.dirty_key, &members(keys)).await?;
        Ok(scores.into_iter().map(|s| s.is_some()).collect())
    }

    /// Up to `limit` dirty keys, oldest write first
    pub async fn dirty_keys(&self, limit: usize) -> Result<Vec<CuboidKey>> {
        let entries = self
            .store
            .range_by_score(&self.dirty_key, f64::NEG_INFINITY, f64::INFINITY, 0, limit)
            .await?;
        parse_members(entries)
    }

    /// Up to `limit` cached keys, least recently used first
    pub async fn least_recent(&self, limit: usize) -> Result<Vec<CuboidKey>> {
        let entries = self
            .store
            .range_by_score(&self.cache_key, f64::NEG_INFINITY, f64::INFINITY, 0, limit)
            .await?;
        parse_members(entries)
    }

    /// Drop keys from both the cache and dirty sets
    pub async fn remove(&self, keys: &[CuboidKey]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let names = members(keys);
        self.store.remove(&self.cache_key, &names).await?;
        self.store.remove(&self.dirty_key, &names).await
    }

    /// Number of cached keys
    pub async fn len(&self) -> Result<usize> {
        self.store.cardinality(&self.cache_key).await
    }

    pub async fn dirty_len(&self) -> Result<usize> {
        self.store.cardinality(&self.dirty_key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryCacheStore;

    fn create_index() -> CacheIndex {
        CacheIndex::new(Arc::new(MemoryCacheStore::default()), "cache", "dirty")
    }

    fn key(addr: u64) -> CuboidKey {
        CuboidKey::new("p", "c", 0, addr, 0)
    }

    #[tokio::test]
    async fn test_register_and_missing() {
        let index = create_index();
        assert!(!index.contains(&key(1)).await.unwrap());

        index.register(&[key(1), key(2)]).await.unwrap();
        assert!(index.contains(&key(1)).await.unwrap());
        assert_eq!(index.len().await.unwrap(), 2);

        let missing = index.missing(&[key(1), key(3), key(2)]).await.unwrap();
        assert_eq!(missing, vec![key(3)]);
    }

    #[tokio::test]
    async fn test_dirty_tracking() {
        let index = create_index();
        index.register(&[key(1), key(2)]).await.unwrap();
        index.mark_dirty(&[key(2)]).await.unwrap();

        assert_eq!(
            index.dirty_among(&[key(1), key(2)]).await.unwrap(),
            vec![false, true]
        );
        assert_eq!(index.dirty_keys(10).await.unwrap(), vec![key(2)]);

        index.clear_dirty(&[key(2)]).await.unwrap();
        assert_eq!(index.dirty_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_least_recent_and_remove() {
        let index = create_index();
        index.register(&[key(1)]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        index.register(&[key(2)]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        index.touch(&[key(1)]).await.unwrap();

        assert_eq!(index.least_recent(1).await.unwrap(), vec![key(2)]);

        index.mark_dirty(&[key(2)]).await.unwrap();
        index.remove(&[key(2)]).await.unwrap();
        assert_eq!(index.len().await.unwrap(), 1);
        assert_eq!(index.dirty_len().await.unwrap(), 0);
    }
}
