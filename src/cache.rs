//! Host answer cache.
//!
//! This module defines the interface to the host's answer cache and provides
//! an in-process LRU implementation with per-entry expiry.

use std::{
    num::NonZeroUsize,
    sync::{Mutex, MutexGuard, PoisonError},
};
use log::debug;
use lru::LruCache;
use tokio::time::Instant;

use crate::errors::ResolverError;
use crate::message::{Answer, QueryKey};

/// Default number of answers kept by [`AnswerCache`].
pub const DEFAULT_CACHE_CAPACITY: usize = 4096;

/// The host's answer cache.
///
/// Both operations are best effort: callers log failures and carry on.
pub trait HostCache: Send + Sync {
    /// Store an answer under its query identity for `ttl` seconds.
    fn store(&self, query: &QueryKey, answer: &Answer, ttl: u32) -> Result<(), ResolverError>;

    /// Drop the answer stored under a query identity.
    fn invalidate(&self, query: &QueryKey) -> Result<(), ResolverError>;
}

/// An entry in the answer cache.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The cached answer.
    pub answer: Answer,

    /// When this entry was added to the cache.
    pub inserted: Instant,

    /// Time-to-live in seconds.
    pub ttl: u64,
}

impl CacheEntry {
    fn is_fresh(&self) -> bool {
        self.inserted.elapsed().as_secs() < self.ttl
    }
}

/// In-process answer cache bounded by entry count.
#[derive(Debug)]
pub struct AnswerCache {
    entries: Mutex<LruCache<QueryKey, CacheEntry>>,
}

impl AnswerCache {
    /// Create a cache holding at most `capacity` answers.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn entries(&self) -> MutexGuard<'_, LruCache<QueryKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a cached answer.
    ///
    /// # Returns
    /// The answer if present and not expired.
    pub fn get(&self, query: &QueryKey) -> Option<Answer> {
        let mut cache = self.entries();
        let entry = cache.get(query).cloned()?;
        if entry.is_fresh() {
            Some(entry.answer)
        } else {
            cache.pop(query);
            None
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove expired entries from the cache.
    pub fn cleanup(&self) {
        let mut cache = self.entries();
        let expired: Vec<QueryKey> = cache
            .iter()
            .filter(|(_, entry)| !entry.is_fresh())
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            cache.pop(key);
        }
        debug!("Cache cleanup removed {} entries", expired.len());
    }
}

impl Default for AnswerCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl HostCache for AnswerCache {
    fn store(&self, query: &QueryKey, answer: &Answer, ttl: u32) -> Result<(), ResolverError> {
        self.entries().put(
            query.clone(),
            CacheEntry {
                answer: answer.clone(),
                inserted: Instant::now(),
                ttl: u64::from(ttl),
            },
        );
        Ok(())
    }

    fn invalidate(&self, query: &QueryKey) -> Result<(), ResolverError> {
        self.entries().pop(query);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Rcode, RecordType};
    use std::time::Duration;

    fn answer() -> Answer {
        Answer::new(Rcode::NxDomain, false)
    }

    #[tokio::test]
    async fn store_get_invalidate() {
        let cache = AnswerCache::new(8);
        let key = QueryKey::new("host1.example.com.", RecordType::A);

        assert!(cache.get(&key).is_none());
        cache.store(&key, &answer(), 60).unwrap();
        assert_eq!(cache.get(&key), Some(answer()));

        cache.invalidate(&key).unwrap();
        assert!(cache.get(&key).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let cache = AnswerCache::new(8);
        let key = QueryKey::new("host1.example.com.", RecordType::A);
        let other = QueryKey::new("host2.example.com.", RecordType::A);
        cache.store(&key, &answer(), 10).unwrap();
        cache.store(&other, &answer(), 100).unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.get(&key).is_none());

        cache.cleanup();
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&other).is_some());
    }

    #[tokio::test]
    async fn capacity_evicts_least_recent() {
        let cache = AnswerCache::new(1);
        let first = QueryKey::new("host1.example.com.", RecordType::A);
        let second = QueryKey::new("host2.example.com.", RecordType::A);
        cache.store(&first, &answer(), 60).unwrap();
        cache.store(&second, &answer(), 60).unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&first).is_none());
    }
}
