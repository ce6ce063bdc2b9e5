//! Request priority tracker.
//!
//! Scores keys by how often they were requested blended with how long ago
//! they were first requested, and pops the highest-scoring key. Usable on its
//! own for ordering revalidation or eviction work.

use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use crate::errors::ResolverError;

/// Request history of one key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestHistory {
    pub first_request: Instant,
    pub requests: u64,
}

/// Frequency and age based priority over keys.
///
/// `priority = requests + ratio * age_seconds`, so `ratio` converts elapsed
/// time into request-equivalents: with a ratio of 0.5, two seconds of age
/// weigh as much as one request.
#[derive(Debug)]
pub struct RequestPriorityTracker<K> {
    ratio: f64,
    history: Mutex<HashMap<K, RequestHistory>>,
}

impl<K> RequestPriorityTracker<K>
where
    K: Eq + Hash + Ord + Clone,
{
    pub fn new(ratio: f64) -> Self {
        Self {
            ratio,
            history: Mutex::new(HashMap::new()),
        }
    }

    fn history(&self) -> MutexGuard<'_, HashMap<K, RequestHistory>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one request for `key`.
    pub fn mark(&self, key: K) {
        self.history()
            .entry(key)
            .or_insert_with(|| RequestHistory {
                first_request: Instant::now(),
                requests: 0,
            })
            .requests += 1;
    }

    /// Priority of a history entry as of `now`.
    pub fn priority(&self, history: &RequestHistory, now: Instant) -> f64 {
        let age = now.saturating_duration_since(history.first_request).as_secs_f64();
        score(history.requests, age, self.ratio)
    }

    /// Remove and return the key with the highest priority.
    pub fn pop(&self) -> Result<K, ResolverError> {
        self.pop_at(Instant::now())
    }

    /// Like [`pop`](Self::pop), scoring as of `now`.
    ///
    /// Ties go to the greater key.
    pub fn pop_at(&self, now: Instant) -> Result<K, ResolverError> {
        let mut history = self.history();
        let key = history
            .iter()
            .map(|(key, entry)| (self.priority(entry, now), key))
            .max_by(|(a, ka), (b, kb)| a.total_cmp(b).then_with(|| ka.cmp(kb)))
            .map(|(_, key)| key.clone())
            .ok_or(ResolverError::Empty)?;
        history.remove(&key);
        Ok(key)
    }

    pub fn get(&self, key: &K) -> Option<RequestHistory> {
        self.history().get(key).copied()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.history().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.history().len()
    }

    pub fn is_empty(&self) -> bool {
        self.history().is_empty()
    }
}

/// Blend a request count with an age in seconds.
pub fn score(requests: u64, age_seconds: f64, ratio: f64) -> f64 {
    requests as f64 + age_seconds * ratio
}
