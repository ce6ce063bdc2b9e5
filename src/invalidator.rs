//! Cache invalidation queue.
//!
//! Every answered query leaves a [`RevalidationTask`] recording the instance
//! ids it was built from. A drain pass compares each task against the current
//! inventory and tells the host cache to drop answers whose instances changed.
//! Tasks that still match go back on the queue with a fresh timestamp.

use std::{
    cmp::Ordering,
    collections::{BTreeSet, BinaryHeap},
    mem,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use log::{debug, info, warn};
use tokio::time::Instant;

use crate::cache::HostCache;
use crate::errors::ResolverError;
use crate::inventory::{instance_ids, InstanceDescriptor};
use crate::lookup::InstanceLookup;
use crate::message::QueryKey;
use crate::metrics;

/// Default number of outstanding revalidation tasks.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// A pending freshness check for one cached answer.
#[derive(Debug, Clone)]
pub struct RevalidationTask {
    /// When the task was (re-)enqueued.
    pub enqueued: Instant,

    /// Tie-breaker for tasks enqueued at the same instant.
    pub sequence: u64,

    /// Identity of the cached answer.
    pub query: QueryKey,

    /// Instance ids the answer was built from.
    pub instance_ids: BTreeSet<String>,
}

// Oldest first out of a max-heap.
impl Ord for RevalidationTask {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .enqueued
            .cmp(&self.enqueued)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for RevalidationTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for RevalidationTask {
    fn eq(&self, other: &Self) -> bool {
        self.enqueued == other.enqueued && self.sequence == other.sequence
    }
}

impl Eq for RevalidationTask {}

/// How the queue is drained on each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainType {
    /// Examine exactly one task per tick.
    Incremental,
    /// Rebuild the index, then examine every task.
    Batch,
}

impl FromStr for DrainType {
    type Err = ResolverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "incremental" => Ok(DrainType::Incremental),
            "batch" => Ok(DrainType::Batch),
            other => Err(ResolverError::Config(format!("Unknown drain type: {}", other))),
        }
    }
}

/// Counts from one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub examined: usize,
    pub invalidated: usize,
    pub recycled: usize,
}

#[derive(Debug, Default)]
struct PendingTasks {
    tasks: BinaryHeap<RevalidationTask>,
    in_flight: usize,
    next_sequence: u64,
}

impl PendingTasks {
    fn next_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        sequence
    }

    fn recycle(&mut self, mut task: RevalidationTask, now: Instant) {
        task.enqueued = now;
        task.sequence = self.next_sequence();
        self.tasks.push(task);
    }
}

/// Bounded, oldest-first queue of revalidation tasks.
///
/// Producers only take the lock long enough to push. Tasks taken by a drain
/// pass still count against the capacity until the pass hands them back.
#[derive(Debug)]
pub struct InvalidationQueue {
    capacity: usize,
    pending: Mutex<PendingTasks>,
}

impl InvalidationQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pending: Mutex::new(PendingTasks::default()),
        }
    }

    fn pending(&self) -> MutexGuard<'_, PendingTasks> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the instances a just-answered query was built from.
    ///
    /// Never blocks on a drain pass. Fails with
    /// [`ResolverError::QueueFull`] when the queue is at capacity.
    pub fn request(&self, query: QueryKey, instances: &[Arc<InstanceDescriptor>]) -> Result<(), ResolverError> {
        let instance_ids = instance_ids(instances.iter().map(|i| i.as_ref()));
        let mut pending = self.pending();
        if pending.tasks.len() + pending.in_flight >= self.capacity {
            return Err(ResolverError::QueueFull);
        }
        let sequence = pending.next_sequence();
        pending.tasks.push(RevalidationTask {
            enqueued: Instant::now(),
            sequence,
            query,
            instance_ids,
        });
        Ok(())
    }

    /// Number of outstanding tasks, including ones held by a drain pass.
    pub fn len(&self) -> usize {
        let pending = self.pending();
        pending.tasks.len() + pending.in_flight
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies of the queued tasks, oldest first.
    pub fn tasks(&self) -> Vec<RevalidationTask> {
        let mut tasks = self.pending().tasks.clone().into_sorted_vec();
        tasks.reverse();
        tasks
    }

    fn take_one(&self) -> Option<RevalidationTask> {
        let mut pending = self.pending();
        let task = pending.tasks.pop()?;
        pending.in_flight += 1;
        Some(task)
    }

    /// Take every queued task, oldest first.
    fn take_all(&self) -> Vec<RevalidationTask> {
        let mut pending = self.pending();
        let mut tasks = mem::take(&mut pending.tasks).into_sorted_vec();
        tasks.reverse();
        pending.in_flight += tasks.len();
        tasks
    }

    /// Return tasks taken by a drain pass.
    ///
    /// `refreshed` tasks get a new timestamp; `unchanged` keep their
    /// position. `settled` is the number of taken tasks that were dropped.
    fn hand_back(&self, refreshed: Vec<RevalidationTask>, unchanged: Vec<RevalidationTask>, settled: usize) {
        let now = Instant::now();
        let mut pending = self.pending();
        pending.in_flight = pending
            .in_flight
            .saturating_sub(refreshed.len() + unchanged.len() + settled);
        for task in refreshed {
            pending.recycle(task, now);
        }
        pending.tasks.extend(unchanged);
    }
}

/// Drains the invalidation queue against the inventory index.
///
/// Single consumer: concurrent drain calls are serialized, while producers
/// keep enqueueing through [`Invalidator::request`].
pub struct Invalidator {
    queue: InvalidationQueue,
    lookup: Arc<dyn InstanceLookup>,
    cache: Arc<dyn HostCache>,
    drain_type: DrainType,
    drain_lock: tokio::sync::Mutex<()>,
}

impl Invalidator {
    pub fn new(
        lookup: Arc<dyn InstanceLookup>,
        cache: Arc<dyn HostCache>,
        drain_type: DrainType,
        capacity: usize,
    ) -> Self {
        Self {
            queue: InvalidationQueue::new(capacity),
            lookup,
            cache,
            drain_type,
            drain_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn drain_type(&self) -> DrainType {
        self.drain_type
    }

    pub fn queue(&self) -> &InvalidationQueue {
        &self.queue
    }

    /// Enqueue a revalidation task for an answered query.
    pub fn request(&self, query: QueryKey, instances: &[Arc<InstanceDescriptor>]) -> Result<(), ResolverError> {
        self.queue.request(query, instances)
    }

    /// Run one drain pass with the configured strategy.
    pub async fn drain(&self) -> Result<DrainReport, ResolverError> {
        let _guard = self.drain_lock.lock().await;
        let report = match self.drain_type {
            DrainType::Incremental => self.drain_one().await?,
            DrainType::Batch => self.drain_all().await?,
        };
        metrics::record_drain(report.invalidated, report.recycled);
        metrics::record_queue_depth(self.queue.len());
        Ok(report)
    }

    async fn drain_one(&self) -> Result<DrainReport, ResolverError> {
        let Some(task) = self.queue.take_one() else {
            return Ok(DrainReport::default());
        };

        let current = match self.lookup.lookup(task.query.name()).await {
            Ok(current) => current,
            Err(e) => {
                self.queue.hand_back(Vec::new(), vec![task], 0);
                return Err(e);
            }
        };

        let mut report = DrainReport {
            examined: 1,
            ..DrainReport::default()
        };
        if instance_ids(current.iter().map(|i| i.as_ref())) != task.instance_ids {
            self.invalidate(&task);
            self.queue.hand_back(Vec::new(), Vec::new(), 1);
            report.invalidated = 1;
        } else {
            self.queue.hand_back(vec![task], Vec::new(), 0);
            report.recycled = 1;
        }
        debug!("Incremental drain: {:?}", report);
        Ok(report)
    }

    async fn drain_all(&self) -> Result<DrainReport, ResolverError> {
        self.lookup.resolve().await?;

        let tasks = self.queue.take_all();
        if tasks.is_empty() {
            return Ok(DrainReport::default());
        }

        let mut report = DrainReport::default();
        let mut matching = Vec::new();
        let mut failed = Vec::new();

        for task in tasks {
            report.examined += 1;
            let current = match self.lookup.lookup(task.query.name()).await {
                Ok(current) => current,
                Err(e) => {
                    warn!("Lookup for {} failed during drain: {}", task.query, e);
                    failed.push(task);
                    continue;
                }
            };

            if instance_ids(current.iter().map(|i| i.as_ref())) != task.instance_ids {
                self.invalidate(&task);
                report.invalidated += 1;
            } else {
                matching.push(task);
            }
        }

        report.recycled = matching.len() + failed.len();
        self.queue.hand_back(matching, failed, report.invalidated);
        info!(
            "Batch drain examined {} tasks: {} invalidated, {} recycled",
            report.examined, report.invalidated, report.recycled
        );
        Ok(report)
    }

    fn invalidate(&self, task: &RevalidationTask) {
        debug!("Instances behind {} changed, invalidating", task.query);
        if let Err(e) = self.cache.invalidate(&task.query) {
            warn!("Unable to invalidate {} in host cache: {}", task.query, e);
            metrics::record_host_cache_failure("invalidate");
        }
    }
}
