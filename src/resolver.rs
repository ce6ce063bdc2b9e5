//! The resolver context.
//!
//! [`ZoneResolver`] wires the inventory index, invalidation queue, response
//! state machine and refresher together from one [`ServerConfig`]. The owning
//! process builds it once, calls [`ZoneResolver::start`], feeds it module
//! events and calls [`ZoneResolver::stop`] during teardown.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};

use async_trait::async_trait;
use log::{debug, info};

use crate::cache::HostCache;
use crate::config::ServerConfig;
use crate::errors::ResolverError;
use crate::invalidator::{DrainType, Invalidator};
use crate::inventory::Inventory;
use crate::lookup::{build_lookup, InstanceLookup};
use crate::refresher::{RefreshJob, Refresher};
use crate::server::{ModuleEvent, ModuleState, QueryState, Server};

/// Work done on every refresher tick: rebuild the index and drain the queue.
pub struct RefreshCycle {
    lookup: Arc<dyn InstanceLookup>,
    invalidator: Option<Arc<Invalidator>>,
}

impl RefreshCycle {
    pub fn new(lookup: Arc<dyn InstanceLookup>, invalidator: Option<Arc<Invalidator>>) -> Self {
        Self { lookup, invalidator }
    }

    /// Whether a tick has anything to do.
    pub fn is_needed(&self) -> bool {
        self.lookup.is_cached() || self.invalidator.is_some()
    }
}

#[async_trait]
impl RefreshJob for RefreshCycle {
    async fn run(&self) -> Result<(), ResolverError> {
        match &self.invalidator {
            // Batch drain rebuilds the index itself.
            Some(invalidator) if invalidator.drain_type() == DrainType::Batch => {
                invalidator.drain().await?;
            }
            Some(invalidator) => {
                if self.lookup.is_cached() {
                    self.lookup.resolve().await?;
                }
                invalidator.drain().await?;
            }
            None if self.lookup.is_cached() => {
                self.lookup.resolve().await?;
            }
            None => {}
        }
        Ok(())
    }
}

/// Explicit context object for one managed zone.
pub struct ZoneResolver {
    config: ServerConfig,
    lookup: Arc<dyn InstanceLookup>,
    invalidator: Option<Arc<Invalidator>>,
    server: Server,
    refresher: Mutex<Option<Arc<Refresher>>>,
    stopped: AtomicBool,
}

impl ZoneResolver {
    /// Build the resolver from its configuration and collaborators.
    pub fn new(config: ServerConfig, inventory: Arc<dyn Inventory>, cache: Arc<dyn HostCache>) -> Self {
        let lookup = build_lookup(
            config.lookup_type,
            inventory,
            config.instance_filter(),
            config.ip_order.clone(),
        );

        let invalidator = config.invalidation.then(|| {
            Arc::new(Invalidator::new(
                lookup.clone(),
                cache.clone(),
                config.drain_type,
                config.queue_capacity,
            ))
        });

        let server = Server::new(&config, lookup.clone(), cache, invalidator.clone());

        Self {
            config,
            lookup,
            invalidator,
            server,
            refresher: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn lookup(&self) -> &Arc<dyn InstanceLookup> {
        &self.lookup
    }

    pub fn invalidator(&self) -> Option<&Arc<Invalidator>> {
        self.invalidator.as_ref()
    }

    /// Warm the index and start the background refresher.
    ///
    /// Must be called from within a tokio runtime. Inventory errors during
    /// warm-up are returned; the caller decides whether to serve anyway.
    pub async fn start(&self) -> Result<(), ResolverError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ResolverError::Shutdown);
        }

        info!(
            "Starting resolver for {} ({:?} lookup, invalidation {})",
            self.config.zone,
            self.config.lookup_type,
            if self.config.invalidation { "on" } else { "off" }
        );

        if self.lookup.is_cached() {
            self.lookup.resolve().await?;
        }

        let mut refresher = self.refresher.lock().unwrap_or_else(PoisonError::into_inner);
        // stop() may have run while the index was warming up.
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ResolverError::Shutdown);
        }

        let cycle = RefreshCycle::new(self.lookup.clone(), self.invalidator.clone());
        if !cycle.is_needed() {
            debug!("Nothing to refresh in the background");
            return Ok(());
        }
        if refresher.is_none() {
            *refresher = Some(Arc::new(Refresher::spawn(
                self.config.refresh_interval,
                Arc::new(cycle),
            )));
        }
        Ok(())
    }

    /// Handle one module event for a query.
    pub async fn operate(&self, event: ModuleEvent, qstate: &mut QueryState) -> ModuleState {
        self.server.operate(event, qstate).await
    }

    /// Whether the background refresher is running.
    pub fn is_running(&self) -> bool {
        self.refresher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(false, |r| r.is_running())
    }

    /// Stop the background refresher and wait for it to exit.
    ///
    /// Idempotent, also when called concurrently. A drain pass in progress
    /// completes before any caller returns. A `start()` still warming up
    /// fails with [`ResolverError::Shutdown`] instead of spawning.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let refresher = self
            .refresher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(refresher) = refresher {
            refresher.stop().await;
        }
    }
}
