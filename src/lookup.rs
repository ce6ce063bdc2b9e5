//! Inventory index.
//!
//! Maps hostnames, instance-id names and reverse-zone names to the instances
//! behind them.
//! Two strategies share the [`InstanceLookup`] contract: [`DirectLookup`]
//! asks the inventory on every lookup, [`CacheLookup`] answers from a
//! snapshot rebuilt once per refresh interval.

use std::{
    collections::{BTreeSet, HashMap},
    str::FromStr,
    sync::Arc,
};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use log::{debug, info};

use crate::errors::ResolverError;
use crate::inventory::{
    addressed_by, determine_address, AddressSource, InstanceDescriptor, InstanceFilter, Inventory,
};
use crate::metrics;
use crate::utils::{normalize_name, parse_reverse_name, reverse_name};

/// Instances answering to one name.
pub type Instances = Vec<Arc<InstanceDescriptor>>;

/// A complete name to instances mapping as of one refresh.
///
/// Keys are normalized names. Every entry is non-empty and holds each
/// instance id at most once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InventorySnapshot {
    entries: HashMap<String, Instances>,
}

impl InventorySnapshot {
    /// Build a snapshot from a flat inventory listing.
    ///
    /// Each instance is indexed under its hostname, its id qualified with the
    /// zone and the reverse name of its selected address.
    pub fn build(
        instances: Vec<InstanceDescriptor>,
        filter: &InstanceFilter,
        order: &[AddressSource],
    ) -> Self {
        let mut entries: HashMap<String, Instances> = HashMap::new();

        for instance in instances.into_iter().map(Arc::new) {
            let Some(hostname) = instance.hostname(&filter.zone, filter.name_includes_domain) else {
                continue;
            };

            let mut keys = vec![hostname];
            keys.extend(instance.id_name(&filter.zone));
            if let Some(addr) = determine_address(&instance, order) {
                keys.push(reverse_name(addr));
            }

            for key in keys {
                let entry = entries.entry(key).or_default();
                if !entry.iter().any(|i| i.id == instance.id) {
                    entry.push(instance.clone());
                }
            }
        }

        Self { entries }
    }

    /// Instances for a name, empty if absent.
    pub fn get(&self, name: &str) -> Instances {
        self.entries
            .get(&normalize_name(name))
            .cloned()
            .unwrap_or_default()
    }

    /// Whether the snapshot has an entry for a name.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&normalize_name(name))
    }

    /// Drop the entry for one name.
    pub fn remove(&mut self, name: &str) -> Option<Instances> {
        self.entries.remove(&normalize_name(name))
    }

    /// Iterate over all names and their instances.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Instances)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Which index strategy to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupType {
    /// One inventory call per lookup.
    Direct,
    /// One inventory call per refresh interval.
    Cache,
}

impl FromStr for LookupType {
    type Err = ResolverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" | "single" => Ok(LookupType::Direct),
            "cache" | "batch" => Ok(LookupType::Cache),
            other => Err(ResolverError::Config(format!("Unknown lookup type: {}", other))),
        }
    }
}

/// Contract shared by both index strategies.
///
/// Inventory errors propagate unchanged; callers decide whether to retry or
/// fail the query.
#[async_trait]
pub trait InstanceLookup: Send + Sync {
    /// Rebuild the full mapping from the inventory.
    async fn resolve(&self) -> Result<Arc<InventorySnapshot>, ResolverError>;

    /// Instances currently answering to `name`.
    async fn lookup(&self, name: &str) -> Result<Instances, ResolverError>;

    /// Drop one cached name, or everything when `name` is `None`.
    fn invalidate(&self, _name: Option<&str>) {}

    /// Whether lookups are served from a periodically rebuilt snapshot.
    fn is_cached(&self) -> bool;
}

/// Build the configured index strategy.
pub fn build_lookup(
    lookup_type: LookupType,
    inventory: Arc<dyn Inventory>,
    filter: InstanceFilter,
    order: Vec<AddressSource>,
) -> Arc<dyn InstanceLookup> {
    match lookup_type {
        LookupType::Direct => Arc::new(DirectLookup::new(inventory, filter, order)),
        LookupType::Cache => Arc::new(CacheLookup::new(inventory, filter, order)),
    }
}

/// Index that queries the inventory on every lookup.
pub struct DirectLookup {
    inventory: Arc<dyn Inventory>,
    filter: InstanceFilter,
    order: Vec<AddressSource>,
}

impl DirectLookup {
    pub fn new(inventory: Arc<dyn Inventory>, filter: InstanceFilter, order: Vec<AddressSource>) -> Self {
        Self {
            inventory,
            filter,
            order,
        }
    }
}

#[async_trait]
impl InstanceLookup for DirectLookup {
    async fn resolve(&self) -> Result<Arc<InventorySnapshot>, ResolverError> {
        let instances = self.inventory.all_instances(&self.filter).await?;
        Ok(Arc::new(InventorySnapshot::build(instances, &self.filter, &self.order)))
    }

    async fn lookup(&self, name: &str) -> Result<Instances, ResolverError> {
        let found = match parse_reverse_name(name) {
            Some(addr) => {
                let all = self.inventory.all_instances(&self.filter).await?;
                addressed_by(all, addr, &self.order)
            }
            None => self.inventory.instances_named(&self.filter, name).await?,
        };

        let mut seen = BTreeSet::new();
        Ok(found
            .into_iter()
            .filter(|i| seen.insert(i.id.clone()))
            .map(Arc::new)
            .collect())
    }

    fn is_cached(&self) -> bool {
        false
    }
}

/// Index answering from a snapshot swapped in wholesale on every rebuild.
pub struct CacheLookup {
    inventory: Arc<dyn Inventory>,
    filter: InstanceFilter,
    order: Vec<AddressSource>,
    snapshot: ArcSwap<InventorySnapshot>,
}

impl CacheLookup {
    pub fn new(inventory: Arc<dyn Inventory>, filter: InstanceFilter, order: Vec<AddressSource>) -> Self {
        Self {
            inventory,
            filter,
            order,
            snapshot: ArcSwap::from_pointee(InventorySnapshot::default()),
        }
    }

    /// The snapshot lookups are currently served from.
    pub fn snapshot(&self) -> Arc<InventorySnapshot> {
        self.snapshot.load_full()
    }
}

#[async_trait]
impl InstanceLookup for CacheLookup {
    async fn resolve(&self) -> Result<Arc<InventorySnapshot>, ResolverError> {
        let instances = self.inventory.all_instances(&self.filter).await?;
        let snapshot = Arc::new(InventorySnapshot::build(instances, &self.filter, &self.order));

        self.snapshot.store(snapshot.clone());
        metrics::record_snapshot(snapshot.len());
        info!("Inventory index rebuilt with {} names", snapshot.len());
        Ok(snapshot)
    }

    async fn lookup(&self, name: &str) -> Result<Instances, ResolverError> {
        Ok(self.snapshot.load().get(name))
    }

    fn invalidate(&self, name: Option<&str>) {
        match name {
            Some(name) => {
                debug!("Dropping {} from inventory index", name);
                self.snapshot.rcu(|current| {
                    let mut next = InventorySnapshot::clone(current);
                    next.remove(name);
                    next
                });
            }
            None => {
                debug!("Dropping inventory index");
                self.snapshot.store(Arc::new(InventorySnapshot::default()));
            }
        }
    }

    fn is_cached(&self) -> bool {
        true
    }
}
