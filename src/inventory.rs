//! Inventory collaborator interface.
//!
//! This module defines the instance descriptors returned by the cloud
//! inventory, the filter handed to it, and the trait the inventory client
//! implements. An in-memory implementation is provided for embedding and
//! tests.

use std::{
    collections::{BTreeMap, BTreeSet},
    net::Ipv4Addr,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        PoisonError, RwLock,
    },
};

use async_trait::async_trait;

use crate::errors::ResolverError;
use crate::utils::{normalize_name, qualify_name};

/// Tag holding the instance hostname.
pub const NAME_TAG: &str = "Name";

/// Tag holding an explicit address override.
pub const ADDRESS_TAG: &str = "Address";

/// A compute instance as reported by the inventory.
///
/// Descriptors are immutable; a changed instance arrives as a new descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDescriptor {
    /// Unique instance id.
    pub id: String,

    /// Instance tags.
    pub tags: BTreeMap<String, String>,

    /// Primary (public) network address.
    pub primary_address: Option<Ipv4Addr>,

    /// Secondary (private) network address.
    pub secondary_address: Option<Ipv4Addr>,
}

impl InstanceDescriptor {
    /// Create a descriptor with no tags and no addresses.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tags: BTreeMap::new(),
            primary_address: None,
            secondary_address: None,
        }
    }

    /// Add a tag.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Set the primary network address.
    pub fn with_primary(mut self, addr: Ipv4Addr) -> Self {
        self.primary_address = Some(addr);
        self
    }

    /// Set the secondary network address.
    pub fn with_secondary(mut self, addr: Ipv4Addr) -> Self {
        self.secondary_address = Some(addr);
        self
    }

    /// The raw `Name` tag, if any.
    pub fn name_tag(&self) -> Option<&str> {
        self.tags.get(NAME_TAG).map(String::as_str)
    }

    /// The address from the `Address` tag, if present and parsable.
    pub fn tag_address(&self) -> Option<Ipv4Addr> {
        self.tags.get(ADDRESS_TAG).and_then(|v| v.trim().parse().ok())
    }

    /// The hostname this instance answers to within `zone`.
    pub fn hostname(&self, zone: &str, includes_domain: bool) -> Option<String> {
        qualify_name(self.name_tag()?, zone, includes_domain)
    }

    /// The instance id qualified with `zone`, e.g. `i-1234.example.com`.
    pub fn id_name(&self, zone: &str) -> Option<String> {
        qualify_name(&self.id, zone, false)
    }

    /// Whether a normalized name is this instance's hostname or id name.
    pub fn answers_to(&self, name: &str, filter: &InstanceFilter) -> bool {
        let hostname = self.hostname(&filter.zone, filter.name_includes_domain);
        hostname.as_deref() == Some(name) || self.id_name(&filter.zone).as_deref() == Some(name)
    }
}

/// A place an instance address can be taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSource {
    /// The `Address` tag.
    Tag,
    /// The primary network address.
    Primary,
    /// The secondary network address.
    Secondary,
}

impl AddressSource {
    /// Default selection order: tag, then primary, then secondary.
    pub const DEFAULT_ORDER: [AddressSource; 3] =
        [AddressSource::Tag, AddressSource::Primary, AddressSource::Secondary];

    fn pick(self, instance: &InstanceDescriptor) -> Option<Ipv4Addr> {
        match self {
            AddressSource::Tag => instance.tag_address(),
            AddressSource::Primary => instance.primary_address,
            AddressSource::Secondary => instance.secondary_address,
        }
    }
}

impl FromStr for AddressSource {
    type Err = ResolverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tag" | "address" => Ok(AddressSource::Tag),
            "primary" | "public" => Ok(AddressSource::Primary),
            "secondary" | "private" => Ok(AddressSource::Secondary),
            other => Err(ResolverError::Config(format!(
                "Unknown address source: {}",
                other
            ))),
        }
    }
}

/// Select the address to answer with for an instance.
///
/// The first source in `order` that yields an address wins. Returns `None`
/// when the instance has no usable address.
pub fn determine_address(instance: &InstanceDescriptor, order: &[AddressSource]) -> Option<Ipv4Addr> {
    order.iter().find_map(|source| source.pick(instance))
}

/// Filter applied to every inventory query.
///
/// The collaborator returns only running instances tagged within `zone` and
/// carrying every tag in `tags`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceFilter {
    /// Managed zone the `Name` tag must fall under.
    pub zone: String,

    /// Whether `Name` tags carry the full hostname.
    pub name_includes_domain: bool,

    /// Additional tag filters.
    pub tags: BTreeMap<String, String>,
}

impl InstanceFilter {
    /// Check a descriptor against the filter.
    pub fn matches(&self, instance: &InstanceDescriptor) -> bool {
        instance.hostname(&self.zone, self.name_includes_domain).is_some()
            && self
                .tags
                .iter()
                .all(|(k, v)| instance.tags.get(k) == Some(v))
    }
}

/// The cloud inventory service.
///
/// Both queries return only running instances that pass the filter. An empty
/// result is a valid outcome; errors surface as
/// [`ResolverError::InventoryUnavailable`].
#[async_trait]
pub trait Inventory: Send + Sync {
    /// Fetch instances answering to one hostname or id name.
    async fn instances_named(
        &self,
        filter: &InstanceFilter,
        hostname: &str,
    ) -> Result<Vec<InstanceDescriptor>, ResolverError>;

    /// Fetch every instance in the managed zone.
    async fn all_instances(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<InstanceDescriptor>, ResolverError>;
}

/// In-memory inventory holding the running instances.
///
/// Contents can be swapped at any time; an unavailable flag makes every
/// query fail, which simulates an outage of the real service.
#[derive(Debug, Default)]
pub struct StaticInventory {
    instances: RwLock<Vec<InstanceDescriptor>>,
    unavailable: AtomicBool,
}

impl StaticInventory {
    /// Create an inventory with the given running instances.
    pub fn new(instances: Vec<InstanceDescriptor>) -> Self {
        Self {
            instances: RwLock::new(instances),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Replace the running instances.
    pub fn set_instances(&self, instances: Vec<InstanceDescriptor>) {
        *self.instances.write().unwrap_or_else(PoisonError::into_inner) = instances;
    }

    /// Make every subsequent query fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn snapshot(&self, filter: &InstanceFilter) -> Result<Vec<InstanceDescriptor>, ResolverError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ResolverError::InventoryUnavailable(
                "inventory marked unavailable".into(),
            ));
        }
        let instances = self.instances.read().unwrap_or_else(PoisonError::into_inner);
        Ok(instances.iter().filter(|i| filter.matches(i)).cloned().collect())
    }
}

#[async_trait]
impl Inventory for StaticInventory {
    async fn instances_named(
        &self,
        filter: &InstanceFilter,
        hostname: &str,
    ) -> Result<Vec<InstanceDescriptor>, ResolverError> {
        let wanted = normalize_name(hostname);
        let mut found = self.snapshot(filter)?;
        found.retain(|i| i.answers_to(&wanted, filter));
        Ok(found)
    }

    async fn all_instances(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<InstanceDescriptor>, ResolverError> {
        self.snapshot(filter)
    }
}

/// Filter instances whose selected address is `addr`.
pub(crate) fn addressed_by(
    instances: Vec<InstanceDescriptor>,
    addr: Ipv4Addr,
    order: &[AddressSource],
) -> Vec<InstanceDescriptor> {
    instances
        .into_iter()
        .filter(|i| determine_address(i, order) == Some(addr))
        .collect()
}

/// Ids of a set of instances.
pub fn instance_ids<'a, I>(instances: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a InstanceDescriptor>,
{
    instances.into_iter().map(|i| i.id.clone()).collect()
}
