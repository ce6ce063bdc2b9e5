//! Configuration for the zone resolver.
//!
//! This module defines the configuration structure and methods to load
//! configuration from environment variables.

use std::{collections::BTreeMap, env, str::FromStr, time::Duration};
use log::info;

use crate::errors::ResolverError;
use crate::inventory::{AddressSource, InstanceFilter};
use crate::invalidator::{DrainType, DEFAULT_QUEUE_CAPACITY};
use crate::lookup::LookupType;
use crate::utils::fqdn;

/// Default managed zone.
pub const DEFAULT_ZONE: &str = "ec2.internal.";

/// Default TTL of answer records in seconds.
pub const DEFAULT_TTL: u32 = 300;

/// Default TTL handed to the host cache in seconds.
pub const DEFAULT_CACHE_TTL: u32 = 3600;

/// Default refresh interval in seconds.
pub const DEFAULT_REFRESH_INTERVAL: u64 = 300;

/// Default inventory region.
pub const DEFAULT_AWS_REGION: &str = "us-west-1";

/// Prefix of every environment variable read by [`ServerConfig::from_env`].
pub const ENV_PREFIX: &str = "EC2_DNS_";

/// How answers are handed back to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    /// Answers are cached by the host and revalidated in the background.
    Caching,
    /// Answers are authoritative and never cached by the host.
    Authoritative,
}

impl FromStr for ServerMode {
    type Err = ResolverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "caching" => Ok(ServerMode::Caching),
            "authoritative" => Ok(ServerMode::Authoritative),
            other => Err(ResolverError::Config(format!("Unknown server type: {}", other))),
        }
    }
}

/// Resolver configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Managed zone, fully qualified.
    pub zone: String,

    /// TTL of answer records.
    pub ttl: u32,

    /// TTL handed to the host cache.
    pub cache_ttl: u32,

    /// Interval between index rebuilds and drain passes.
    pub refresh_interval: Duration,

    /// Region of the inventory service.
    pub aws_region: String,

    /// Caching or authoritative answers.
    pub server_mode: ServerMode,

    /// Direct or cached inventory index.
    pub lookup_type: LookupType,

    /// Incremental or batch queue drain.
    pub drain_type: DrainType,

    /// Whether answered queries are revalidated.
    pub invalidation: bool,

    /// Maximum outstanding revalidation tasks.
    pub queue_capacity: usize,

    /// Whether `Name` tags carry the full hostname.
    pub tag_name_include_domain: bool,

    /// Address selection order.
    pub ip_order: Vec<AddressSource>,

    /// Reverse zones answered with PTR records.
    pub reverse_zones: Vec<String>,

    /// Sub-zones left to other modules.
    pub forwarded_zones: Vec<String>,

    /// Extra tag filters handed to the inventory.
    pub lookup_filters: BTreeMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            zone: DEFAULT_ZONE.into(),
            ttl: DEFAULT_TTL,
            cache_ttl: DEFAULT_CACHE_TTL,
            refresh_interval: Duration::from_secs(DEFAULT_REFRESH_INTERVAL),
            aws_region: DEFAULT_AWS_REGION.into(),
            server_mode: ServerMode::Caching,
            lookup_type: LookupType::Cache,
            drain_type: DrainType::Batch,
            invalidation: true,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            tag_name_include_domain: true,
            ip_order: AddressSource::DEFAULT_ORDER.to_vec(),
            reverse_zones: Vec::new(),
            forwarded_zones: Vec::new(),
            lookup_filters: BTreeMap::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// # Returns
    /// A `Result` containing either the loaded `ServerConfig` or a `ResolverError`.
    pub fn from_env() -> Result<Self, ResolverError> {
        Self::from_source(|key| env::var(format!("{}{}", ENV_PREFIX, key)).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// Keys are given without the `EC2_DNS_` prefix. Missing keys take their
    /// defaults; present but invalid values are errors.
    pub fn from_source<F>(var: F) -> Result<Self, ResolverError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let zone = var("ZONE").map(|z| fqdn(z.trim())).unwrap_or(defaults.zone);
        if zone == "." {
            return Err(ResolverError::Config("ZONE must not be empty".into()));
        }

        let refresh_interval = match var("REFRESH_INTERVAL") {
            Some(v) => Duration::from_secs(v.trim().parse()?),
            None => defaults.refresh_interval,
        };
        if refresh_interval.is_zero() {
            return Err(ResolverError::Config("REFRESH_INTERVAL must be positive".into()));
        }

        let config = Self {
            zone,
            ttl: parse_or(&var, "TTL", defaults.ttl)?,
            cache_ttl: parse_or(&var, "CACHE_TTL", defaults.cache_ttl)?,
            refresh_interval,
            aws_region: var("AWS_REGION").unwrap_or(defaults.aws_region),
            server_mode: parse_or(&var, "SERVER_TYPE", defaults.server_mode)?,
            lookup_type: parse_or(&var, "LOOKUP_TYPE", defaults.lookup_type)?,
            drain_type: parse_or(&var, "DRAIN_TYPE", defaults.drain_type)?,
            invalidation: flag_or(&var, "INVALIDATION", defaults.invalidation)?,
            queue_capacity: parse_or(&var, "QUEUE_CAPACITY", defaults.queue_capacity)?,
            tag_name_include_domain: flag_or(
                &var,
                "TAG_NAME_INCLUDE_DOMAIN",
                defaults.tag_name_include_domain,
            )?,
            ip_order: match var("IP_ORDER") {
                Some(v) => split_list(&v)
                    .map(|s| s.parse())
                    .collect::<Result<Vec<_>, _>>()?,
                None => defaults.ip_order,
            },
            reverse_zones: var("REVERSE_ZONES")
                .map(|v| split_list(&v).map(fqdn).collect())
                .unwrap_or_default(),
            forwarded_zones: var("FORWARDED_ZONES")
                .map(|v| split_list(&v).map(fqdn).collect())
                .unwrap_or_default(),
            lookup_filters: match var("LOOKUP_FILTERS") {
                Some(v) => parse_filters(&v)?,
                None => defaults.lookup_filters,
            },
        };

        if config.ip_order.is_empty() {
            return Err(ResolverError::Config("IP_ORDER must name at least one source".into()));
        }

        info!("Authoritative for zone {}", config.zone);
        info!("Inventory region {}", config.aws_region);
        Ok(config)
    }

    /// Inventory filter derived from this configuration.
    pub fn instance_filter(&self) -> InstanceFilter {
        InstanceFilter {
            zone: self.zone.clone(),
            name_includes_domain: self.tag_name_include_domain,
            tags: self.lookup_filters.clone(),
        }
    }
}

fn parse_or<F, T>(var: &F, key: &str, default: T) -> Result<T, ResolverError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    ResolverError: From<T::Err>,
{
    match var(key) {
        Some(v) => Ok(v.trim().parse()?),
        None => Ok(default),
    }
}

fn flag_or<F>(var: &F, key: &str, default: bool) -> Result<bool, ResolverError>
where
    F: Fn(&str) -> Option<String>,
{
    match var(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if v == "1" || v == "true" || v == "yes" => Ok(true),
        Some(v) if v == "0" || v == "false" || v == "no" => Ok(false),
        Some(v) => Err(ResolverError::Config(format!("Invalid {} flag: {}", key, v))),
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_filters(value: &str) -> Result<BTreeMap<String, String>, ResolverError> {
    split_list(value)
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .filter(|(k, _)| !k.is_empty())
                .ok_or_else(|| ResolverError::Config(format!("Invalid lookup filter: {}", pair)))
        })
        .collect()
}
