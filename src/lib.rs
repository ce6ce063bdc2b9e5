//! EC2 Zone Resolver Library
//!
//! This library answers address queries for a managed DNS zone from an
//! inventory of cloud compute instances. It keeps a periodically refreshed
//! name to instance index and revalidates answered queries in the
//! background, telling the host's answer cache to drop any answer whose
//! instances have since changed.

pub mod cache;
pub mod config;
pub mod errors;
pub mod inventory;
pub mod invalidator;
pub mod lookup;
pub mod message;
pub mod metrics;
pub mod refresher;
pub mod resolver;
pub mod server;
pub mod tracker;
pub mod utils;

// Re-export commonly used items
pub use cache::{AnswerCache, HostCache};
pub use config::ServerConfig;
pub use errors::ResolverError;
pub use inventory::{InstanceDescriptor, Inventory, StaticInventory};
pub use resolver::ZoneResolver;
pub use server::{ModuleEvent, ModuleState, QueryState};
pub use tracker::RequestPriorityTracker;
