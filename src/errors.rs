//! Error types for the zone resolver.
//!
//! This module defines the error type shared by the inventory index, the
//! invalidation queue and the response state machine.

use thiserror::Error;

/// Represents errors that can occur while resolving or revalidating answers.
#[derive(Error, Debug)]
pub enum ResolverError {
    /// The inventory collaborator could not be queried.
    #[error("Inventory unavailable: {0}")]
    InventoryUnavailable(String),

    /// The invalidation queue is at capacity.
    #[error("Invalidation queue is full")]
    QueueFull,

    /// No request history to pop.
    #[error("Request history is empty")]
    Empty,

    /// The host cache refused a store or invalidate.
    #[error("Host cache error: {0}")]
    HostCache(String),

    /// Configuration errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Integer parsing errors.
    #[error("Parse error: {0}")]
    Parse(#[from] std::num::ParseIntError),

    /// The component has been stopped.
    #[error("Shutdown signal received")]
    Shutdown,
}
