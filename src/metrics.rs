//! Metrics recording helpers.
//!
//! Thin wrappers over the `metrics` facade. Nothing is exported unless the
//! owning process installs a recorder.

use metrics::{counter, gauge};

/// Outcome of a forwarded query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    Success,
    NxDomain,
    Error,
    Passthrough,
}

impl QueryOutcome {
    fn as_str(self) -> &'static str {
        match self {
            QueryOutcome::Success => "success",
            QueryOutcome::NxDomain => "nxdomain",
            QueryOutcome::Error => "error",
            QueryOutcome::Passthrough => "passthrough",
        }
    }
}

pub fn record_query(outcome: QueryOutcome) {
    counter!("ec2dns_queries_total", 1, "outcome" => outcome.as_str());
}

pub fn record_queue_full() {
    counter!("ec2dns_invalidation_queue_full_total", 1);
}

pub fn record_host_cache_failure(operation: &'static str) {
    counter!("ec2dns_host_cache_failures_total", 1, "operation" => operation);
}

pub fn record_drain(invalidated: usize, recycled: usize) {
    counter!("ec2dns_invalidations_total", invalidated as u64);
    counter!("ec2dns_recycled_total", recycled as u64);
}

pub fn record_queue_depth(depth: usize) {
    gauge!("ec2dns_invalidation_queue_depth", depth as f64);
}

pub fn record_snapshot(names: usize) {
    gauge!("ec2dns_snapshot_names", names as f64);
}
