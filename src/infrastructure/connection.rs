//! Connection management for remote cluster access.
//!
//! Two transports are pooled here: SSH sessions to individual cluster nodes
//! (key-partitioned, lazily grown) and database handles against the cluster's
//! SQL endpoint (single shared target, eagerly pre-filled). Both pools hand
//! out exclusively-owned connections, probe liveness before reuse, and evict
//! idle entries. `ConnectionManager` is the facade handlers are expected to
//! go through.

pub mod db;
pub mod db_pool;
pub mod manager;
pub mod ssh;
pub mod ssh_pool;

use std::time::Duration;

/// Errors surfaced by `acquire` on either pool.
///
/// Health-check failures are never surfaced here; a dead pooled connection is
/// silently replaced or discarded inside the pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("connection pool exhausted (max={max_size}, waited {timeout:?})")]
    PoolExhausted { max_size: usize, timeout: Duration },

    #[error("failed to create connection to {target}: {reason}")]
    ConnectionCreateFailed { target: String, reason: String },

    #[error("connection pool is closed")]
    PoolClosed,
}

/// Read-only per-key snapshot returned by `stats()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct KeyStats {
    pub in_use: usize,
    pub idle: usize,
}
