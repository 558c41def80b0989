//! Facade over the SSH and DB pools.
//!
//! Handlers go through this instead of the pools directly: it owns both pool
//! instances, attaches leased SSH sessions to node records in bulk before a
//! run, and offers the run-wide cleanup entry points.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use super::db_pool::{DbConnectionPool, DbLease};
use super::ssh::{NodeConfig, NodeKey};
use super::ssh_pool::{SshConnectionPool, SshLease};
use super::{KeyStats, PoolError};

/// A cluster node record for one diagnostic run. `connection` is populated
/// only by `ConnectionManager::setup_nodes`; tasks treat `None` as "node not
/// reachable".
pub struct Node {
    pub config: NodeConfig,
    pub connection: Option<SshLease>,
}

/// Combined pool snapshot, keyed by node for SSH plus the single DB entry.
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub ssh: HashMap<NodeKey, KeyStats>,
    pub db: KeyStats,
}

pub struct ConnectionManager {
    ssh_pool: Arc<SshConnectionPool>,
    db_pool: Arc<DbConnectionPool>,
}

impl ConnectionManager {
    pub fn new(ssh_pool: Arc<SshConnectionPool>, db_pool: Arc<DbConnectionPool>) -> Self {
        Self { ssh_pool, db_pool }
    }

    pub fn ssh_pool(&self) -> &Arc<SshConnectionPool> {
        &self.ssh_pool
    }

    pub fn db_pool(&self) -> &Arc<DbConnectionPool> {
        &self.db_pool
    }

    pub async fn acquire_ssh(&self, node: &NodeConfig) -> Result<SshLease, PoolError> {
        self.ssh_pool.acquire(node).await
    }

    pub async fn release_ssh(&self, lease: SshLease) {
        self.ssh_pool.release(lease).await;
    }

    pub async fn acquire_db(&self) -> Result<DbLease, PoolError> {
        self.db_pool.acquire().await
    }

    pub async fn release_db(&self, lease: DbLease) {
        self.db_pool.release(lease).await;
    }

    /// Lease one SSH session per node and attach it to the returned records.
    /// A node whose connection fails stays in the list with `connection:
    /// None`; the failure is logged, never fatal for the run.
    pub async fn setup_nodes(&self, nodes: &[NodeConfig]) -> Vec<Node> {
        let mut out = Vec::with_capacity(nodes.len());
        for config in nodes {
            let connection = match self.ssh_pool.acquire(config).await {
                Ok(lease) => Some(lease),
                Err(e) => {
                    warn!("failed to set up ssh connection for {}: {e}", config.key());
                    None
                }
            };
            out.push(Node {
                config: config.clone(),
                connection,
            });
        }
        out
    }

    /// Return every connection still attached to the given node records.
    pub async fn teardown_nodes(&self, nodes: Vec<Node>) {
        for node in nodes {
            if let Some(lease) = node.connection {
                self.ssh_pool.release(lease).await;
            }
        }
    }

    pub async fn cleanup_idle(&self) {
        self.ssh_pool.evict_idle().await;
    }

    pub async fn close_all(&self) {
        self.ssh_pool.close_all().await;
        self.db_pool.close_all().await;
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            ssh: self.ssh_pool.stats(),
            db: self.db_pool.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    use super::super::db_pool::test_support::{FakeDbFactory, SharedDbFactory};
    use super::super::db_pool::DbPoolConfig;
    use super::super::ssh_pool::test_support::{node, FakeFactory, SharedFactory};
    use super::super::ssh_pool::SshPoolConfig;
    use super::*;

    fn manager() -> (ConnectionManager, Arc<FakeFactory>) {
        let ssh_factory = Arc::new(FakeFactory::default());
        let ssh_pool = Arc::new(SshConnectionPool::new(
            SshPoolConfig::default(),
            Box::new(SharedFactory(ssh_factory.clone())),
        ));
        let db_pool = Arc::new(DbConnectionPool::new(
            DbPoolConfig {
                max_size: 2,
                acquire_timeout: Duration::from_secs(1),
            },
            Box::new(SharedDbFactory(Arc::new(FakeDbFactory::default()))),
        ));
        (ConnectionManager::new(ssh_pool, db_pool), ssh_factory)
    }

    #[tokio::test]
    async fn setup_nodes_attaches_connections_and_keeps_failures() {
        let (manager, factory) = manager();
        let nodes = vec![node("10.0.0.1"), node("10.0.0.2")];

        let records = manager.setup_nodes(&nodes).await;
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|n| n.connection.is_some()));

        factory.fail.store(true, Ordering::SeqCst);
        let records_failed = manager.setup_nodes(&[node("10.0.0.3")]).await;
        assert_eq!(records_failed.len(), 1);
        assert!(records_failed[0].connection.is_none());

        manager.teardown_nodes(records).await;
        let stats = manager.stats();
        assert_eq!(stats.ssh[&node("10.0.0.1").key()].idle, 1);
        assert_eq!(stats.ssh[&node("10.0.0.1").key()].in_use, 0);
    }

    #[tokio::test]
    async fn close_all_drains_both_pools() {
        let (manager, _) = manager();
        let records = manager.setup_nodes(&[node("10.0.0.1")]).await;
        manager.teardown_nodes(records).await;
        assert_eq!(manager.stats().ssh[&node("10.0.0.1").key()].idle, 1);

        manager.close_all().await;
        assert_eq!(manager.stats().ssh[&node("10.0.0.1").key()].idle, 0);
        assert_eq!(manager.stats().db.idle, 0);
    }
}
