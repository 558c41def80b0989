//! Key-partitioned SSH connection pool.
//!
//! One sub-pool per `NodeKey`. Sessions are created on demand with no global
//! cap; only *returned* sessions are capped per key, so the pool's footprint
//! stays bounded without ever blocking an acquire. A single coarse lock
//! guards the key map and is held only for O(1) queue operations; liveness
//! probes and session construction happen outside it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::ssh::{NodeConfig, NodeKey, SshSession, SshSessionFactory};
use super::{KeyStats, PoolError};

#[derive(Debug, Clone)]
pub struct SshPoolConfig {
    /// Maximum sessions queued per key; excess returns are closed.
    pub max_per_key: usize,
    /// Unleased sessions older than this are closed by `evict_idle`.
    pub idle_timeout: Duration,
}

impl Default for SshPoolConfig {
    fn default() -> Self {
        Self {
            max_per_key: 5,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

struct PoolSlot {
    session: Box<dyn SshSession>,
    last_used: Instant,
}

#[derive(Default)]
struct SubPool {
    idle: VecDeque<PoolSlot>,
    in_use: usize,
}

#[derive(Default)]
struct Inner {
    sub_pools: HashMap<NodeKey, SubPool>,
    /// Ids of currently-leased sessions; removing the id on drop is what
    /// settles `in_use`, and guarantees a lease is settled exactly once.
    leased: HashSet<u64>,
    next_id: u64,
}

/// An SSH session leased from the pool. Exclusively owned by the caller until
/// handed back through `SshConnectionPool::release`. Dropping a lease without
/// releasing it (a panicking task, usually) still settles the pool's
/// accounting, but the session itself is left unclosed.
pub struct SshLease {
    session: Option<Box<dyn SshSession>>,
    node: NodeConfig,
    id: u64,
    key: NodeKey,
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for SshLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshLease").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Deref for SshLease {
    type Target = dyn SshSession;

    fn deref(&self) -> &Self::Target {
        // `release` empties the slot and drops the lease in the same breath,
        // so a live lease always holds a session.
        self.session
            .as_deref()
            .expect("ssh lease used after release")
    }
}

impl Drop for SshLease {
    fn drop(&mut self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.leased.remove(&self.id) {
            if let Some(sub) = inner.sub_pools.get_mut(&self.key) {
                sub.in_use = sub.in_use.saturating_sub(1);
            }
            if self.session.is_some() {
                warn!(
                    "ssh lease for {} dropped without release; session left unclosed",
                    self.key
                );
            }
        }
    }
}

pub struct SshConnectionPool {
    config: SshPoolConfig,
    factory: Box<dyn SshSessionFactory>,
    inner: Arc<Mutex<Inner>>,
}

impl SshConnectionPool {
    pub fn new(config: SshPoolConfig, factory: Box<dyn SshSessionFactory>) -> Self {
        Self {
            config,
            factory,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Lease a session for `node`, reusing a queued one when it passes its
    /// liveness probe, creating a new one otherwise.
    pub async fn acquire(&self, node: &NodeConfig) -> Result<SshLease, PoolError> {
        let key = node.key();

        loop {
            let candidate = {
                let mut inner = self.inner.lock().expect("ssh pool lock poisoned");
                inner
                    .sub_pools
                    .get_mut(&key)
                    .and_then(|sub| sub.idle.pop_front())
            };

            let Some(slot) = candidate else { break };

            // Probe outside the lock; network I/O never happens under it.
            if slot.session.is_alive().await {
                return Ok(self.register_lease(&key, slot.session, node));
            }

            debug!("discarding dead pooled session for {key}");
            close_quietly(slot.session.as_ref()).await;
        }

        let session =
            self.factory
                .connect(node)
                .await
                .map_err(|e| PoolError::ConnectionCreateFailed {
                    target: key.to_string(),
                    reason: e.to_string(),
                })?;

        Ok(self.register_lease(&key, session, node))
    }

    fn register_lease(
        &self,
        key: &NodeKey,
        session: Box<dyn SshSession>,
        node: &NodeConfig,
    ) -> SshLease {
        let mut inner = self.inner.lock().expect("ssh pool lock poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.leased.insert(id);
        inner.sub_pools.entry(key.clone()).or_default().in_use += 1;
        drop(inner);
        SshLease {
            session: Some(session),
            node: node.clone(),
            id,
            key: key.clone(),
            inner: Arc::clone(&self.inner),
        }
    }

    /// Hand a leased session back. Never observably fails: a dead session is
    /// replaced best-effort and closed, a foreign lease is closed against its
    /// own pool, and a return to a full queue closes the session instead of
    /// growing the pool.
    pub async fn release(&self, mut lease: SshLease) {
        if !Arc::ptr_eq(&self.inner, &lease.inner) {
            warn!(
                "ignoring release of a lease from another pool ({})",
                lease.key
            );
            if let Some(session) = lease.session.take() {
                close_quietly(session.as_ref()).await;
            }
            return;
        }

        let Some(session) = lease.session.take() else {
            return;
        };
        let key = lease.key.clone();
        let node = lease.node.clone();
        // The lease's drop settles `in_use` and retires the id.
        drop(lease);

        if session.is_alive().await {
            self.enqueue_or_close(&key, session).await;
            return;
        }

        // Dead on return: try to replace it so the sub-pool keeps its depth.
        // Replacement errors are logged only.
        match self.factory.connect(&node).await {
            Ok(replacement) => self.enqueue_or_close(&key, replacement).await,
            Err(e) => debug!("could not replace dead session for {key}: {e}"),
        }
        close_quietly(session.as_ref()).await;
    }

    async fn enqueue_or_close(&self, key: &NodeKey, session: Box<dyn SshSession>) {
        let overflow = {
            let mut inner = self.inner.lock().expect("ssh pool lock poisoned");
            let sub = inner.sub_pools.entry(key.clone()).or_default();
            if sub.idle.len() < self.config.max_per_key {
                sub.idle.push_back(PoolSlot {
                    session,
                    last_used: Instant::now(),
                });
                None
            } else {
                Some(session)
            }
        };

        if let Some(session) = overflow {
            debug!("sub-pool for {key} is full, closing returned session");
            close_quietly(session.as_ref()).await;
        }
    }

    /// Close every unleased session idle for longer than the configured
    /// timeout. Leased sessions are immune regardless of age.
    pub async fn evict_idle(&self) {
        let expired = {
            let mut inner = self.inner.lock().expect("ssh pool lock poisoned");
            let idle_timeout = self.config.idle_timeout;
            let mut expired = Vec::new();
            for sub in inner.sub_pools.values_mut() {
                let mut kept = VecDeque::with_capacity(sub.idle.len());
                while let Some(slot) = sub.idle.pop_front() {
                    if slot.last_used.elapsed() > idle_timeout {
                        expired.push(slot.session);
                    } else {
                        kept.push_back(slot);
                    }
                }
                sub.idle = kept;
            }
            expired
        };

        for session in &expired {
            close_quietly(session.as_ref()).await;
        }
        if !expired.is_empty() {
            debug!("evicted {} idle ssh sessions", expired.len());
        }
    }

    /// Drain and close every queued session across all keys. Idempotent.
    pub async fn close_all(&self) {
        let drained: Vec<Box<dyn SshSession>> = {
            let mut inner = self.inner.lock().expect("ssh pool lock poisoned");
            inner
                .sub_pools
                .values_mut()
                .flat_map(|sub| sub.idle.drain(..))
                .map(|slot| slot.session)
                .collect()
        };

        for session in &drained {
            close_quietly(session.as_ref()).await;
        }
    }

    /// Per-key snapshot of leased and queued session counts.
    pub fn stats(&self) -> HashMap<NodeKey, KeyStats> {
        let inner = self.inner.lock().expect("ssh pool lock poisoned");
        inner
            .sub_pools
            .iter()
            .map(|(key, sub)| {
                (
                    key.clone(),
                    KeyStats {
                        in_use: sub.in_use,
                        idle: sub.idle.len(),
                    },
                )
            })
            .collect()
    }
}

async fn close_quietly(session: &dyn SshSession) {
    if let Err(e) = session.close().await {
        debug!("error closing ssh session for {}: {e}", session.key());
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::super::ssh::{
        CommandOutput, NodeAccess, NodeConfig, NodeKey, SshError, SshSession, SshSessionFactory,
    };

    pub fn node(host: &str) -> NodeConfig {
        NodeConfig {
            host: host.to_string(),
            ssh_port: 22,
            user: Some("admin".to_string()),
            key_path: None,
            access: NodeAccess::Remote,
            connect_timeout_secs: None,
        }
    }

    pub struct FakeSession {
        key: NodeKey,
        pub alive: Arc<AtomicBool>,
        pub closed: Arc<AtomicBool>,
    }

    impl FakeSession {
        pub fn new(key: NodeKey) -> (Self, Arc<AtomicBool>, Arc<AtomicBool>) {
            let alive = Arc::new(AtomicBool::new(true));
            let closed = Arc::new(AtomicBool::new(false));
            (
                Self {
                    key,
                    alive: alive.clone(),
                    closed: closed.clone(),
                },
                alive,
                closed,
            )
        }
    }

    #[async_trait]
    impl SshSession for FakeSession {
        fn key(&self) -> &NodeKey {
            &self.key
        }

        async fn exec(&self, _command: &str) -> Result<CommandOutput, SshError> {
            Ok(CommandOutput {
                stdout: String::new(),
                stderr: String::new(),
                status: 0,
            })
        }

        async fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn close(&self) -> Result<(), SshError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Flags for one fake session created by `FakeFactory`, in creation order.
    pub struct SessionHandles {
        pub alive: Arc<AtomicBool>,
        pub closed: Arc<AtomicBool>,
    }

    /// Factory producing live fake sessions and counting connect calls.
    #[derive(Default)]
    pub struct FakeFactory {
        pub connects: AtomicUsize,
        pub fail: AtomicBool,
        pub handles: std::sync::Mutex<Vec<SessionHandles>>,
    }

    #[async_trait]
    impl SshSessionFactory for FakeFactory {
        async fn connect(&self, node: &NodeConfig) -> Result<Box<dyn SshSession>, SshError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SshError::MasterFailed {
                    target: node.key().to_string(),
                    stderr: "simulated".to_string(),
                });
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            let (session, alive, closed) = FakeSession::new(node.key());
            self.handles
                .lock()
                .unwrap()
                .push(SessionHandles { alive, closed });
            Ok(Box::new(session))
        }
    }

    /// Trait-object wrapper so tests can keep a handle on a shared factory.
    pub struct SharedFactory(pub Arc<FakeFactory>);

    #[async_trait]
    impl SshSessionFactory for SharedFactory {
        async fn connect(&self, node: &NodeConfig) -> Result<Box<dyn SshSession>, SshError> {
            self.0.connect(node).await
        }
    }
}
