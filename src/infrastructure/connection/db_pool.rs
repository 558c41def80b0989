//! Bounded pool of database handles against the single SQL endpoint.
//!
//! Pre-filled to `max_size` at startup. Capacity is enforced with a
//! semaphore, so `acquire` blocks for at most `acquire_timeout` when every
//! handle is leased and then fails with `PoolExhausted`. Liveness is probed
//! on both lease and return; a dead handle is silently replaced, never handed
//! to a caller.

use std::collections::{HashSet, VecDeque};
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::db::{DbHandle, DbHandleFactory};
use super::{KeyStats, PoolError};

#[derive(Debug, Clone)]
pub struct DbPoolConfig {
    pub max_size: usize,
    /// Upper bound on how long `acquire` waits for a free handle.
    pub acquire_timeout: Duration,
}

impl Default for DbPoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// A database handle leased from the pool. Holds a capacity permit for as
/// long as the caller owns it.
pub struct DbLease {
    handle: Box<dyn DbHandle>,
    id: u64,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for DbLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbLease").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Deref for DbLease {
    type Target = dyn DbHandle;

    fn deref(&self) -> &Self::Target {
        &*self.handle
    }
}

pub struct DbConnectionPool {
    config: DbPoolConfig,
    factory: Box<dyn DbHandleFactory>,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<Box<dyn DbHandle>>>,
    leased: Mutex<LeaseTracker>,
}

#[derive(Default)]
struct LeaseTracker {
    ids: HashSet<u64>,
    next_id: u64,
}

impl DbConnectionPool {
    pub fn new(config: DbPoolConfig, factory: Box<dyn DbHandleFactory>) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_size));
        Self {
            config,
            factory,
            semaphore,
            idle: Mutex::new(VecDeque::new()),
            leased: Mutex::new(LeaseTracker::default()),
        }
    }

    /// Eagerly fill the pool to `max_size`. Creation failures are logged and
    /// leave the pool shallower; `acquire` will retry construction on demand.
    pub async fn initialize(&self) {
        for _ in 0..self.config.max_size {
            match self.factory.connect().await {
                Ok(handle) => self
                    .idle
                    .lock()
                    .expect("db pool lock poisoned")
                    .push_back(handle),
                Err(e) => {
                    warn!("db pool pre-fill connection failed: {e}");
                }
            }
        }
        let depth = self.idle.lock().expect("db pool lock poisoned").len();
        debug!("db pool initialized with {depth} connections");
    }

    /// Lease a handle, waiting up to `acquire_timeout` for capacity.
    pub async fn acquire(&self) -> Result<DbLease, PoolError> {
        let permit = timeout(
            self.config.acquire_timeout,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        .map_err(|_| PoolError::PoolExhausted {
            max_size: self.config.max_size,
            timeout: self.config.acquire_timeout,
        })?
        .map_err(|_| PoolError::PoolClosed)?;

        // Reuse a queued handle when its probe passes; probing happens with
        // no lock held.
        loop {
            let candidate = self
                .idle
                .lock()
                .expect("db pool lock poisoned")
                .pop_front();
            let Some(handle) = candidate else { break };

            if handle.ping().await {
                return Ok(self.register_lease(handle, permit));
            }
            debug!("pooled db handle failed its liveness probe, discarding");
            handle.close().await;
            break;
        }

        let handle = self
            .factory
            .connect()
            .await
            .map_err(|e| PoolError::ConnectionCreateFailed {
                target: "db".to_string(),
                reason: e.to_string(),
            })?;

        Ok(self.register_lease(handle, permit))
    }

    fn register_lease(&self, handle: Box<dyn DbHandle>, permit: OwnedSemaphorePermit) -> DbLease {
        let mut leased = self.leased.lock().expect("db pool lock poisoned");
        let id = leased.next_id;
        leased.next_id += 1;
        leased.ids.insert(id);
        DbLease {
            handle,
            id,
            _permit: permit,
        }
    }

    /// Return a leased handle. Never observably fails.
    pub async fn release(&self, lease: DbLease) {
        {
            let mut leased = self.leased.lock().expect("db pool lock poisoned");
            if !leased.ids.remove(&lease.id) {
                warn!("ignoring release of db handle unknown to the pool");
                return;
            }
        }

        let DbLease {
            handle, _permit, ..
        } = lease;

        if handle.ping().await {
            self.enqueue_or_close(handle).await;
        } else {
            // Dead on return: replace best-effort so pool depth recovers,
            // then close the dead handle. Replacement errors are logged only.
            match self.factory.connect().await {
                Ok(replacement) => self.enqueue_or_close(replacement).await,
                Err(e) => debug!("could not replace dead db handle: {e}"),
            }
            handle.close().await;
        }
        // `_permit` drops here, returning capacity to waiting acquirers.
    }

    async fn enqueue_or_close(&self, handle: Box<dyn DbHandle>) {
        let overflow = {
            let mut idle = self.idle.lock().expect("db pool lock poisoned");
            if idle.len() < self.config.max_size {
                idle.push_back(handle);
                None
            } else {
                Some(handle)
            }
        };
        if let Some(handle) = overflow {
            debug!("db pool is full, closing returned handle");
            handle.close().await;
        }
    }

    /// Drain and close every queued handle. Idempotent.
    pub async fn close_all(&self) {
        let drained: Vec<Box<dyn DbHandle>> = {
            let mut idle = self.idle.lock().expect("db pool lock poisoned");
            idle.drain(..).collect()
        };
        for handle in &drained {
            handle.close().await;
        }
    }

    pub fn stats(&self) -> KeyStats {
        KeyStats {
            in_use: self.config.max_size - self.semaphore.available_permits(),
            idle: self.idle.lock().expect("db pool lock poisoned").len(),
        }
    }
}
