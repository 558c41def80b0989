//! The diagnostic task contract.
//!
//! A task is instantiated per invocation, never shared across workers. The
//! scheduler drives `init` → `execute` → `cleanup`; `cleanup` always runs,
//! whatever `init` or `execute` returned, so leased connections make it back
//! to their pools.

use std::sync::Arc;

use async_trait::async_trait;

use crate::cluster::ClusterConfig;
use crate::infrastructure::connection::ssh::SshError;
use crate::infrastructure::connection::manager::ConnectionManager;
use crate::infrastructure::connection::PoolError;
use super::report::TaskReport;

/// Any error escaping a task's `init` or `execute`. Contained at the
/// scheduler boundary and converted into a `fail` report entry; it never
/// aborts sibling tasks.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("ssh command failed: {0}")]
    Ssh(#[from] SshError),

    #[error("query failed: {0}")]
    Query(#[from] anyhow::Error),

    #[error("{0}")]
    Precondition(String),
}

/// Static metadata describing a task.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub name: &'static str,
    pub description: &'static str,
    /// Operating systems the task can run against; `None` means any.
    pub supported_os: Option<&'static [&'static str]>,
}

/// Everything a task may touch during one run. Shared read-only across
/// workers; connection leases are taken per task through the manager.
pub struct TaskContext {
    pub cluster: Arc<ClusterConfig>,
    pub connections: Arc<ConnectionManager>,
    /// Cluster version resolved before scheduling; `None` when the run was
    /// started with version checks disabled.
    pub version: Option<String>,
}

/// One diagnostic unit. Implementations lease connections in `init`, do
/// their work in `execute`, and release everything in `cleanup`.
#[async_trait]
pub trait DiagnosticTask: Send {
    fn info(&self) -> TaskInfo;

    async fn init(&mut self, ctx: &TaskContext) -> Result<(), TaskError>;

    async fn execute(
        &mut self,
        ctx: &TaskContext,
        report: &mut TaskReport,
    ) -> Result<(), TaskError>;

    /// Release resources. Must not fail; implementations log problems and
    /// carry on.
    async fn cleanup(&mut self, ctx: &TaskContext);
}

/// Constructor the registry stores for each task name.
pub type TaskFactory = fn() -> Box<dyn DiagnosticTask>;
