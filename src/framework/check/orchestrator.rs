//! Check run scheduling.
//!
//! The orchestrator resolves a selector into concrete task names, determines
//! the cluster version, then runs every task on a bounded set of workers. A
//! task failure (including a panic) becomes a `fail` row in the report; the
//! run itself only aborts on setup errors, before any task has started.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::cluster::ClusterConfig;
use crate::infrastructure::connection::db::parse_json_rows;
use crate::infrastructure::connection::manager::ConnectionManager;
use crate::utilities::system;

use super::registry::TaskRegistry;
use super::report::{CheckReport, CheckSummary, TaskReport};
use super::selector::{self, PackageManifest, SelectorError, TaskSelector};
use super::task::{DiagnosticTask, TaskContext};

/// Callback invoked after each task completes, with `(done, total)`. `done`
/// increases by exactly one per call.
pub type ProgressFn = Arc<dyn Fn(usize, usize) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error(transparent)]
    Selector(#[from] SelectorError),

    #[error("no diagnostic tasks registered for target '{0}'")]
    NoTasksDiscovered(String),

    #[error("could not determine cluster version: {0} (pass --ignore-version to proceed)")]
    VersionUndeterminable(String),
}

pub struct CheckOrchestrator {
    registry: Arc<TaskRegistry>,
    manifest: PackageManifest,
    cluster: Arc<ClusterConfig>,
    connections: Arc<ConnectionManager>,
    target: String,
    max_workers: usize,
    ignore_version: bool,
    on_progress: Option<ProgressFn>,
}

#[derive(serde::Deserialize)]
struct VersionRow {
    version: String,
}

impl CheckOrchestrator {
    pub fn new(
        registry: Arc<TaskRegistry>,
        manifest: PackageManifest,
        cluster: Arc<ClusterConfig>,
        connections: Arc<ConnectionManager>,
        target: &str,
    ) -> Self {
        Self {
            registry,
            manifest,
            cluster,
            connections,
            target: target.to_string(),
            max_workers: 4,
            ignore_version: false,
            on_progress: None,
        }
    }

    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn ignore_version(mut self, ignore: bool) -> Self {
        self.ignore_version = ignore;
        self
    }

    pub fn on_progress(mut self, callback: ProgressFn) -> Self {
        self.on_progress = Some(callback);
        self
    }

    /// Run one check pass and return the finalized summary.
    pub async fn run(&self, task_selector: &TaskSelector) -> Result<CheckSummary, CheckError> {
        let available = self.registry.task_names(&self.target);
        if available.is_empty() {
            return Err(CheckError::NoTasksDiscovered(self.target.clone()));
        }

        let resolved = selector::resolve(task_selector, &available, &self.manifest)?;
        info!(
            "resolved {} of {} registered tasks for target '{}'",
            resolved.len(),
            available.len(),
            self.target
        );

        let version = if self.ignore_version {
            None
        } else {
            Some(self.resolve_version().await?)
        };

        Ok(self.schedule_and_run(resolved, version).await)
    }

    /// Query the cluster version through a pooled handle. Failing to reach the
    /// database here aborts the run; every task would hit the same wall.
    async fn resolve_version(&self) -> Result<String, CheckError> {
        let lease = self
            .connections
            .acquire_db()
            .await
            .map_err(|e| CheckError::VersionUndeterminable(e.to_string()))?;

        let result = lease
            .execute_sql("SELECT version() AS version FORMAT JSON")
            .await;
        self.connections.release_db(lease).await;

        let body = result.map_err(|e| CheckError::VersionUndeterminable(e.to_string()))?;
        let rows: Vec<VersionRow> = parse_json_rows(&body)
            .map_err(|e| CheckError::VersionUndeterminable(e.to_string()))?;
        let version = rows
            .into_iter()
            .next()
            .map(|row| row.version)
            .ok_or_else(|| {
                CheckError::VersionUndeterminable("version query returned no rows".to_string())
            })?;

        debug!("cluster version {version}");
        Ok(version)
    }

    async fn schedule_and_run(
        &self,
        resolved: Vec<String>,
        version: Option<String>,
    ) -> CheckSummary {
        let total = resolved.len();
        let workers = self.max_workers.min(total).max(1);
        debug!("running {total} tasks on {workers} workers");

        let slots = Arc::new(Semaphore::new(workers));
        let ctx = Arc::new(TaskContext {
            cluster: self.cluster.clone(),
            connections: self.connections.clone(),
            version,
        });
        let report = CheckReport::new(&self.target);

        let mut join_set: JoinSet<TaskReport> = JoinSet::new();
        let mut names_by_id = HashMap::new();
        let mut done = 0usize;

        for name in resolved {
            let Some(task) = self.registry.instantiate(&name) else {
                // Names come from the registry itself, so this only fires if
                // a caller swapped registries between discovery and run. The
                // row still counts toward progress like any other completion.
                let mut missing = TaskReport::new(&name);
                missing.add_fail("task is no longer registered");
                report.add_task_report(missing);
                done += 1;
                if let Some(callback) = &self.on_progress {
                    callback(done, total);
                }
                continue;
            };

            let slots = slots.clone();
            let ctx = ctx.clone();
            let task_name = name.clone();
            let handle = join_set.spawn(async move {
                let _permit = match slots.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        let mut failed = TaskReport::new(&task_name);
                        failed.add_fail("worker slot unavailable");
                        return failed;
                    }
                };
                run_one(task, &task_name, &ctx).await
            });
            names_by_id.insert(handle.id(), name);
        }

        while let Some(result) = join_set.join_next_with_id().await {
            let task_report = match result {
                Ok((_, task_report)) => task_report,
                Err(join_error) => {
                    // A panicking task still gets its report row.
                    let name = names_by_id
                        .get(&join_error.id())
                        .map(String::as_str)
                        .unwrap_or("unknown");
                    error!("task '{name}' aborted: {join_error}");
                    let mut failed = TaskReport::new(name);
                    failed.add_fail(format!("task aborted: {join_error}"));
                    failed
                }
            };
            report.add_task_report(task_report);

            done += 1;
            if let Some(callback) = &self.on_progress {
                callback(done, total);
            }
        }

        report.finalize()
    }
}

/// Drive one task through its lifecycle. `cleanup` runs whatever `init` and
/// `execute` did; errors are contained into the task's own report row.
async fn run_one(
    mut task: Box<dyn DiagnosticTask>,
    name: &str,
    ctx: &TaskContext,
) -> TaskReport {
    let mut report = TaskReport::new(name);

    let info = task.info();
    if let Some(supported) = info.supported_os {
        let os = system::current_os();
        if !supported.contains(&os) {
            report.mark_skipped(format!(
                "not supported on {os} (supported: {})",
                supported.join(", ")
            ));
            return report;
        }
    }

    let outcome = match task.init(ctx).await {
        Ok(()) => task.execute(ctx, &mut report).await,
        Err(e) => Err(e),
    };
    if let Err(e) = outcome {
        error!("task '{name}' failed: {e}");
        report.add_fail(format!("task execution failed: {e}"));
    }

    task.cleanup(ctx).await;
    report
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::infrastructure::connection::db::DbConfig;
    use crate::infrastructure::connection::db_pool::test_support::{
        FakeDbFactory, SharedDbFactory,
    };
    use crate::infrastructure::connection::db_pool::{DbConnectionPool, DbPoolConfig};
    use crate::infrastructure::connection::ssh_pool::test_support::{FakeFactory, SharedFactory};
    use crate::infrastructure::connection::ssh_pool::{SshConnectionPool, SshPoolConfig};

    use super::super::report::TaskStatus;
    use super::super::task::{TaskError, TaskFactory, TaskInfo};
    use super::*;

    // Tests run in parallel; each static below is touched only by the tasks
    // of the single test that reads it.
    static CLEANUPS: AtomicUsize = AtomicUsize::new(0);
    static RUNNING: AtomicUsize = AtomicUsize::new(0);
    static MAX_RUNNING: AtomicUsize = AtomicUsize::new(0);

    #[derive(Default, Clone, Copy)]
    struct Script {
        fail_init: bool,
        fail_execute: bool,
        panic_execute: bool,
        track_concurrency: bool,
        count_cleanup: bool,
    }

    struct ScriptedTask {
        info: TaskInfo,
        script: Script,
    }

    #[async_trait]
    impl DiagnosticTask for ScriptedTask {
        fn info(&self) -> TaskInfo {
            self.info.clone()
        }

        async fn init(&mut self, _ctx: &TaskContext) -> Result<(), TaskError> {
            if self.script.fail_init {
                return Err(TaskError::Precondition("init refused".to_string()));
            }
            Ok(())
        }

        async fn execute(
            &mut self,
            ctx: &TaskContext,
            report: &mut TaskReport,
        ) -> Result<(), TaskError> {
            if self.script.track_concurrency {
                let now = RUNNING.fetch_add(1, Ordering::SeqCst) + 1;
                MAX_RUNNING.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                RUNNING.fetch_sub(1, Ordering::SeqCst);
            }
            if self.script.panic_execute {
                panic!("scripted panic");
            }
            if self.script.fail_execute {
                return Err(TaskError::Precondition("execute refused".to_string()));
            }
            report.add_info(format!(
                "ran with version {:?}",
                ctx.version.as_deref().unwrap_or("none")
            ));
            Ok(())
        }

        async fn cleanup(&mut self, _ctx: &TaskContext) {
            if self.script.count_cleanup {
                CLEANUPS.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn scripted(
        name: &'static str,
        supported_os: Option<&'static [&'static str]>,
        script: Script,
    ) -> Box<dyn DiagnosticTask> {
        Box::new(ScriptedTask {
            info: TaskInfo {
                name,
                description: "scripted",
                supported_os,
            },
            script,
        })
    }

    fn registry_with(factories: &[(&'static str, TaskFactory)]) -> Arc<TaskRegistry> {
        let mut registry = TaskRegistry::new();
        for (_, factory) in factories {
            registry.register("cluster", *factory);
        }
        Arc::new(registry)
    }

    fn cluster() -> Arc<ClusterConfig> {
        Arc::new(ClusterConfig {
            name: "test".to_string(),
            db: DbConfig {
                host: "127.0.0.1".to_string(),
                port: 8123,
                user: "root".to_string(),
                password: String::new(),
                use_ssl: false,
            },
            nodes: Vec::new(),
        })
    }

    async fn connections(db_response: &str) -> Arc<ConnectionManager> {
        let ssh_pool = Arc::new(SshConnectionPool::new(
            SshPoolConfig::default(),
            Box::new(SharedFactory(Arc::new(FakeFactory::default()))),
        ));
        let db_pool = Arc::new(DbConnectionPool::new(
            DbPoolConfig {
                max_size: 2,
                acquire_timeout: Duration::from_secs(1),
            },
            Box::new(SharedDbFactory(Arc::new(FakeDbFactory::with_response(
                db_response,
            )))),
        ));
        db_pool.initialize().await;
        Arc::new(ConnectionManager::new(ssh_pool, db_pool))
    }

    const VERSION_BODY: &str = r#"{"data":[{"version":"4.2.1"}]}"#;

    fn orchestrator(
        registry: Arc<TaskRegistry>,
        connections: Arc<ConnectionManager>,
    ) -> CheckOrchestrator {
        CheckOrchestrator::new(
            registry,
            PackageManifest::default(),
            cluster(),
            connections,
            "cluster",
        )
    }

    #[tokio::test]
    async fn failures_become_rows_and_cleanup_always_runs() {
        fn ok() -> Box<dyn DiagnosticTask> {
            scripted(
                "a.ok",
                None,
                Script {
                    count_cleanup: true,
                    ..Script::default()
                },
            )
        }
        fn bad_init() -> Box<dyn DiagnosticTask> {
            scripted(
                "b.bad_init",
                None,
                Script {
                    fail_init: true,
                    count_cleanup: true,
                    ..Script::default()
                },
            )
        }
        fn bad_exec() -> Box<dyn DiagnosticTask> {
            scripted(
                "c.bad_exec",
                None,
                Script {
                    fail_execute: true,
                    count_cleanup: true,
                    ..Script::default()
                },
            )
        }

        let registry = registry_with(&[("a", ok), ("b", bad_init), ("c", bad_exec)]);
        let connections = connections(VERSION_BODY).await;

        let before = CLEANUPS.load(Ordering::SeqCst);
        let summary = orchestrator(registry, connections)
            .run(&TaskSelector::All)
            .await
            .unwrap();

        assert_eq!(summary.entries.len(), 3);
        assert_eq!(summary.counts.pass, 1);
        assert_eq!(summary.counts.fail, 2);
        // Every task that started ran cleanup, failed or not.
        assert_eq!(CLEANUPS.load(Ordering::SeqCst), before + 3);

        let failed = &summary.entries[1];
        assert_eq!(failed.task_name, "b.bad_init");
        assert_eq!(failed.status, TaskStatus::Fail);
        assert!(failed.messages[0].contains("init refused"));
    }

    #[tokio::test]
    async fn panicking_task_does_not_abort_siblings() {
        fn ok() -> Box<dyn DiagnosticTask> {
            scripted("a.ok", None, Script::default())
        }
        fn panics() -> Box<dyn DiagnosticTask> {
            scripted(
                "b.panics",
                None,
                Script {
                    panic_execute: true,
                    ..Script::default()
                },
            )
        }

        let registry = registry_with(&[("a", ok), ("b", panics)]);
        let connections = connections(VERSION_BODY).await;

        let summary = orchestrator(registry, connections)
            .run(&TaskSelector::All)
            .await
            .unwrap();

        assert_eq!(summary.entries.len(), 2);
        assert_eq!(summary.entries[0].status, TaskStatus::Pass);
        assert_eq!(summary.entries[1].task_name, "b.panics");
        assert_eq!(summary.entries[1].status, TaskStatus::Fail);
        assert!(summary.entries[1].messages[0].contains("aborted"));
    }

    #[tokio::test]
    async fn unsupported_os_is_skipped_without_running() {
        fn plan9_only() -> Box<dyn DiagnosticTask> {
            scripted("a.plan9", Some(&["plan9"]), Script::default())
        }

        let registry = registry_with(&[("a", plan9_only)]);
        let connections = connections(VERSION_BODY).await;

        let summary = orchestrator(registry, connections)
            .run(&TaskSelector::All)
            .await
            .unwrap();

        assert_eq!(summary.counts.skip, 1);
        assert!(summary.entries[0].messages[0].contains("not supported"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn worker_parallelism_is_bounded() {
        const TRACKED: Script = Script {
            fail_init: false,
            fail_execute: false,
            panic_execute: false,
            track_concurrency: true,
            count_cleanup: false,
        };
        fn tracked() -> Box<dyn DiagnosticTask> {
            scripted("a.tracked", None, TRACKED)
        }
        fn tracked_b() -> Box<dyn DiagnosticTask> {
            scripted("b.tracked", None, TRACKED)
        }
        fn tracked_c() -> Box<dyn DiagnosticTask> {
            scripted("c.tracked", None, TRACKED)
        }
        fn tracked_d() -> Box<dyn DiagnosticTask> {
            scripted("d.tracked", None, TRACKED)
        }

        let registry = registry_with(&[
            ("a", tracked),
            ("b", tracked_b),
            ("c", tracked_c),
            ("d", tracked_d),
        ]);
        let connections = connections(VERSION_BODY).await;

        MAX_RUNNING.store(0, Ordering::SeqCst);
        let summary = orchestrator(registry, connections)
            .max_workers(1)
            .run(&TaskSelector::All)
            .await
            .unwrap();

        assert_eq!(summary.entries.len(), 4);
        assert_eq!(MAX_RUNNING.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn more_workers_than_tasks_still_yields_one_report_each() {
        fn ok() -> Box<dyn DiagnosticTask> {
            scripted("a.ok", None, Script::default())
        }
        fn bad() -> Box<dyn DiagnosticTask> {
            scripted(
                "b.bad",
                None,
                Script {
                    fail_execute: true,
                    ..Script::default()
                },
            )
        }

        let registry = registry_with(&[("a", ok), ("b", bad)]);
        let connections = connections(VERSION_BODY).await;

        let summary = orchestrator(registry, connections)
            .max_workers(20)
            .run(&TaskSelector::All)
            .await
            .unwrap();
        assert_eq!(summary.entries.len(), 2);
        assert_eq!(summary.counts.pass, 1);
        assert_eq!(summary.counts.fail, 1);
    }

    #[tokio::test]
    async fn progress_is_monotone_and_complete() {
        fn ok() -> Box<dyn DiagnosticTask> {
            scripted("a.ok", None, Script::default())
        }
        fn ok_b() -> Box<dyn DiagnosticTask> {
            scripted("b.ok", None, Script::default())
        }
        fn ok_c() -> Box<dyn DiagnosticTask> {
            scripted("c.ok", None, Script::default())
        }

        let registry = registry_with(&[("a", ok), ("b", ok_b), ("c", ok_c)]);
        let connections = connections(VERSION_BODY).await;

        let seen: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let summary = orchestrator(registry, connections)
            .on_progress(Arc::new(move |done, total| {
                seen_cb.lock().unwrap().push((done, total));
            }))
            .run(&TaskSelector::All)
            .await
            .unwrap();

        assert_eq!(summary.entries.len(), 3);
        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![(1, 3), (2, 3), (3, 3)]);
    }

    #[tokio::test]
    async fn unregistered_names_still_advance_progress() {
        fn ok() -> Box<dyn DiagnosticTask> {
            scripted("a.ok", None, Script::default())
        }

        let registry = registry_with(&[("a", ok)]);
        let connections = connections(VERSION_BODY).await;

        let seen: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let orchestrator = orchestrator(registry, connections).on_progress(Arc::new(
            move |done, total| {
                seen_cb.lock().unwrap().push((done, total));
            },
        ));

        // A name resolved against an earlier registry no longer instantiates;
        // its fail row must advance the callback like any completion.
        let summary = orchestrator
            .schedule_and_run(vec!["a.ok".to_string(), "ghost.task".to_string()], None)
            .await;

        assert_eq!(summary.entries.len(), 2);
        assert_eq!(summary.counts.fail, 1);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen.last(), Some(&(2, 2)));
        assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[tokio::test]
    async fn version_failure_aborts_before_any_task() {
        fn ok() -> Box<dyn DiagnosticTask> {
            scripted("a.ok", None, Script::default())
        }

        let registry = registry_with(&[("a", ok)]);
        // Response with no usable rows makes the version unresolvable.
        let connections = connections(r#"{"data":[]}"#).await;

        let err = orchestrator(registry.clone(), connections)
            .run(&TaskSelector::All)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckError::VersionUndeterminable(_)));

        // With the gate disabled the same run proceeds with no version.
        let connections = connections_no_version().await;
        let summary = orchestrator(registry, connections)
            .ignore_version(true)
            .run(&TaskSelector::All)
            .await
            .unwrap();
        assert_eq!(summary.counts.pass, 1);
        assert!(summary.entries[0].messages[0].contains("none"));
    }

    async fn connections_no_version() -> Arc<ConnectionManager> {
        connections(r#"{"data":[]}"#).await
    }

    #[tokio::test]
    async fn empty_registry_is_a_setup_error() {
        let registry = Arc::new(TaskRegistry::new());
        let connections = connections(VERSION_BODY).await;

        let err = orchestrator(registry, connections)
            .run(&TaskSelector::All)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckError::NoTasksDiscovered(_)));
    }

    #[tokio::test]
    async fn selector_errors_propagate() {
        fn ok() -> Box<dyn DiagnosticTask> {
            scripted("a.ok", None, Script::default())
        }

        let registry = registry_with(&[("a", ok)]);
        let connections = connections(VERSION_BODY).await;

        let err = orchestrator(registry, connections)
            .run(&TaskSelector::Tasks(vec!["nope".to_string()]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CheckError::Selector(SelectorError::NoMatch(_))
        ));
    }
}
