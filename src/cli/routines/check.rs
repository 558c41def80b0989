//! The `check` routine: wire the pools, the registry, and the orchestrator
//! together, run the selected tasks, and render the report.

use std::path::Path;
use std::sync::Arc;

use crate::cli::display::{self, Message};
use crate::cli::routines::{RoutineFailure, RoutineSuccess};
use crate::cli::settings::Settings;
use crate::cluster::ClusterConfig;
use crate::framework::check::orchestrator::CheckOrchestrator;
use crate::framework::check::registry::TaskRegistry;
use crate::framework::check::selector::{PackageManifest, TaskSelector};
use crate::infrastructure::connection::db::HttpSqlFactory;
use crate::infrastructure::connection::db_pool::{DbConnectionPool, DbPoolConfig};
use crate::infrastructure::connection::manager::ConnectionManager;
use crate::infrastructure::connection::ssh::SystemSshFactory;
use crate::infrastructure::connection::ssh_pool::{SshConnectionPool, SshPoolConfig};

pub struct CheckArgs<'a> {
    pub settings: &'a Settings,
    pub config: &'a Path,
    pub selector: TaskSelector,
    pub manifest: Option<&'a Path>,
    pub target: &'a str,
    pub max_workers: Option<usize>,
    pub ignore_version: bool,
    pub json: bool,
}

pub async fn run_check(args: CheckArgs<'_>) -> Result<RoutineSuccess, RoutineFailure> {
    let cluster = Arc::new(ClusterConfig::load(args.config).map_err(|e| {
        RoutineFailure::new(
            Message::new("Config".to_string(), "failed to load cluster config".to_string()),
            e,
        )
    })?);

    let manifest = match args.manifest {
        Some(path) => PackageManifest::load(path).map_err(|e| {
            RoutineFailure::new(
                Message::new("Config".to_string(), "failed to load package manifest".to_string()),
                e,
            )
        })?,
        None => PackageManifest::default(),
    };

    let check_settings = &args.settings.check;
    let ssh_pool = Arc::new(SshConnectionPool::new(
        SshPoolConfig {
            max_per_key: check_settings.ssh_max_per_key,
            idle_timeout: check_settings.ssh_idle_timeout(),
        },
        Box::new(SystemSshFactory),
    ));
    let db_pool = Arc::new(DbConnectionPool::new(
        DbPoolConfig {
            max_size: check_settings.db_pool_size,
            acquire_timeout: check_settings.db_acquire_timeout(),
        },
        Box::new(HttpSqlFactory::new(cluster.db.clone())),
    ));
    db_pool.initialize().await;
    let connections = Arc::new(ConnectionManager::new(ssh_pool, db_pool));

    let registry = Arc::new(TaskRegistry::with_builtin_tasks());
    let mut orchestrator = CheckOrchestrator::new(
        registry,
        manifest,
        cluster,
        connections.clone(),
        args.target,
    )
    .max_workers(
        args.max_workers
            .unwrap_or(check_settings.max_workers),
    )
    .ignore_version(args.ignore_version);
    if !args.json {
        orchestrator = orchestrator.on_progress(Arc::new(display::show_progress));
    }

    let result = orchestrator.run(&args.selector).await;
    // Whatever happened, the pools are drained before we report.
    connections.close_all().await;

    let summary = result.map_err(|e| {
        RoutineFailure::new(
            Message::new("Check".to_string(), "diagnostic run failed".to_string()),
            e,
        )
    })?;

    if args.json {
        let rendered = serde_json::to_string_pretty(&summary.to_map()).map_err(|e| {
            RoutineFailure::new(
                Message::new("Check".to_string(), "failed to render report".to_string()),
                e,
            )
        })?;
        println!("{rendered}");
    } else {
        display::show_report_table(&summary);
    }

    let counts = summary.counts;
    if counts.fail > 0 {
        return Err(RoutineFailure::error(Message::new(
            "Check".to_string(),
            format!("{} of {} tasks failed", counts.fail, counts.total()),
        )));
    }
    let message = Message::new(
        "Check".to_string(),
        format!(
            "{} tasks: {} passed, {} warned, {} skipped",
            counts.total(),
            counts.pass,
            counts.warn,
            counts.skip
        ),
    );
    if counts.warn > 0 {
        Ok(RoutineSuccess::highlight(message))
    } else {
        Ok(RoutineSuccess::success(message))
    }
}
