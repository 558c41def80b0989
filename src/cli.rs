//! CLI entry points: argument parsing and dispatch to routines.

#[macro_use]
pub(crate) mod display;

mod commands;
pub mod logger;
pub mod routines;
pub mod settings;

use clap::Parser;

use commands::{Commands, TasksCommands};
use routines::{RoutineFailure, RoutineSuccess};
use settings::Settings;

use crate::framework::check::selector::TaskSelector;

#[derive(Parser)]
#[command(
    name = "clusterdoc",
    version,
    about = "Diagnostics for distributed database clusters",
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

pub async fn top_command_handler(
    settings: Settings,
    commands: &Commands,
) -> Result<RoutineSuccess, RoutineFailure> {
    match commands {
        Commands::Check {
            config,
            tasks,
            package,
            manifest,
            target,
            max_workers,
            ignore_version,
            json,
        } => {
            let selector = match (tasks, package) {
                (Some(tasks), _) => TaskSelector::from_task_list(tasks),
                (None, Some(package)) => TaskSelector::Package(package.clone()),
                (None, None) => TaskSelector::All,
            };
            routines::check::run_check(routines::check::CheckArgs {
                settings: &settings,
                config,
                selector,
                manifest: manifest.as_deref(),
                target,
                max_workers: *max_workers,
                ignore_version: *ignore_version,
                json: *json,
            })
            .await
        }
        Commands::Tasks { command } => match command {
            TasksCommands::List { target } => routines::tasks::list_tasks(target),
        },
    }
}
