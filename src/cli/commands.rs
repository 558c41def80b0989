//! # CLI Commands
//! A module for all the commands that can be run from the CLI

use std::path::PathBuf;

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Run diagnostic checks against a cluster
    Check {
        /// Path to the cluster config file
        #[arg(short, long)]
        config: PathBuf,

        /// Task names or patterns to run, separated by `;` (default: all)
        #[arg(long, conflicts_with = "package")]
        tasks: Option<String>,

        /// Named task package from the package manifest
        #[arg(long)]
        package: Option<String>,

        /// Path to the package manifest (YAML)
        #[arg(long)]
        manifest: Option<PathBuf>,

        /// Diagnostic target to check
        #[arg(long, default_value = "cluster")]
        target: String,

        /// Maximum number of tasks running at once (default from settings)
        #[arg(long)]
        max_workers: Option<usize>,

        /// Proceed even when the cluster version cannot be determined
        #[arg(long, default_value = "false")]
        ignore_version: bool,

        /// Print the report as JSON instead of a table
        #[arg(long, default_value = "false")]
        json: bool,
    },
    /// Inspect the registered diagnostic tasks
    Tasks {
        #[command(subcommand)]
        command: TasksCommands,
    },
}

#[derive(Subcommand)]
pub enum TasksCommands {
    /// List every registered task with its metadata
    List {
        /// Diagnostic target to list tasks for
        #[arg(long, default_value = "cluster")]
        target: String,
    },
}
