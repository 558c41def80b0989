//! Logging setup built on `tracing-subscriber`.
//!
//! An `EnvFilter` layer gives `RUST_LOG` the final say over filtering; the
//! configured level is only the fallback. Logs go to a date-named file in
//! `~/.clusterdoc` by default, or to stdout when `logger.stdout` is set, in
//! text or JSON format. Files older than the retention window are removed on
//! startup.

use std::sync::Arc;

use serde::Deserialize;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use super::settings::user_directory;

/// Date format for log file names: YYYY-MM-DD-cli.log
const LOG_FILE_DATE_FORMAT: &str = "%Y-%m-%d-cli.log";
const LOG_RETENTION_DAYS: i64 = 7;

#[derive(Deserialize, Debug, Clone, Default)]
pub enum LoggerLevel {
    #[serde(alias = "DEBUG", alias = "debug")]
    Debug,
    #[default]
    #[serde(alias = "INFO", alias = "info")]
    Info,
    #[serde(alias = "WARN", alias = "warn")]
    Warn,
    #[serde(alias = "ERROR", alias = "error")]
    Error,
}

impl LoggerLevel {
    pub fn to_tracing_level(&self) -> LevelFilter {
        match self {
            LoggerLevel::Debug => LevelFilter::DEBUG,
            LoggerLevel::Info => LevelFilter::INFO,
            LoggerLevel::Warn => LevelFilter::WARN,
            LoggerLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub enum LogFormat {
    Json,
    #[default]
    Text,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct LoggerSettings {
    #[serde(default)]
    pub level: LoggerLevel,
    /// Log to stdout instead of the daily file.
    #[serde(default)]
    pub stdout: bool,
    #[serde(default)]
    pub format: LogFormat,
}

fn log_file() -> Option<std::fs::File> {
    let path = user_directory().join(chrono::Local::now().format(LOG_FILE_DATE_FORMAT).to_string());
    match std::fs::OpenOptions::new().append(true).create(true).open(&path) {
        Ok(file) => Some(file),
        Err(e) => {
            eprintln!("could not open log file {}: {e}", path.display());
            None
        }
    }
}

/// Remove log files past the retention window. Best-effort.
fn delete_old_log_files() {
    let Ok(entries) = std::fs::read_dir(user_directory()) else {
        return;
    };
    let cutoff = chrono::Local::now() - chrono::Duration::days(LOG_RETENTION_DAYS);
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.ends_with("-cli.log") {
            continue;
        }
        let Some(date_part) = name.strip_suffix("-cli.log") else {
            continue;
        };
        let Ok(date) = chrono::NaiveDate::parse_from_str(date_part, "%Y-%m-%d") else {
            continue;
        };
        if date < cutoff.date_naive() {
            let _ = std::fs::remove_file(entry.path());
        }
    }
}

pub fn setup_logging(settings: &LoggerSettings) {
    delete_old_log_files();

    // RUST_LOG wins when set; otherwise fall back to the configured level.
    let filter = EnvFilter::builder()
        .with_default_directive(settings.level.to_tracing_level().into())
        .from_env_lossy();

    let to_stdout = settings.stdout;
    let file = if to_stdout { None } else { log_file() };

    macro_rules! init_with_writer {
        ($writer:expr) => {
            if settings.format == LogFormat::Json {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_writer($writer),
                    )
                    .init();
            } else {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_ansi(to_stdout)
                            .with_writer($writer),
                    )
                    .init();
            }
        };
    }

    match file {
        Some(file) => init_with_writer!(Arc::new(file)),
        None => init_with_writer!(std::io::stdout),
    }
}
