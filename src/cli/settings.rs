//! User-level settings.
//!
//! Read from `~/.clusterdoc/config.toml`, overridable through environment
//! variables prefixed with `CLUSTERDOC__` (e.g.
//! `CLUSTERDOC__CHECK__MAX_WORKERS=8`). Every field has a default so a
//! missing config file is fine.

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use super::logger::LoggerSettings;

const CONFIG_FILE: &str = "config.toml";

pub fn user_directory() -> PathBuf {
    let home = home::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(".clusterdoc")
}

pub fn setup_user_directory() -> Result<(), std::io::Error> {
    std::fs::create_dir_all(user_directory())
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub logger: LoggerSettings,
    #[serde(default)]
    pub check: CheckSettings,
}

#[derive(Deserialize, Debug, Clone)]
pub struct CheckSettings {
    /// Worker-pool upper bound; a run never uses more workers than tasks.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_ssh_max_per_key")]
    pub ssh_max_per_key: usize,
    #[serde(default = "default_ssh_idle_timeout_secs")]
    pub ssh_idle_timeout_secs: u64,
    #[serde(default = "default_db_pool_size")]
    pub db_pool_size: usize,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,
}

impl Default for CheckSettings {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            ssh_max_per_key: default_ssh_max_per_key(),
            ssh_idle_timeout_secs: default_ssh_idle_timeout_secs(),
            db_pool_size: default_db_pool_size(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
        }
    }
}

impl CheckSettings {
    pub fn ssh_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_idle_timeout_secs)
    }

    pub fn db_acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.db_acquire_timeout_secs)
    }
}

fn default_max_workers() -> usize {
    4
}

fn default_ssh_max_per_key() -> usize {
    5
}

fn default_ssh_idle_timeout_secs() -> u64 {
    300
}

fn default_db_pool_size() -> usize {
    10
}

fn default_db_acquire_timeout_secs() -> u64 {
    30
}

pub fn read_settings() -> Result<Settings, ConfigError> {
    let config_file = user_directory().join(CONFIG_FILE);

    Config::builder()
        .add_source(File::from(config_file).required(false))
        .add_source(Environment::with_prefix("CLUSTERDOC").separator("__"))
        .build()?
        .try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_field() {
        let settings = Settings::default();
        assert_eq!(settings.check.max_workers, 4);
        assert_eq!(settings.check.ssh_max_per_key, 5);
        assert_eq!(settings.check.db_pool_size, 10);
        assert_eq!(settings.check.ssh_idle_timeout(), Duration::from_secs(300));
        assert_eq!(settings.check.db_acquire_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn deserializes_partial_config() {
        let settings: Settings = toml::from_str(
            r#"
[check]
max_workers = 8
"#,
        )
        .unwrap();
        assert_eq!(settings.check.max_workers, 8);
        assert_eq!(settings.check.db_pool_size, 10);
    }
}
