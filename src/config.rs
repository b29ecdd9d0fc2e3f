use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::executor::ExecOptions;
use crate::runner::MigrateOptions;
use crate::schema::ConcluidasLayout;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub level: String,
    pub directory: Option<PathBuf>,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const DEFAULT_LEVEL: &str = "info";

    fn default() -> Self {
        LoggingConfig {
            level: Self::DEFAULT_LEVEL.to_owned(),
            directory: None,
        }
    }

    fn ensure_valid(&mut self) {
        let original = self.level.clone();
        self.level = self.level.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&self.level.as_str()) {
            eprintln!(
                "Config error: log level of '{}' is invalid - using default of '{}'",
                original,
                Self::DEFAULT_LEVEL
            );
            self.level = Self::DEFAULT_LEVEL.to_owned();
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub pool_size: u32,
}

impl DatabaseConfig {
    const DEFAULT_POOL_SIZE: u32 = 4;

    fn default() -> Self {
        DatabaseConfig {
            path: PathBuf::from("prazos.db"),
            pool_size: Self::DEFAULT_POOL_SIZE,
        }
    }

    fn ensure_valid(&mut self) {
        if self.pool_size == 0 {
            eprintln!(
                "Config error: pool_size of 0 is invalid - using default of {}",
                Self::DEFAULT_POOL_SIZE
            );
            self.pool_size = Self::DEFAULT_POOL_SIZE;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MigrationConfig {
    pub timeout_per_operation_secs: u64,
    pub fail_fast: bool,
    pub lock_retries: u32,
    pub lock_backoff_ms: u64,
    /// A lock row older than this is taken over; 0 never does
    pub stale_lock_secs: u64,
    pub parallel_tables: bool,
    /// Kept as text so a typo degrades to the default instead of failing the load
    pub concluidas_layout: String,
}

impl MigrationConfig {
    const LAYOUTS: [&str; 2] = ["current", "legacy"];
    const DEFAULT_LAYOUT: &str = "current";
    const DEFAULT_TIMEOUT_SECS: u64 = 30;

    fn default() -> Self {
        MigrationConfig {
            timeout_per_operation_secs: Self::DEFAULT_TIMEOUT_SECS,
            fail_fast: true,
            lock_retries: 5,
            lock_backoff_ms: 200,
            stale_lock_secs: 3600,
            parallel_tables: false,
            concluidas_layout: Self::DEFAULT_LAYOUT.to_owned(),
        }
    }

    pub fn layout(&self) -> ConcluidasLayout {
        match self.concluidas_layout.as_str() {
            "legacy" => ConcluidasLayout::Legacy,
            _ => ConcluidasLayout::Current,
        }
    }

    pub fn migrate_options(&self) -> MigrateOptions {
        MigrateOptions {
            exec: ExecOptions {
                timeout_per_operation: Duration::from_secs(self.timeout_per_operation_secs),
                fail_fast: self.fail_fast,
            },
            lock_retries: self.lock_retries,
            lock_backoff: Duration::from_millis(self.lock_backoff_ms),
            stale_lock_after: (self.stale_lock_secs > 0)
                .then(|| Duration::from_secs(self.stale_lock_secs)),
            parallel_tables: self.parallel_tables,
            dry_run: false,
            table: None,
        }
    }

    fn ensure_valid(&mut self) {
        let original = self.concluidas_layout.clone();
        self.concluidas_layout = self.concluidas_layout.trim().to_ascii_lowercase();
        if !Self::LAYOUTS.contains(&self.concluidas_layout.as_str()) {
            eprintln!(
                "Config error: concluidas_layout of '{}' is invalid - using default of '{}'",
                original,
                Self::DEFAULT_LAYOUT
            );
            self.concluidas_layout = Self::DEFAULT_LAYOUT.to_owned();
        }

        if self.timeout_per_operation_secs == 0 {
            eprintln!(
                "Config error: timeout_per_operation_secs of 0 is invalid - using default of {}",
                Self::DEFAULT_TIMEOUT_SECS
            );
            self.timeout_per_operation_secs = Self::DEFAULT_TIMEOUT_SECS;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub database: DatabaseConfig,
    pub migration: MigrationConfig,
    pub logging: LoggingConfig,
}

impl Config {
    const ENV_PREFIX: &str = "PRAZOS_";

    pub fn default_config() -> Self {
        Config {
            database: DatabaseConfig::default(),
            migration: MigrationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Where the config file lives when `--config` is not given.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "prazos-schema")
            .map(|dirs| dirs.data_local_dir().join("config.toml"))
    }

    /// Loads defaults, then the TOML file, then `PRAZOS_*` environment variables.
    /// If the file is missing the defaults are written there first; if loading
    /// fails, defaults are used.
    pub fn load_config(config_path: &Path) -> Self {
        let default_config = Self::default_config();

        if !config_path.exists() {
            Self::write_default(config_path, &default_config);
        }

        let figment = Figment::from(Serialized::defaults(default_config.clone()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed(Self::ENV_PREFIX).split("__"));

        let mut config = figment.extract().unwrap_or_else(|err| {
            eprintln!(
                "Could not load config file {}: {}. Using default configuration.",
                config_path.display(),
                err
            );
            default_config
        });

        config.ensure_valid();

        config
    }

    fn write_default(config_path: &Path, default_config: &Config) {
        if let Some(parent) = config_path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                eprintln!(
                    "Failed to create configuration directory {}: {}",
                    parent.display(),
                    e
                );
            }
        }
        if let Ok(toml_string) = toml::to_string_pretty(default_config) {
            if let Err(e) = fs::write(config_path, toml_string) {
                eprintln!(
                    "Failed to write default config to {}: {}",
                    config_path.display(),
                    e
                );
            }
        } else {
            eprintln!("Failed to serialize default config.");
        }
    }

    fn ensure_valid(&mut self) {
        self.database.ensure_valid();
        self.migration.ensure_valid();
        self.logging.ensure_valid();
    }
}
