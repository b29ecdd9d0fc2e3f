use std::io::{self, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::info;

use crate::config::Config;
use crate::db::Database;
use crate::error::MigrateError;
use crate::executor::CancelToken;
use crate::ledger::Ledger;
use crate::migrations::{self, MigrationStep};
use crate::reports::Reports;
use crate::runner::{Migrator, LOCK_NAME};
use crate::schema::{validate_identifier, ColumnSpec, ColumnType, LogicalTable};

#[derive(Parser)]
#[command(
    name = "prazos-schema",
    version,
    about = "Brings the prazos deadline database to its current schema"
)]
pub struct Cli {
    /// SQLite database file (overrides `database.path`)
    #[arg(long = "db", global = true)]
    pub db: Option<PathBuf>,

    /// Configuration file (default: config.toml in the local data directory)
    #[arg(long = "config", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Apply every pending migration step
    Apply {
        /// Plan only, print the SQL that would run
        #[arg(long = "dry-run", default_value_t = false)]
        dry_run: bool,

        /// Only touch this table (andamentos, publicacoes, financeiro, concluidas, last_checked, agenda)
        #[arg(long = "table", value_parser = parse_table)]
        table: Option<LogicalTable>,

        /// Print the run report as JSON
        #[arg(long = "json", default_value_t = false)]
        json: bool,
    },

    /// Show what `apply` would do without changing anything
    Plan {
        #[arg(long = "table", value_parser = parse_table)]
        table: Option<LogicalTable>,

        #[arg(long = "json", default_value_t = false)]
        json: bool,
    },

    /// List applied and pending steps and any held locks
    Status {
        #[arg(long = "json", default_value_t = false)]
        json: bool,

        /// Remove the migration lock left behind by a run that died
        #[arg(long = "release-lock", default_value_t = false)]
        release_lock: bool,
    },

    /// Add a single column to an existing table if it is missing
    #[command(name = "add-column")]
    AddColumn {
        #[arg(long = "table", value_parser = parse_table)]
        table: LogicalTable,

        /// Column name (ASCII letters, digits and '_')
        #[arg(long = "name", value_parser = parse_column_name)]
        name: String,

        /// TEXT, DATE or INTEGER
        #[arg(long = "type", value_parser = parse_column_type)]
        column_type: ColumnType,

        #[arg(long = "not-null", default_value_t = false)]
        not_null: bool,
    },
}

fn parse_table(value: &str) -> Result<LogicalTable, String> {
    LogicalTable::from_str(value.trim()).map_err(|_| format!("unknown table '{value}'"))
}

fn parse_column_name(value: &str) -> Result<String, String> {
    validate_identifier(value)
        .map(|_| value.to_owned())
        .map_err(|e| e.to_string())
}

fn parse_column_type(value: &str) -> Result<ColumnType, String> {
    ColumnType::from_cli(value).ok_or_else(|| format!("unsupported column type '{value}'"))
}

impl Cli {
    pub fn load_config(&self) -> Config {
        match self.config.clone().or_else(Config::default_path) {
            Some(path) => Config::load_config(&path),
            None => {
                eprintln!("Could not determine a config directory. Using default configuration.");
                Config::default_config()
            }
        }
    }

    /// Runs the chosen command. `Ok(false)` means the command ran but some
    /// table did not converge.
    pub fn handle_command_line(
        &self,
        config: &Config,
        cancel: &CancelToken,
    ) -> Result<bool, MigrateError> {
        let db_path = self.db.clone().unwrap_or_else(|| config.database.path.clone());
        let db = Database::open(
            &db_path,
            config.database.pool_size,
            Duration::from_secs(config.migration.timeout_per_operation_secs),
        )?;
        info!("Using database {}", db.path().display());
        let steps = migrations::catalog(config.migration.layout())?;
        let mut out = io::stdout().lock();

        match &self.command {
            Command::Apply {
                dry_run,
                table,
                json,
            } => Self::apply(&db, config, cancel, &steps, *dry_run, *table, *json, &mut out),
            Command::Plan { table, json } => {
                Self::apply(&db, config, cancel, &steps, true, *table, *json, &mut out)
            }
            Command::Status { json, release_lock } => {
                Self::status(&db, &steps, *json, *release_lock, &mut out)
            }
            Command::AddColumn {
                table,
                name,
                column_type,
                not_null,
            } => {
                let mut column = ColumnSpec::new(name.as_str(), *column_type);
                if *not_null {
                    column = column.not_null();
                }
                info!("Operator add-column {table}.{name} {column_type}");

                let migrator = Migrator::new(&db, config.migration.migrate_options(), cancel.clone());
                let report = migrator.add_column(*table, column)?;
                Reports::write_table(&mut out, &report)?;
                Ok(report.is_success())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply<W: io::Write>(
        db: &Database,
        config: &Config,
        cancel: &CancelToken,
        steps: &[MigrationStep],
        dry_run: bool,
        table: Option<LogicalTable>,
        json: bool,
        out: &mut W,
    ) -> Result<bool, MigrateError> {
        let mut options = config.migration.migrate_options();
        options.dry_run = dry_run;
        options.table = table;

        let report = Migrator::new(db, options, cancel.clone()).run(steps)?;

        if json {
            Reports::write_json(out, &report)?;
        } else {
            Reports::write_run(out, &report)?;
        }
        Ok(report.is_success())
    }

    fn status<W: io::Write>(
        db: &Database,
        steps: &[MigrationStep],
        json: bool,
        release_lock: bool,
        out: &mut W,
    ) -> Result<bool, MigrateError> {
        let conn = db.conn()?;

        let released = release_lock && Ledger::release_lock(&conn, LOCK_NAME)?;
        if release_lock && !json {
            if released {
                writeln!(out, "Released migration lock '{LOCK_NAME}'")?;
            } else {
                writeln!(out, "Migration lock '{LOCK_NAME}' was not held")?;
            }
        }

        let entries = Ledger::entries(&conn)?;
        let locks = Ledger::lock_holders(&conn)?;
        let pending: Vec<&MigrationStep> = steps
            .iter()
            .filter(|s| !entries.iter().any(|e| e.id == s.id))
            .collect();

        if json {
            let pending_ids: Vec<&str> = pending.iter().map(|s| s.id).collect();
            let value = serde_json::json!({
                "applied": entries,
                "pending": pending_ids,
                "locks": locks,
                "released_lock": released,
            });
            Reports::write_json(out, &value)?;
        } else {
            Reports::write_status(out, &entries, &pending, &locks)?;
        }
        Ok(true)
    }
}
