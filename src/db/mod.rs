mod sqlite;

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

use crate::error::MigrateError;
use crate::schema::IndexSpec;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// A column as the live database reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveColumn {
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
    pub primary_key: bool,
}

/// An index as the live database reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveIndex {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

impl LiveIndex {
    pub fn matches(&self, spec: &IndexSpec) -> bool {
        self.table == spec.table.table_name()
            && self.columns == spec.columns
            && self.unique == spec.unique
    }

    pub fn describe(&self) -> String {
        format!(
            "{}{} ON {} ({})",
            if self.unique { "UNIQUE " } else { "" },
            self.name,
            self.table,
            self.columns.join(", ")
        )
    }
}

/// What the engine needs from the database: introspection plus DDL execution.
///
/// Each DDL statement stands on its own except for `execute_atomic`, which
/// commits its statements together or not at all.
pub trait SchemaBackend {
    fn has_table(&self, table: &str) -> Result<bool, MigrateError>;

    /// `None` when the table does not exist.
    fn live_columns(&self, table: &str) -> Result<Option<Vec<LiveColumn>>, MigrateError>;

    fn live_index(&self, name: &str) -> Result<Option<LiveIndex>, MigrateError>;

    /// `CREATE INDEX` statements of the explicitly created indexes on `table`.
    fn index_definitions(&self, table: &str) -> Result<Vec<String>, MigrateError>;

    fn execute_ddl(&self, sql: &str) -> Result<(), MigrateError>;

    fn execute_atomic(&self, statements: &[String]) -> Result<(), MigrateError>;

    /// Upper bound on how long the next statement may wait for the database.
    fn set_operation_timeout(&self, timeout: Duration) -> Result<(), MigrateError>;

    fn live_column(&self, table: &str, column: &str) -> Result<Option<LiveColumn>, MigrateError> {
        Ok(self
            .live_columns(table)?
            .and_then(|cols| cols.into_iter().find(|c| c.name == column)))
    }
}

pub struct Database {
    pool: DbPool,
    path: PathBuf,
}

impl Database {
    pub fn open(path: &Path, pool_size: u32, busy_timeout: Duration) -> Result<Self, MigrateError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                return Err(MigrateError::ConnectivityFailure(format!(
                    "Database folder '{}' does not exist or is not a directory",
                    parent.display()
                )));
            }
        }

        let manager = SqliteConnectionManager::file(path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.pragma_update(None, "foreign_keys", "ON")
        });

        let pool = Pool::builder().max_size(pool_size).build(manager)?;
        info!("Database opened at: {}", path.display());

        Ok(Self {
            pool,
            path: path.to_owned(),
        })
    }

    pub fn pool(&self) -> DbPool {
        self.pool.clone()
    }

    pub fn conn(&self) -> Result<DbConnection, MigrateError> {
        Ok(self.pool.get()?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
