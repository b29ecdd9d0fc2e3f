use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::db::{Database, DbPool, SchemaBackend};
use crate::error::MigrateError;

const LEDGER_TABLE: &str = "schema_migrations";
const LOCK_TABLE: &str = "schema_migration_lock";

const CREATE_LEDGER_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    id TEXT PRIMARY KEY,
    description TEXT NOT NULL,
    applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_migration_lock (
    name TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    acquired_at TEXT NOT NULL
);
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationRecord {
    pub id: String,
    pub description: String,
    pub applied_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockHolder {
    pub name: String,
    pub holder: String,
    pub acquired_at: String,
}

/// Durable record of completed migration steps.
///
/// The primary key on `id` is what makes recording safe under concurrency:
/// of any number of writers racing on the same id exactly one row lands.
/// Reads treat missing tables as empty, so only writers need `ensure`.
pub struct Ledger;

impl Ledger {
    pub fn ensure(conn: &Connection) -> Result<(), MigrateError> {
        conn.execute_batch(CREATE_LEDGER_SQL)?;
        Ok(())
    }

    pub fn has_applied(conn: &Connection, id: &str) -> Result<bool, MigrateError> {
        if !conn.has_table(LEDGER_TABLE)? {
            return Ok(false);
        }
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM schema_migrations WHERE id = ?",
                [id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Returns true only for the caller whose row was inserted.
    pub fn record_applied(
        conn: &Connection,
        id: &str,
        description: &str,
        applied_at: DateTime<Utc>,
    ) -> Result<bool, MigrateError> {
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO schema_migrations (id, description, applied_at) VALUES (?, ?, ?)",
            params![id, description, applied_at.to_rfc3339()],
        )?;

        if inserted == 1 {
            info!("Recorded migration '{id}'");
        } else {
            debug!("Migration '{id}' was already recorded");
        }
        Ok(inserted == 1)
    }

    pub fn entries(conn: &Connection) -> Result<Vec<MigrationRecord>, MigrateError> {
        if !conn.has_table(LEDGER_TABLE)? {
            return Ok(Vec::new());
        }
        let mut stmt = conn.prepare(
            "SELECT id, description, applied_at FROM schema_migrations ORDER BY applied_at, id",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(MigrationRecord {
                id: row.get(0)?,
                description: row.get(1)?,
                applied_at: row.get(2)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn lock_holders(conn: &Connection) -> Result<Vec<LockHolder>, MigrateError> {
        if !conn.has_table(LOCK_TABLE)? {
            return Ok(Vec::new());
        }
        let mut stmt = conn
            .prepare("SELECT name, holder, acquired_at FROM schema_migration_lock ORDER BY name")?;

        let rows = stmt.query_map([], |row| {
            Ok(LockHolder {
                name: row.get(0)?,
                holder: row.get(1)?,
                acquired_at: row.get(2)?,
            })
        })?;

        let mut holders = Vec::new();
        for row in rows {
            holders.push(row?);
        }
        Ok(holders)
    }

    /// Operator override for a lock left behind by a process that died.
    pub fn release_lock(conn: &Connection, name: &str) -> Result<bool, MigrateError> {
        if !conn.has_table(LOCK_TABLE)? {
            return Ok(false);
        }
        let removed = conn.execute("DELETE FROM schema_migration_lock WHERE name = ?", [name])?;
        if removed > 0 {
            warn!("Released migration lock '{name}' on operator request");
        }
        Ok(removed > 0)
    }
}

/// Advisory lock row in `schema_migration_lock`, deleted again on drop.
pub struct MigrationLock {
    pool: DbPool,
    name: String,
    holder: String,
}

impl MigrationLock {
    /// Takes the lock row `name`. A row older than `stale_after` is assumed to
    /// belong to a dead process and is taken over.
    pub fn acquire(
        db: &Database,
        name: &str,
        holder: &str,
        stale_after: Option<Duration>,
    ) -> Result<Self, MigrateError> {
        let conn = db.conn()?;

        if !Self::try_insert(&conn, name, holder)? {
            let current: Option<(String, String)> = conn
                .query_row(
                    "SELECT holder, acquired_at FROM schema_migration_lock WHERE name = ?",
                    [name],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let taken_over = match (&current, stale_after) {
                (Some((other, acquired_at)), Some(limit)) if Self::is_stale(acquired_at, limit) => {
                    warn!("Taking over stale migration lock '{name}' held by {other} since {acquired_at}");
                    conn.execute(
                        "DELETE FROM schema_migration_lock WHERE name = ? AND holder = ? AND acquired_at = ?",
                        params![name, other, acquired_at],
                    )?;
                    Self::try_insert(&conn, name, holder)?
                }
                _ => false,
            };

            if !taken_over {
                return Err(MigrateError::LockContention(format!(
                    "lock '{name}' is held by {}",
                    current.map(|(other, _)| other).as_deref().unwrap_or("another process")
                )));
            }
        }

        debug!("Acquired migration lock '{name}' as {holder}");
        Ok(Self {
            pool: db.pool(),
            name: name.to_owned(),
            holder: holder.to_owned(),
        })
    }

    fn try_insert(conn: &Connection, name: &str, holder: &str) -> Result<bool, MigrateError> {
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO schema_migration_lock (name, holder, acquired_at) VALUES (?, ?, ?)",
            params![name, holder, Utc::now().to_rfc3339()],
        )?;
        Ok(inserted == 1)
    }

    fn is_stale(acquired_at: &str, limit: Duration) -> bool {
        match DateTime::parse_from_rfc3339(acquired_at) {
            Ok(at) => (Utc::now() - at.with_timezone(&Utc))
                .to_std()
                .is_ok_and(|age| age >= limit),
            Err(_) => false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn release(&self) -> Result<(), MigrateError> {
        let conn = self.pool.get()?;
        conn.execute(
            "DELETE FROM schema_migration_lock WHERE name = ? AND holder = ?",
            params![self.name, self.holder],
        )?;
        Ok(())
    }
}

impl Drop for MigrationLock {
    fn drop(&mut self) {
        match self.release() {
            Ok(()) => debug!("Released migration lock '{}'", self.name),
            Err(e) => warn!("Failed to release migration lock '{}': {}", self.name, e),
        }
    }
}
