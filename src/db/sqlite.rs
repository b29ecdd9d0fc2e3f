use std::time::Duration;

use log::trace;
use rusqlite::{Connection, OptionalExtension};

use super::{LiveColumn, LiveIndex, SchemaBackend};
use crate::error::MigrateError;

impl SchemaBackend for Connection {
    fn has_table(&self, table: &str) -> Result<bool, MigrateError> {
        let count: i64 = self.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
            [table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn live_columns(&self, table: &str) -> Result<Option<Vec<LiveColumn>>, MigrateError> {
        if !self.has_table(table)? {
            return Ok(None);
        }

        let mut stmt = self.prepare(
            "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?) ORDER BY cid",
        )?;

        let rows = stmt.query_map([table], |row| {
            Ok(LiveColumn {
                name: row.get(0)?,
                declared_type: row.get(1)?,
                not_null: row.get::<_, i64>(2)? != 0,
                primary_key: row.get::<_, i64>(3)? != 0,
            })
        })?;

        let mut columns = Vec::new();
        for row in rows {
            columns.push(row?);
        }

        trace!("Introspected {} columns on {}", columns.len(), table);
        Ok(Some(columns))
    }

    fn live_index(&self, name: &str) -> Result<Option<LiveIndex>, MigrateError> {
        let header: Option<(String, Option<String>)> = self
            .query_row(
                "SELECT tbl_name, sql FROM sqlite_master WHERE type = 'index' AND name = ?",
                [name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((table, sql)) = header else {
            return Ok(None);
        };

        let mut stmt = self.prepare("SELECT name FROM pragma_index_info(?) ORDER BY seqno")?;
        let rows = stmt.query_map([name], |row| row.get::<_, Option<String>>(0))?;

        let mut columns = Vec::new();
        for row in rows {
            // Expression index columns have no name
            columns.push(row?.unwrap_or_default());
        }

        let unique = sql
            .map(|s| s.trim_start().to_ascii_uppercase().starts_with("CREATE UNIQUE"))
            .unwrap_or(true);

        Ok(Some(LiveIndex {
            name: name.to_owned(),
            table,
            columns,
            unique,
        }))
    }

    fn index_definitions(&self, table: &str) -> Result<Vec<String>, MigrateError> {
        let mut stmt = self.prepare(
            "SELECT sql FROM sqlite_master WHERE type = 'index' AND tbl_name = ? AND sql IS NOT NULL ORDER BY name",
        )?;
        let rows = stmt.query_map([table], |row| row.get::<_, String>(0))?;

        let mut definitions = Vec::new();
        for row in rows {
            definitions.push(row?);
        }
        Ok(definitions)
    }

    fn execute_ddl(&self, sql: &str) -> Result<(), MigrateError> {
        self.execute_batch(sql)?;
        Ok(())
    }

    fn execute_atomic(&self, statements: &[String]) -> Result<(), MigrateError> {
        // Rolled back on drop if any statement fails
        let tx = self.unchecked_transaction()?;
        for sql in statements {
            tx.execute_batch(sql)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn set_operation_timeout(&self, timeout: Duration) -> Result<(), MigrateError> {
        self.busy_timeout(timeout)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE andamentos (
                id BIGINT PRIMARY KEY,
                data DATE,
                numero_processo TEXT NOT NULL
            );
            CREATE INDEX ix_andamentos_numero_processo ON andamentos (numero_processo);
            CREATE UNIQUE INDEX ux_andamentos_data ON andamentos (data, numero_processo);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_table_exists() {
        let conn = conn();
        assert!(conn.has_table("andamentos").unwrap());
        assert!(!conn.has_table("publicacoes").unwrap());
    }

    #[test]
    fn test_columns() {
        let conn = conn();
        let cols = conn.live_columns("andamentos").unwrap().unwrap();
        assert_eq!(cols.len(), 3);
        assert_eq!(
            cols[0],
            LiveColumn {
                name: "id".into(),
                declared_type: "BIGINT".into(),
                not_null: false,
                primary_key: true,
            }
        );
        assert!(cols[2].not_null);
        assert!(conn.live_columns("agenda").unwrap().is_none());
        assert_eq!(
            conn.live_column("andamentos", "data").unwrap().map(|c| c.declared_type),
            Some("DATE".to_string())
        );
        assert!(conn.live_column("andamentos", "processo").unwrap().is_none());
    }

    #[test]
    fn test_index_introspection() {
        let conn = conn();
        let ix = conn.live_index("ix_andamentos_numero_processo").unwrap().unwrap();
        assert_eq!(ix.table, "andamentos");
        assert_eq!(ix.columns, vec!["numero_processo".to_string()]);
        assert!(!ix.unique);

        let ux = conn.live_index("ux_andamentos_data").unwrap().unwrap();
        assert!(ux.unique);
        assert_eq!(ux.columns, vec!["data".to_string(), "numero_processo".to_string()]);

        assert!(conn.live_index("idx_missing").unwrap().is_none());
    }

    #[test]
    fn test_index_definitions_skip_autoindexes() {
        let conn = conn();
        conn.execute_batch("CREATE TABLE last_checked (scope TEXT PRIMARY KEY, ts TEXT)")
            .unwrap();

        let defs = conn.index_definitions("andamentos").unwrap();
        assert_eq!(defs.len(), 2);
        assert!(defs[0].starts_with("CREATE INDEX ix_andamentos_numero_processo"));
        assert!(defs[1].starts_with("CREATE UNIQUE INDEX ux_andamentos_data"));
        assert!(conn.index_definitions("last_checked").unwrap().is_empty());
    }

    #[test]
    fn test_execute_atomic_rolls_back() {
        let conn = conn();
        let result = conn.execute_atomic(&[
            "ALTER TABLE andamentos ADD COLUMN setor TEXT".to_string(),
            "ALTER TABLE missing ADD COLUMN x TEXT".to_string(),
        ]);
        assert!(result.is_err());
        assert!(conn.live_column("andamentos", "setor").unwrap().is_none());
        assert!(conn.is_autocommit());

        conn.execute_atomic(&["ALTER TABLE andamentos ADD COLUMN setor TEXT".to_string()])
            .unwrap();
        assert!(conn.live_column("andamentos", "setor").unwrap().is_some());
    }

    #[test]
    fn test_rename_updates_index_columns() {
        let conn = conn();
        conn.execute_ddl("ALTER TABLE andamentos RENAME COLUMN numero_processo TO processo")
            .unwrap();
        let ix = conn.live_index("ix_andamentos_numero_processo").unwrap().unwrap();
        assert_eq!(ix.columns, vec!["processo".to_string()]);
    }
}
