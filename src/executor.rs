use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn, Level};
use logging_timer::timer;
use serde::Serialize;

use crate::db::SchemaBackend;
use crate::error::MigrateError;
use crate::ops::{Operation, OperationResult, OperationSet, Outcome};
use crate::schema::LogicalTable;

#[derive(Debug, Clone, Copy)]
pub struct ExecOptions {
    pub timeout_per_operation: Duration,
    pub fail_fast: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout_per_operation: Duration::from_secs(30),
            fail_fast: true,
        }
    }
}

/// Shared cancellation flag. Checked between operations, never mid-statement.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// What happened to one table's operation set.
#[derive(Debug, Clone, Serialize)]
pub struct TableReport {
    pub table: LogicalTable,
    pub results: Vec<OperationResult>,
    /// Remaining operations were not started after a failure
    pub halted: bool,
    pub cancelled: bool,
    /// Planning failed, so nothing was executed
    pub plan_error: Option<String>,
}

impl TableReport {
    pub fn new(table: LogicalTable) -> Self {
        Self {
            table,
            results: Vec::new(),
            halted: false,
            cancelled: false,
            plan_error: None,
        }
    }

    pub fn from_plan_error(table: LogicalTable, err: &MigrateError) -> Self {
        let mut report = Self::new(table);
        report.plan_error = Some(format!("[{}] {}", err.kind(), err));
        report
    }

    pub fn applied(&self) -> usize {
        self.count(|o| *o == Outcome::Applied)
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| *o == Outcome::SkippedAlreadySatisfied)
    }

    pub fn failed(&self) -> usize {
        self.count(Outcome::is_failed) + usize::from(self.plan_error.is_some())
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0 && !self.cancelled
    }

    fn count<F: Fn(&Outcome) -> bool>(&self, pred: F) -> usize {
        self.results.iter().filter(|r| pred(&r.outcome)).count()
    }
}

pub struct Executor {
    options: ExecOptions,
    cancel: CancelToken,
}

impl Executor {
    pub fn new(options: ExecOptions, cancel: CancelToken) -> Self {
        Self { options, cancel }
    }

    /// Apply `ops` in order. Each operation commits on its own; a failure does
    /// not undo earlier ones, and a re-run skips whatever is already in place.
    pub fn execute(
        &self,
        backend: &dyn SchemaBackend,
        table: LogicalTable,
        ops: &OperationSet,
    ) -> TableReport {
        let mut report = TableReport::new(table);

        for op in ops {
            if self.cancel.is_cancelled() {
                warn!("{table}: cancelled before '{op}'");
                report.cancelled = true;
                break;
            }

            let start = Instant::now();
            let outcome = match self.apply(backend, op) {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!("{table}: '{op}' failed: {err}");
                    Outcome::failed(&err)
                }
            };

            let failed = outcome.is_failed();
            report.results.push(OperationResult {
                operation: op.clone(),
                outcome,
                elapsed: start.elapsed(),
            });

            if failed && self.options.fail_fast {
                report.halted = true;
                break;
            }
        }

        report
    }

    fn apply(&self, backend: &dyn SchemaBackend, op: &Operation) -> Result<Outcome, MigrateError> {
        let _tmr = timer!(Level::Trace; "Executor::apply", "{}", op);

        let table = op.table();
        let table_name = table.table_name();

        let satisfied = match op {
            Operation::CreateTable(_) => backend.has_table(table_name)?,
            Operation::AddColumnIfAbsent { column, .. } => {
                Self::require_table(backend, table)?;
                backend.live_column(table_name, &column.name)?.is_some()
            }
            Operation::DropColumnIfPresent { column, .. } => {
                Self::require_table(backend, table)?;
                backend.live_column(table_name, column)?.is_none()
            }
            Operation::RenameColumn { mapping, .. } => {
                Self::require_table(backend, table)?;
                let has_from = backend.live_column(table_name, &mapping.from)?.is_some();
                let has_to = backend.live_column(table_name, &mapping.to)?.is_some();
                if has_from && has_to {
                    return Err(MigrateError::OperationFailed(format!(
                        "cannot rename {table}.{} to '{}': both columns exist",
                        mapping.from, mapping.to
                    )));
                }
                !has_from
            }
            Operation::CreateIndexIfAbsent(index) => match backend.live_index(&index.name)? {
                Some(live) if live.matches(index) => true,
                Some(live) => {
                    return Err(MigrateError::IndexDefinitionConflict {
                        name: index.name.clone(),
                        existing: live.describe(),
                        wanted: index.to_string(),
                    })
                }
                None => {
                    Self::require_table(backend, table)?;
                    false
                }
            },
            Operation::RebuildTable { target, .. } => {
                Self::require_table(backend, table)?;
                let mut satisfied = true;
                for column in target.columns().iter().filter(|c| c.requires_rebuild()) {
                    satisfied &= backend.live_column(table_name, &column.name)?.is_some();
                }
                satisfied
            }
        };

        if satisfied {
            debug!("{table}: '{op}' already satisfied");
            return Ok(Outcome::SkippedAlreadySatisfied);
        }

        backend.set_operation_timeout(self.options.timeout_per_operation)?;
        if let Operation::RebuildTable { .. } = op {
            // Dropping the old table takes its indexes along; recreate them on the new one
            let mut statements = op.rebuild_statements();
            statements.extend(backend.index_definitions(table_name)?);
            backend.execute_atomic(&statements)?;
        } else {
            backend.execute_ddl(&op.to_sql())?;
        }
        info!("{table}: {op}");
        Ok(Outcome::Applied)
    }

    fn require_table(backend: &dyn SchemaBackend, table: LogicalTable) -> Result<(), MigrateError> {
        if backend.has_table(table.table_name())? {
            Ok(())
        } else {
            Err(MigrateError::TableNotFound(table.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{LiveColumn, LiveIndex};
    use crate::ops::CarriedColumn;
    use crate::schema::{deadline_table, ColumnSpec, ColumnType, IndexSpec, RenameMapping};
    use rusqlite::Connection;

    /// Delegates to SQLite but refuses DDL containing `poison`.
    struct Faulty<'a> {
        inner: &'a Connection,
        poison: &'static str,
    }

    impl SchemaBackend for Faulty<'_> {
        fn has_table(&self, table: &str) -> Result<bool, MigrateError> {
            self.inner.has_table(table)
        }
        fn live_columns(&self, table: &str) -> Result<Option<Vec<LiveColumn>>, MigrateError> {
            self.inner.live_columns(table)
        }
        fn live_index(&self, name: &str) -> Result<Option<LiveIndex>, MigrateError> {
            self.inner.live_index(name)
        }
        fn index_definitions(&self, table: &str) -> Result<Vec<String>, MigrateError> {
            self.inner.index_definitions(table)
        }
        fn execute_ddl(&self, sql: &str) -> Result<(), MigrateError> {
            if sql.contains(self.poison) {
                return Err(MigrateError::PermissionDenied(format!("refused: {sql}")));
            }
            self.inner.execute_ddl(sql)
        }
        fn execute_atomic(&self, statements: &[String]) -> Result<(), MigrateError> {
            if let Some(sql) = statements.iter().find(|s| s.contains(self.poison)) {
                return Err(MigrateError::PermissionDenied(format!("refused: {sql}")));
            }
            self.inner.execute_atomic(statements)
        }
        fn set_operation_timeout(&self, timeout: Duration) -> Result<(), MigrateError> {
            self.inner.set_operation_timeout(timeout)
        }
    }

    fn legacy() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE andamentos (id INTEGER PRIMARY KEY AUTOINCREMENT, data DATE, col_b TEXT)",
        )
        .unwrap();
        conn
    }

    fn ops() -> OperationSet {
        let table = LogicalTable::Andamentos;
        vec![
            Operation::RenameColumn {
                table,
                mapping: RenameMapping::new("data", "inicio_prazo"),
            },
            Operation::DropColumnIfPresent {
                table,
                column: "col_b".into(),
            },
            Operation::AddColumnIfAbsent {
                table,
                column: ColumnSpec::new("processo", ColumnType::Text),
            },
            Operation::CreateIndexIfAbsent(IndexSpec::new(
                "idx_andamentos_processo",
                table,
                &["processo"],
            )),
        ]
        .into_iter()
        .collect()
    }

    fn executor() -> Executor {
        Executor::new(ExecOptions::default(), CancelToken::new())
    }

    #[test]
    fn test_execute_then_rerun_skips_everything() {
        let conn = legacy();
        let first = executor().execute(&conn, LogicalTable::Andamentos, &ops());
        assert_eq!(first.applied(), 4);
        assert!(first.is_success());

        let second = executor().execute(&conn, LogicalTable::Andamentos, &ops());
        assert_eq!(second.applied(), 0);
        assert_eq!(second.skipped(), 4);

        let names: Vec<String> = conn
            .live_columns("andamentos")
            .unwrap()
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["id", "inicio_prazo", "processo"]);
    }

    #[test]
    fn test_absent_rename_source_is_skipped() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE andamentos (id INTEGER PRIMARY KEY)")
            .unwrap();
        let set: OperationSet = vec![Operation::RenameColumn {
            table: LogicalTable::Andamentos,
            mapping: RenameMapping::new("numero_processo", "processo"),
        }]
        .into_iter()
        .collect();

        let report = executor().execute(&conn, LogicalTable::Andamentos, &set);
        assert_eq!(report.results[0].outcome, Outcome::SkippedAlreadySatisfied);
    }

    #[test]
    fn test_rename_with_both_columns_fails() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE andamentos (id INTEGER PRIMARY KEY, data DATE, inicio_prazo DATE)")
            .unwrap();
        let report = executor().execute(&conn, LogicalTable::Andamentos, &ops());
        assert!(report.halted);
        assert_eq!(report.results.len(), 1);
        assert!(matches!(
            report.results[0].outcome,
            Outcome::Failed { kind: crate::error::ErrorKind::OperationFailed, .. }
        ));
    }

    #[test]
    fn test_missing_table_fails_with_table_not_found() {
        let conn = Connection::open_in_memory().unwrap();
        let report = executor().execute(&conn, LogicalTable::Andamentos, &ops());
        assert!(report.halted);
        assert!(matches!(
            report.results[0].outcome,
            Outcome::Failed { kind: crate::error::ErrorKind::TableNotFound, .. }
        ));
    }

    #[test]
    fn test_fail_fast_halts_and_keeps_completed() {
        let conn = legacy();
        let faulty = Faulty {
            inner: &conn,
            poison: "DROP COLUMN",
        };

        let report = executor().execute(&faulty, LogicalTable::Andamentos, &ops());
        assert!(report.halted);
        assert_eq!(report.applied(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.results.len(), 2);
        assert!(matches!(
            report.results[1].outcome,
            Outcome::Failed { kind: crate::error::ErrorKind::PermissionDenied, .. }
        ));

        // The rename stays applied
        assert!(conn.live_column("andamentos", "inicio_prazo").unwrap().is_some());

        // A later clean run picks up where it stopped
        let retry = executor().execute(&conn, LogicalTable::Andamentos, &ops());
        assert_eq!(retry.skipped(), 1);
        assert_eq!(retry.applied(), 3);
    }

    #[test]
    fn test_continue_on_failure_when_not_fail_fast() {
        let conn = legacy();
        let faulty = Faulty {
            inner: &conn,
            poison: "DROP COLUMN",
        };
        let exec = Executor::new(
            ExecOptions {
                fail_fast: false,
                ..ExecOptions::default()
            },
            CancelToken::new(),
        );

        let report = exec.execute(&faulty, LogicalTable::Andamentos, &ops());
        assert!(!report.halted);
        assert_eq!(report.results.len(), 4);
        assert_eq!(report.applied(), 3);
        assert_eq!(report.failed(), 1);
        assert!(!report.is_success());
    }

    #[test]
    fn test_index_conflict_reported() {
        let conn = legacy();
        conn.execute_batch(
            "ALTER TABLE andamentos ADD COLUMN processo TEXT;
             CREATE INDEX idx_andamentos_processo ON andamentos (processo);",
        )
        .unwrap();

        let same: OperationSet = vec![Operation::CreateIndexIfAbsent(IndexSpec::new(
            "idx_andamentos_processo",
            LogicalTable::Andamentos,
            &["processo"],
        ))]
        .into_iter()
        .collect();
        let report = executor().execute(&conn, LogicalTable::Andamentos, &same);
        assert_eq!(report.skipped(), 1);

        let different: OperationSet = vec![Operation::CreateIndexIfAbsent(IndexSpec::new(
            "idx_andamentos_processo",
            LogicalTable::Andamentos,
            &["processo", "data"],
        ))]
        .into_iter()
        .collect();
        let report = executor().execute(&conn, LogicalTable::Andamentos, &different);
        assert!(matches!(
            report.results[0].outcome,
            Outcome::Failed { kind: crate::error::ErrorKind::IndexDefinitionConflict, .. }
        ));
    }

    #[test]
    fn test_cancel_stops_before_next_operation() {
        let conn = legacy();
        let cancel = CancelToken::new();
        cancel.cancel();

        let report = Executor::new(ExecOptions::default(), cancel).execute(
            &conn,
            LogicalTable::Andamentos,
            &ops(),
        );
        assert!(report.cancelled);
        assert!(report.results.is_empty());
        assert!(!report.is_success());
        assert!(conn.live_column("andamentos", "data").unwrap().is_some());
    }

    fn rebuild_andamentos(copy: &[&str], carry: &[(&str, &str)]) -> OperationSet {
        vec![Operation::RebuildTable {
            target: deadline_table(LogicalTable::Andamentos).unwrap(),
            copy: copy.iter().map(|c| c.to_string()).collect(),
            carry: carry
                .iter()
                .map(|(name, ty)| CarriedColumn {
                    name: name.to_string(),
                    declared_type: ty.to_string(),
                })
                .collect(),
        }]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_rebuild_adds_identity_and_keeps_rows() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE andamentos (processo TEXT, legado TEXT);
             CREATE INDEX idx_andamentos_legado ON andamentos (legado);
             INSERT INTO andamentos VALUES ('0001', 'a');
             INSERT INTO andamentos VALUES ('0002', 'b');",
        )
        .unwrap();

        let set = rebuild_andamentos(&["processo"], &[("legado", "TEXT")]);
        let report = executor().execute(&conn, LogicalTable::Andamentos, &set);
        assert_eq!(report.applied(), 1);

        let id = conn.live_column("andamentos", "id").unwrap().unwrap();
        assert!(id.primary_key);
        assert!(conn.live_column("andamentos", "fim_prazo").unwrap().is_some());
        assert!(!conn.has_table("andamentos__rebuild").unwrap());

        let rows: Vec<(i64, String, String)> = conn
            .prepare("SELECT id, processo, legado FROM andamentos ORDER BY id")
            .unwrap()
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(
            rows,
            vec![
                (1, "0001".to_string(), "a".to_string()),
                (2, "0002".to_string(), "b".to_string())
            ]
        );

        // Unrelated indexes come back with the new table
        let legado = conn.live_index("idx_andamentos_legado").unwrap().unwrap();
        assert_eq!(legado.columns, vec!["legado".to_string()]);

        let again = executor().execute(&conn, LogicalTable::Andamentos, &set);
        assert_eq!(again.skipped(), 1);
    }

    #[test]
    fn test_failed_rebuild_leaves_table_untouched() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE andamentos (processo TEXT)")
            .unwrap();
        let faulty = Faulty {
            inner: &conn,
            poison: "INSERT INTO",
        };

        let report = executor().execute(&faulty, LogicalTable::Andamentos, &rebuild_andamentos(&["processo"], &[]));
        assert_eq!(report.failed(), 1);
        assert!(conn.live_column("andamentos", "id").unwrap().is_none());
        assert!(conn.live_column("andamentos", "processo").unwrap().is_some());
    }
}
