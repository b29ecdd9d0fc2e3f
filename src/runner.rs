use std::thread;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn, Level};
use logging_timer::timer;
use serde::Serialize;

use crate::db::{Database, SchemaBackend};
use crate::error::MigrateError;
use crate::executor::{CancelToken, ExecOptions, Executor, TableReport};
use crate::ledger::{Ledger, MigrationLock};
use crate::migrations::MigrationStep;
use crate::ops::{Operation, OperationSet};
use crate::planner::{Planner, TableChange};
use crate::schema::{ColumnSpec, LogicalTable};

pub const LOCK_NAME: &str = "schema";

#[derive(Debug, Clone)]
pub struct MigrateOptions {
    pub exec: ExecOptions,
    pub lock_retries: u32,
    pub lock_backoff: Duration,
    /// Age after which a lock row is considered abandoned
    pub stale_lock_after: Option<Duration>,
    pub parallel_tables: bool,
    pub dry_run: bool,
    /// Restrict the run to one table
    pub table: Option<LogicalTable>,
}

impl Default for MigrateOptions {
    fn default() -> Self {
        Self {
            exec: ExecOptions::default(),
            lock_retries: 5,
            lock_backoff: Duration::from_millis(200),
            stale_lock_after: Some(Duration::from_secs(3600)),
            parallel_tables: false,
            dry_run: false,
            table: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    AlreadyApplied,
    Applied,
    /// Every table converged but only part of the step ran, so it was not recorded
    Partial,
    Planned,
    Failed,
    Cancelled,
    /// Not attempted because an earlier step did not complete
    Pending,
}

/// Operations the planner would issue for one table, with their SQL.
#[derive(Debug, Clone, Serialize)]
pub struct TablePlan {
    pub table: LogicalTable,
    pub operations: OperationSet,
    pub sql: Vec<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub id: &'static str,
    pub description: &'static str,
    pub status: StepStatus,
    pub tables: Vec<TableReport>,
    pub plans: Vec<TablePlan>,
}

impl StepReport {
    fn new(step: &MigrationStep, status: StepStatus) -> Self {
        Self {
            id: step.id,
            description: step.description,
            status,
            tables: Vec::new(),
            plans: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub dry_run: bool,
    pub steps: Vec<StepReport>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.steps.iter().all(|s| {
            !matches!(s.status, StepStatus::Failed | StepStatus::Cancelled)
                && s.plans.iter().all(|p| p.error.is_none())
        })
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableReport> {
        self.steps.iter().flat_map(|s| s.tables.iter())
    }
}

/// Drives the catalog against one database: lock, ledger, plan, execute, record.
pub struct Migrator<'a> {
    db: &'a Database,
    options: MigrateOptions,
    executor: Executor,
}

impl<'a> Migrator<'a> {
    pub fn new(db: &'a Database, options: MigrateOptions, cancel: CancelToken) -> Self {
        let executor = Executor::new(options.exec, cancel);
        Self {
            db,
            options,
            executor,
        }
    }

    pub fn run(&self, steps: &[MigrationStep]) -> Result<RunReport, MigrateError> {
        let _tmr = timer!(Level::Debug; "Migrator::run");

        // Dry runs never write, so they need neither the ledger tables nor the lock
        let _lock = if self.options.dry_run {
            None
        } else {
            Ledger::ensure(&*self.db.conn()?)?;
            Some(self.acquire_lock()?)
        };

        let mut report = RunReport {
            dry_run: self.options.dry_run,
            steps: Vec::new(),
        };
        let mut blocked = false;

        for step in steps {
            let scoped = match self.options.table {
                Some(table) => match step.only(table) {
                    Some(scoped) => scoped,
                    None => continue,
                },
                None => step.clone(),
            };

            if Ledger::has_applied(&*self.db.conn()?, step.id)? {
                info!("Migration '{}' already applied", step.id);
                report
                    .steps
                    .push(StepReport::new(step, StepStatus::AlreadyApplied));
                continue;
            }

            if blocked {
                report.steps.push(StepReport::new(step, StepStatus::Pending));
                continue;
            }

            let step_report = if self.options.dry_run {
                self.plan_step(&scoped)?
            } else {
                let partial = scoped.tables.len() < step.tables.len();
                self.apply_step(&scoped, partial)?
            };

            if matches!(
                step_report.status,
                StepStatus::Failed | StepStatus::Cancelled
            ) {
                blocked = true;
            }
            report.steps.push(step_report);
        }

        Ok(report)
    }

    /// Operator one-off: add a single column through the executor.
    pub fn add_column(
        &self,
        table: LogicalTable,
        column: ColumnSpec,
    ) -> Result<TableReport, MigrateError> {
        Ledger::ensure(&*self.db.conn()?)?;
        let _lock = self.acquire_lock()?;
        let conn = self.db.conn()?;

        let ops: OperationSet = [Operation::AddColumnIfAbsent { table, column }]
            .into_iter()
            .collect();
        Ok(self.executor.execute(&*conn, table, &ops))
    }

    fn plan_step(&self, step: &MigrationStep) -> Result<StepReport, MigrateError> {
        let conn = self.db.conn()?;
        let mut report = StepReport::new(step, StepStatus::Planned);

        for change in &step.tables {
            let plan = match Planner::plan(&*conn, change) {
                Ok(operations) => TablePlan {
                    table: change.table(),
                    sql: operations.iter().map(Operation::to_sql).collect(),
                    operations,
                    error: None,
                },
                Err(err) => TablePlan {
                    table: change.table(),
                    operations: OperationSet::new(),
                    sql: Vec::new(),
                    error: Some(format!("[{}] {}", err.kind(), err)),
                },
            };
            report.plans.push(plan);
        }

        Ok(report)
    }

    fn apply_step(&self, step: &MigrationStep, partial: bool) -> Result<StepReport, MigrateError> {
        info!("Applying migration '{}': {}", step.id, step.description);

        let tables = if self.options.parallel_tables && step.tables.len() > 1 {
            self.apply_tables_parallel(&step.tables)
        } else {
            step.tables.iter().map(|c| self.apply_table(c)).collect()
        };

        let mut report = StepReport::new(step, StepStatus::Applied);
        report.tables = tables;

        if report.tables.iter().any(|t| t.cancelled) {
            report.status = StepStatus::Cancelled;
        } else if report.tables.iter().any(|t| !t.is_success()) {
            for t in report.tables.iter().filter(|t| !t.is_success()) {
                error!("Migration '{}': {} had {} failure(s)", step.id, t.table, t.failed());
            }
            report.status = StepStatus::Failed;
        } else if partial {
            info!(
                "Migration '{}' only partially run, not recording it",
                step.id
            );
            report.status = StepStatus::Partial;
        } else {
            let recorded = Ledger::record_applied(
                &*self.db.conn()?,
                step.id,
                step.description,
                Utc::now(),
            )?;
            if !recorded {
                warn!("Migration '{}' was recorded by another run", step.id);
            }
        }

        Ok(report)
    }

    fn apply_tables_parallel(&self, changes: &[TableChange]) -> Vec<TableReport> {
        thread::scope(|s| {
            let handles: Vec<_> = changes
                .iter()
                .map(|change| (change.table(), s.spawn(move || self.apply_table(change))))
                .collect();

            handles
                .into_iter()
                .map(|(table, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        TableReport::from_plan_error(
                            table,
                            &MigrateError::OperationFailed("worker thread panicked".into()),
                        )
                    })
                })
                .collect()
        })
    }

    /// Plan and execute one table. Failures stay inside the returned report.
    fn apply_table(&self, change: &TableChange) -> TableReport {
        let table = change.table();
        let conn = match self.db.conn() {
            Ok(conn) => conn,
            Err(err) => return TableReport::from_plan_error(table, &err),
        };
        let backend: &dyn SchemaBackend = &*conn;

        match Planner::plan(backend, change) {
            Ok(ops) => self.executor.execute(backend, table, &ops),
            Err(err) => {
                error!("{table}: planning failed: {err}");
                TableReport::from_plan_error(table, &err)
            }
        }
    }

    fn acquire_lock(&self) -> Result<MigrationLock, MigrateError> {
        let holder = format!("prazos-schema pid {}", std::process::id());
        let mut attempt = 0;

        loop {
            match MigrationLock::acquire(self.db, LOCK_NAME, &holder, self.options.stale_lock_after) {
                Ok(lock) => {
                    debug!("Holding migration lock '{}'", lock.name());
                    return Ok(lock);
                }
                Err(err) if err.is_retryable() && attempt < self.options.lock_retries => {
                    let wait = self.options.lock_backoff * 2u32.saturating_pow(attempt);
                    warn!("{err}; retrying in {} ms", wait.as_millis());
                    thread::sleep(wait);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
