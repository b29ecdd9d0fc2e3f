use std::io::Write;

use crate::error::MigrateError;
use crate::executor::TableReport;
use crate::ledger::{LockHolder, MigrationRecord};
use crate::migrations::MigrationStep;
use crate::runner::{RunReport, StepStatus};

/// Human and JSON renderings of run results and ledger state.
pub struct Reports;

impl Reports {
    pub fn write_json<W: Write, T: serde::Serialize>(out: &mut W, value: &T) -> Result<(), MigrateError> {
        let json = serde_json::to_string_pretty(value)
            .map_err(|e| MigrateError::OperationFailed(format!("Failed to serialize report: {e}")))?;
        writeln!(out, "{json}")?;
        Ok(())
    }

    pub fn write_run<W: Write>(out: &mut W, report: &RunReport) -> Result<(), MigrateError> {
        if report.steps.is_empty() {
            writeln!(out, "Nothing to do")?;
            return Ok(());
        }

        for step in &report.steps {
            writeln!(out, "{} [{}] {}", step.id, status_label(step.status), step.description)?;

            for plan in &step.plans {
                match &plan.error {
                    Some(error) => writeln!(out, "  {}: cannot plan: {}", plan.table, error)?,
                    None if plan.operations.is_empty() => writeln!(out, "  {}: up to date", plan.table)?,
                    None => {
                        writeln!(out, "  {}: {} operation(s)", plan.table, plan.sql.len())?;
                        for sql in &plan.sql {
                            writeln!(out, "    {sql};")?;
                        }
                    }
                }
            }

            for table in &step.tables {
                Self::write_table(out, table)?;
            }
        }

        if !report.dry_run {
            let (applied, skipped, failed) = report.tables().fold((0, 0, 0), |acc, t| {
                (acc.0 + t.applied(), acc.1 + t.skipped(), acc.2 + t.failed())
            });
            writeln!(out)?;
            writeln!(out, "Total: {applied} applied, {skipped} skipped, {failed} failed")?;
        }

        Ok(())
    }

    pub fn write_table<W: Write>(out: &mut W, table: &TableReport) -> Result<(), MigrateError> {
        writeln!(
            out,
            "  {:<14} applied {:>3}  skipped {:>3}  failed {:>3}{}",
            table.table.to_string(),
            table.applied(),
            table.skipped(),
            table.failed(),
            if table.cancelled {
                "  (cancelled)"
            } else if table.halted {
                "  (halted)"
            } else {
                ""
            }
        )?;

        if let Some(error) = &table.plan_error {
            writeln!(out, "    {error}")?;
        }
        for result in table.results.iter().filter(|r| r.outcome.is_failed()) {
            writeln!(out, "    {}: {}", result.operation, result.outcome)?;
        }
        Ok(())
    }

    pub fn write_status<W: Write>(
        out: &mut W,
        entries: &[MigrationRecord],
        pending: &[&MigrationStep],
        locks: &[LockHolder],
    ) -> Result<(), MigrateError> {
        writeln!(out, "Applied migrations:")?;
        if entries.is_empty() {
            writeln!(out, "  (none)")?;
        }
        for entry in entries {
            writeln!(out, "  {:<20} {}  {}", entry.id, entry.applied_at, entry.description)?;
        }

        writeln!(out, "Pending migrations:")?;
        if pending.is_empty() {
            writeln!(out, "  (none)")?;
        }
        for step in pending {
            let tables: Vec<String> = step.tables.iter().map(|c| c.table().to_string()).collect();
            writeln!(out, "  {:<20} {} ({})", step.id, step.description, tables.join(", "))?;
        }

        if !locks.is_empty() {
            writeln!(out, "Held locks:")?;
            for lock in locks {
                writeln!(out, "  {} held by {} since {}", lock.name, lock.holder, lock.acquired_at)?;
            }
        }
        Ok(())
    }
}

fn status_label(status: StepStatus) -> &'static str {
    match status {
        StepStatus::AlreadyApplied => "already applied",
        StepStatus::Applied => "applied",
        StepStatus::Partial => "partial, not recorded",
        StepStatus::Planned => "dry run",
        StepStatus::Failed => "FAILED",
        StepStatus::Cancelled => "cancelled",
        StepStatus::Pending => "pending",
    }
}
