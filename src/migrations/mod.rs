mod m0001_base_tables;
mod m0002_prazo_layout;
mod m0003_concluidas;

use crate::error::MigrateError;
use crate::planner::TableChange;
use crate::schema::{ConcluidasLayout, LogicalTable};

/// Columns that older spreadsheet imports left behind on the deadline tables.
///
/// One list shared by every deadline table so the tables cannot drift apart.
pub const LEGACY_DROPS: [&str; 7] = [
    "col_b",
    "col_c",
    "col_d",
    "status_assunto",
    "col_g",
    "col_h",
    "col_i",
];

/// A named, ordered unit of schema evolution.
///
/// Once recorded in the ledger a step is never executed again, so the id of a
/// published step must not change.
#[derive(Debug, Clone)]
pub struct MigrationStep {
    pub id: &'static str,
    pub description: &'static str,
    pub tables: Vec<TableChange>,
}

impl MigrationStep {
    pub fn new(id: &'static str, description: &'static str) -> Self {
        Self {
            id,
            description,
            tables: Vec::new(),
        }
    }

    pub fn table(mut self, change: TableChange) -> Self {
        self.tables.push(change);
        self
    }

    /// Keep only the change for `table`, if this step has one.
    pub fn only(&self, table: LogicalTable) -> Option<MigrationStep> {
        let tables: Vec<TableChange> = self
            .tables
            .iter()
            .filter(|c| c.table() == table)
            .cloned()
            .collect();

        if tables.is_empty() {
            None
        } else {
            Some(MigrationStep {
                id: self.id,
                description: self.description,
                tables,
            })
        }
    }
}

/// Every known step, in the order it must run.
pub fn catalog(layout: ConcluidasLayout) -> Result<Vec<MigrationStep>, MigrateError> {
    let steps = vec![
        m0001_base_tables::step()?,
        m0002_prazo_layout::step()?,
        m0003_concluidas::step(layout)?,
    ];

    for (i, step) in steps.iter().enumerate() {
        if steps[..i].iter().any(|s| s.id == step.id) {
            return Err(MigrateError::InvalidDescriptor(format!(
                "migration id '{}' is used twice",
                step.id
            )));
        }
    }

    Ok(steps)
}
