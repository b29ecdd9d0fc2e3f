use super::MigrationStep;
use crate::error::MigrateError;
use crate::planner::TableChange;
use crate::schema::{agenda, last_checked};

/// Bookkeeping tables with no legacy layout to reconcile: polling watermarks
/// and the hearings agenda. Both are created directly in their final shape.
pub fn step() -> Result<MigrationStep, MigrateError> {
    Ok(
        MigrationStep::new("0001_base_tables", "create last_checked and agenda")
            .table(TableChange::new(last_checked()?))
            .table(TableChange::new(agenda()?)),
    )
}
