use super::{MigrationStep, LEGACY_DROPS};
use crate::error::MigrateError;
use crate::planner::TableChange;
use crate::schema::{deadline_table, LogicalTable};

/// Deadline tables move from the spreadsheet import layout (`data`,
/// `numero_processo`, lettered filler columns) to the shared deadline layout.
pub fn step() -> Result<MigrationStep, MigrateError> {
    let mut step = MigrationStep::new(
        "0002_prazo_layout",
        "converge andamentos, publicacoes and financeiro on the deadline layout",
    );

    for table in [
        LogicalTable::Andamentos,
        LogicalTable::Publicacoes,
        LogicalTable::Financeiro,
    ] {
        step = step.table(
            TableChange::new(deadline_table(table)?)
                .rename("data", "inicio_prazo")
                .rename("numero_processo", "processo")
                .drop_columns(&LEGACY_DROPS),
        );
    }

    Ok(step)
}
