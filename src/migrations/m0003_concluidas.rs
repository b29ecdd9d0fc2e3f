use super::{MigrationStep, LEGACY_DROPS};
use crate::error::MigrateError;
use crate::planner::TableChange;
use crate::schema::{concluidas, ConcluidasLayout};

pub fn step(layout: ConcluidasLayout) -> Result<MigrationStep, MigrateError> {
    let change = match layout {
        ConcluidasLayout::Current => TableChange::new(concluidas(layout)?)
            .rename("data", "d")
            .rename("numero_processo", "processo")
            .drop_columns(&LEGACY_DROPS),
        // Legacy keeps the import columns; only missing ones are added
        ConcluidasLayout::Legacy => TableChange::new(concluidas(layout)?),
    };

    Ok(MigrationStep::new(
        "0003_concluidas",
        "bring the concluidas archive to its configured layout",
    )
    .table(change))
}
