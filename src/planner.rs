use log::{debug, info, warn};

use crate::db::{LiveColumn, SchemaBackend};
use crate::error::MigrateError;
use crate::ops::{CarriedColumn, Operation, OperationSet};
use crate::schema::{ColumnSpec, ColumnType, LogicalTable, RenameMapping, SchemaDescriptor};

/// Everything needed to move one table toward its target layout.
///
/// `renames` are known historical renames, applied in order; `drops` name
/// legacy columns to remove if they are still around.
#[derive(Debug, Clone)]
pub struct TableChange {
    pub target: SchemaDescriptor,
    pub renames: Vec<RenameMapping>,
    pub drops: Vec<String>,
}

impl TableChange {
    pub fn new(target: SchemaDescriptor) -> Self {
        Self {
            target,
            renames: Vec::new(),
            drops: Vec::new(),
        }
    }

    pub fn rename(mut self, from: &str, to: &str) -> Self {
        self.renames.push(RenameMapping::new(from, to));
        self
    }

    pub fn drop_columns(mut self, columns: &[&str]) -> Self {
        self.drops.extend(columns.iter().map(|c| c.to_string()));
        self
    }

    pub fn table(&self) -> LogicalTable {
        self.target.table()
    }
}

pub struct Planner;

impl Planner {
    /// Build the operation set for `change` against whatever state the table is in now.
    ///
    /// Absent table: a single CreateTable followed by the target's indexes.
    /// Existing table: renames, then drops, then adds for columns still missing
    /// once renames and drops are accounted for, then indexes. When a missing
    /// column cannot be added in place the adds become a single table rebuild.
    pub fn plan(
        backend: &dyn SchemaBackend,
        change: &TableChange,
    ) -> Result<OperationSet, MigrateError> {
        let table = change.table();
        let target = &change.target;

        if let Some(kept) = change.drops.iter().find(|d| target.has_column(d)) {
            return Err(MigrateError::InvalidDescriptor(format!(
                "{table} drops column '{kept}' that the target layout keeps"
            )));
        }

        let mut ops = OperationSet::new();

        let Some(mut projected) = backend.live_columns(table.table_name())? else {
            info!("{table}: table absent, planning full create");
            ops.push(Operation::CreateTable(target.clone()));
            for index in target.indexes() {
                ops.push(Operation::CreateIndexIfAbsent(index.clone()));
            }
            return Ok(ops);
        };

        // Renames that will actually take effect, used to project index columns
        let mut effective: Vec<&RenameMapping> = Vec::new();

        for mapping in &change.renames {
            let has_from = has(&projected, &mapping.from);
            let has_to = has(&projected, &mapping.to);

            if has_from && !has_to {
                if let Some(col) = projected.iter_mut().find(|c| c.name == mapping.from) {
                    col.name = mapping.to.clone();
                }
                effective.push(mapping);
            } else if !has_from {
                info!(
                    "{table}: rename {} -> {} skipped, source column absent",
                    mapping.from, mapping.to
                );
            } else {
                warn!(
                    "{table}: rename {} -> {} has both columns present",
                    mapping.from, mapping.to
                );
            }

            ops.push(Operation::RenameColumn {
                table,
                mapping: mapping.clone(),
            });
        }

        for column in &change.drops {
            projected.retain(|c| &c.name != column);
            ops.push(Operation::DropColumnIfPresent {
                table,
                column: column.clone(),
            });
        }

        let mut missing: Vec<&ColumnSpec> = Vec::new();
        for spec in target.columns() {
            match projected.iter().find(|c| c.name == spec.name) {
                Some(live) => {
                    if !spec
                        .column_type
                        .matches_declared(&live.declared_type, live.primary_key)
                    {
                        return Err(MigrateError::TypeMismatch {
                            table: table.to_string(),
                            column: spec.name.clone(),
                            expected: spec.column_type.to_string(),
                            found: live.declared_type.clone(),
                        });
                    }
                    if spec.nullable == live.not_null && spec.column_type != ColumnType::Identity {
                        // ALTER cannot change nullability in place; report and carry on
                        warn!(
                            "{table}.{}: live column is {}, target is {}",
                            spec.name,
                            nullability(!live.not_null),
                            nullability(spec.nullable)
                        );
                    }
                    debug!("{table}.{} present with compatible type", spec.name);
                }
                None => missing.push(spec),
            }
        }

        if missing.iter().any(|c| c.requires_rebuild()) {
            let (copy, carry): (Vec<&LiveColumn>, Vec<&LiveColumn>) =
                projected.iter().partition(|c| target.has_column(&c.name));
            let names: Vec<&str> = missing
                .iter()
                .filter(|c| c.requires_rebuild())
                .map(|c| c.name.as_str())
                .collect();
            info!("{table}: {} cannot be added in place, planning a rebuild", names.join(", "));

            ops.push(Operation::RebuildTable {
                target: target.clone(),
                copy: copy.into_iter().map(|c| c.name.clone()).collect(),
                carry: carry
                    .into_iter()
                    .map(|c| CarriedColumn {
                        name: c.name.clone(),
                        declared_type: c.declared_type.clone(),
                    })
                    .collect(),
            });
        } else {
            for spec in missing {
                ops.push(Operation::AddColumnIfAbsent {
                    table,
                    column: spec.clone(),
                });
            }
        }

        for index in target.indexes() {
            if let Some(mut live) = backend.live_index(&index.name)? {
                if live.table == table.table_name() {
                    for mapping in &effective {
                        for col in live.columns.iter_mut() {
                            if *col == mapping.from {
                                *col = mapping.to.clone();
                            }
                        }
                    }
                }
                if !live.matches(index) {
                    return Err(MigrateError::IndexDefinitionConflict {
                        name: index.name.clone(),
                        existing: live.describe(),
                        wanted: index.to_string(),
                    });
                }
            }
            ops.push(Operation::CreateIndexIfAbsent(index.clone()));
        }

        debug!("{table}: planned {} operations", ops.len());
        Ok(ops)
    }
}

fn has(columns: &[LiveColumn], name: &str) -> bool {
    columns.iter().any(|c| c.name == name)
}

fn nullability(nullable: bool) -> &'static str {
    if nullable {
        "nullable"
    } else {
        "NOT NULL"
    }
}
