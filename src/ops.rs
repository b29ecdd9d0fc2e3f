use std::fmt;
use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::error::{ErrorKind, MigrateError};
use crate::schema::{
    ColumnSpec, ColumnType, IndexSpec, LogicalTable, RenameMapping, SchemaDescriptor,
};

/// A live column outside the target layout that a rebuild carries over unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CarriedColumn {
    pub name: String,
    pub declared_type: String,
}

/// A single idempotent unit of schema change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    CreateTable(SchemaDescriptor),
    AddColumnIfAbsent {
        table: LogicalTable,
        column: ColumnSpec,
    },
    DropColumnIfPresent {
        table: LogicalTable,
        column: String,
    },
    RenameColumn {
        table: LogicalTable,
        mapping: RenameMapping,
    },
    CreateIndexIfAbsent(IndexSpec),
    /// Recreate the table in the target layout and copy its rows across, for
    /// columns `ALTER TABLE` cannot add.
    RebuildTable {
        target: SchemaDescriptor,
        /// Live columns that are part of the target layout
        copy: Vec<String>,
        carry: Vec<CarriedColumn>,
    },
}

impl Operation {
    pub fn table(&self) -> LogicalTable {
        match self {
            Operation::CreateTable(desc) | Operation::RebuildTable { target: desc, .. } => {
                desc.table()
            }
            Operation::AddColumnIfAbsent { table, .. }
            | Operation::DropColumnIfPresent { table, .. }
            | Operation::RenameColumn { table, .. } => *table,
            Operation::CreateIndexIfAbsent(index) => index.table,
        }
    }

    /// The DDL issued when the pre-check finds the change is still needed.
    pub fn to_sql(&self) -> String {
        match self {
            Operation::CreateTable(desc) => desc.create_table_sql(),
            Operation::AddColumnIfAbsent { table, column } => format!(
                "ALTER TABLE \"{}\" ADD COLUMN {}",
                table.table_name(),
                column.definition_sql()
            ),
            Operation::DropColumnIfPresent { table, column } => format!(
                "ALTER TABLE \"{}\" DROP COLUMN \"{}\"",
                table.table_name(),
                column
            ),
            Operation::RenameColumn { table, mapping } => format!(
                "ALTER TABLE \"{}\" RENAME COLUMN \"{}\" TO \"{}\"",
                table.table_name(),
                mapping.from,
                mapping.to
            ),
            Operation::CreateIndexIfAbsent(index) => {
                let columns: Vec<String> =
                    index.columns.iter().map(|c| format!("\"{c}\"")).collect();
                format!(
                    "CREATE {}INDEX \"{}\" ON \"{}\" ({})",
                    if index.unique { "UNIQUE " } else { "" },
                    index.name,
                    index.table.table_name(),
                    columns.join(", ")
                )
            }
            Operation::RebuildTable { .. } => self.rebuild_statements().join(";\n"),
        }
    }

    /// Statements making up a rebuild, run together in one transaction.
    /// Empty for every other operation.
    pub fn rebuild_statements(&self) -> Vec<String> {
        let Operation::RebuildTable {
            target,
            copy,
            carry,
        } = self
        else {
            return Vec::new();
        };

        let table = target.table().table_name();
        let scratch = format!("{table}__rebuild");
        let extra: Vec<String> = carry
            .iter()
            .map(|c| format!("\"{}\" {}", c.name, c.declared_type).trim_end().to_string())
            .collect();

        let mut into: Vec<String> = Vec::new();
        let mut from: Vec<String> = Vec::new();

        // A fresh identity column takes over the old rowid so row identity survives
        let pk = target.primary_key();
        if pk.column_type == ColumnType::Identity && !copy.contains(&pk.name) {
            into.push(format!("\"{}\"", pk.name));
            from.push("rowid".to_string());
        }
        for name in copy.iter().chain(carry.iter().map(|c| &c.name)) {
            into.push(format!("\"{name}\""));
            from.push(format!("\"{name}\""));
        }

        let mut statements = vec![
            format!("DROP TABLE IF EXISTS \"{scratch}\""),
            target.create_table_sql_as(&scratch, &extra),
        ];
        if !into.is_empty() {
            statements.push(format!(
                "INSERT INTO \"{scratch}\" ({}) SELECT {} FROM \"{table}\"",
                into.join(", "),
                from.join(", ")
            ));
        }
        statements.push(format!("DROP TABLE \"{table}\""));
        statements.push(format!("ALTER TABLE \"{scratch}\" RENAME TO \"{table}\""));
        statements
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::CreateTable(desc) => write!(
                f,
                "create table {} ({} columns)",
                desc.table(),
                desc.columns().len()
            ),
            Operation::AddColumnIfAbsent { table, column } => write!(
                f,
                "add column {}.{} {}",
                table, column.name, column.column_type
            ),
            Operation::DropColumnIfPresent { table, column } => {
                write!(f, "drop column {}.{}", table, column)
            }
            Operation::RenameColumn { table, mapping } => write!(
                f,
                "rename column {}.{} -> {}",
                table, mapping.from, mapping.to
            ),
            Operation::CreateIndexIfAbsent(index) => write!(f, "create index {}", index),
            Operation::RebuildTable { target, copy, carry } => write!(
                f,
                "rebuild table {} ({} columns, {} copied)",
                target.table(),
                target.columns().len() + carry.len(),
                copy.len() + carry.len()
            ),
        }
    }
}

/// Ordered operations for one table: rename, drop, add, index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct OperationSet {
    ops: Vec<Operation>,
}

impl OperationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: Operation) {
        self.ops.push(op);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Operation> {
        self.ops.iter()
    }
}

impl FromIterator<Operation> for OperationSet {
    fn from_iter<I: IntoIterator<Item = Operation>>(iter: I) -> Self {
        Self {
            ops: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a OperationSet {
    type Item = &'a Operation;
    type IntoIter = std::slice::Iter<'a, Operation>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.iter()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Applied,
    SkippedAlreadySatisfied,
    Failed { kind: ErrorKind, reason: String },
}

impl Outcome {
    pub fn failed(err: &MigrateError) -> Self {
        Outcome::Failed {
            kind: err.kind(),
            reason: err.to_string(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed { .. })
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Applied => write!(f, "applied"),
            Outcome::SkippedAlreadySatisfied => write!(f, "skipped"),
            Outcome::Failed { kind, reason } => write!(f, "FAILED [{kind}] {reason}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationResult {
    pub operation: Operation,
    pub outcome: Outcome,
    #[serde(serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

fn serialize_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{deadline_table, ColumnType};

    #[test]
    fn test_operation_sql() {
        let rename = Operation::RenameColumn {
            table: LogicalTable::Andamentos,
            mapping: RenameMapping::new("numero_processo", "processo"),
        };
        assert_eq!(
            rename.to_sql(),
            "ALTER TABLE \"andamentos\" RENAME COLUMN \"numero_processo\" TO \"processo\""
        );

        let drop = Operation::DropColumnIfPresent {
            table: LogicalTable::Publicacoes,
            column: "col_d".into(),
        };
        assert_eq!(drop.to_sql(), "ALTER TABLE \"publicacoes\" DROP COLUMN \"col_d\"");

        let add = Operation::AddColumnIfAbsent {
            table: LogicalTable::Financeiro,
            column: ColumnSpec::new("fim_prazo", ColumnType::Date),
        };
        assert_eq!(add.to_sql(), "ALTER TABLE \"financeiro\" ADD COLUMN \"fim_prazo\" DATE");

        let index = Operation::CreateIndexIfAbsent(
            IndexSpec::new("idx_last_checked_scope", LogicalTable::LastChecked, &["scope"]).unique(),
        );
        assert_eq!(
            index.to_sql(),
            "CREATE UNIQUE INDEX \"idx_last_checked_scope\" ON \"last_checked\" (\"scope\")"
        );
    }

    #[test]
    fn test_rebuild_statements() {
        let op = Operation::RebuildTable {
            target: deadline_table(LogicalTable::Andamentos).unwrap(),
            copy: vec!["inicio_prazo".into(), "processo".into()],
            carry: vec![CarriedColumn {
                name: "created_at".into(),
                declared_type: "TEXT".into(),
            }],
        };
        assert_eq!(op.table(), LogicalTable::Andamentos);
        assert_eq!(op.to_string(), "rebuild table andamentos (12 columns, 3 copied)");

        let statements = op.rebuild_statements();
        assert_eq!(statements.len(), 5);
        assert_eq!(statements[0], "DROP TABLE IF EXISTS \"andamentos__rebuild\"");
        assert!(statements[1].starts_with("CREATE TABLE \"andamentos__rebuild\""));
        assert!(statements[1].contains("\"id\" INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert!(statements[1].ends_with("\"created_at\" TEXT\n)"));
        assert_eq!(
            statements[2],
            "INSERT INTO \"andamentos__rebuild\" (\"id\", \"inicio_prazo\", \"processo\", \"created_at\") \
             SELECT rowid, \"inicio_prazo\", \"processo\", \"created_at\" FROM \"andamentos\""
        );
        assert_eq!(statements[3], "DROP TABLE \"andamentos\"");
        assert_eq!(
            statements[4],
            "ALTER TABLE \"andamentos__rebuild\" RENAME TO \"andamentos\""
        );
        assert_eq!(op.to_sql(), statements.join(";\n"));

        let plain = Operation::DropColumnIfPresent {
            table: LogicalTable::Andamentos,
            column: "col_b".into(),
        };
        assert!(plain.rebuild_statements().is_empty());
    }

    #[test]
    fn test_operation_table_and_display() {
        let desc = deadline_table(LogicalTable::Financeiro).unwrap();
        let op = Operation::CreateTable(desc);
        assert_eq!(op.table(), LogicalTable::Financeiro);
        assert_eq!(op.to_string(), "create table financeiro (11 columns)");
    }

    #[test]
    fn test_outcome_display_and_json() {
        let err = MigrateError::TableNotFound("agenda".into());
        let outcome = Outcome::failed(&err);
        assert!(outcome.is_failed());
        assert_eq!(
            outcome.to_string(),
            "FAILED [TableNotFound] Table 'agenda' does not exist"
        );

        let json = serde_json::to_string(&Outcome::SkippedAlreadySatisfied).unwrap();
        assert_eq!(json, r#"{"status":"skipped_already_satisfied"}"#);
    }

    #[test]
    fn test_operation_set_collects() {
        let set: OperationSet = vec![Operation::DropColumnIfPresent {
            table: LogicalTable::Andamentos,
            column: "col_b".into(),
        }]
        .into_iter()
        .collect();
        assert_eq!(set.len(), 1);
        assert!(!set.is_empty());
        assert!(OperationSet::new().is_empty());
    }
}
