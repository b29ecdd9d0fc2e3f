mod tables;

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;
use strum::{AsRefStr, Display, EnumIter, EnumString};

use crate::error::MigrateError;

pub use tables::{agenda, concluidas, deadline_table, last_checked, ConcluidasLayout};

/// One of the tracked domains. Each maps to exactly one physical table.
#[derive(
    AsRefStr, Display, EnumIter, EnumString, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum LogicalTable {
    Andamentos,
    Publicacoes,
    Financeiro,
    Concluidas,
    LastChecked,
    Agenda,
}

impl LogicalTable {
    pub fn table_name(&self) -> &'static str {
        match self {
            LogicalTable::Andamentos => "andamentos",
            LogicalTable::Publicacoes => "publicacoes",
            LogicalTable::Financeiro => "financeiro",
            LogicalTable::Concluidas => "concluidas",
            LogicalTable::LastChecked => "last_checked",
            LogicalTable::Agenda => "agenda",
        }
    }
}

#[derive(AsRefStr, Display, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    #[strum(serialize = "DATE")]
    Date,
    #[strum(serialize = "INTEGER")]
    Integer,
    #[strum(serialize = "TEXT")]
    Text,
    #[strum(serialize = "TIMESTAMPTZ")]
    TimestampTz,
    #[strum(serialize = "IDENTITY")]
    Identity,
}

impl ColumnType {
    /// Column definition fragment for DDL. Identity carries its own PRIMARY KEY clause.
    pub fn sql(&self) -> &'static str {
        match self {
            ColumnType::Date => "DATE",
            ColumnType::Integer => "INTEGER",
            ColumnType::Text => "TEXT",
            ColumnType::TimestampTz => "TIMESTAMPTZ",
            ColumnType::Identity => "INTEGER PRIMARY KEY AUTOINCREMENT",
        }
    }

    /// Whether a live column declared as `declared` can stand in for this type.
    pub fn matches_declared(&self, declared: &str, primary_key: bool) -> bool {
        let declared = declared.trim().to_ascii_uppercase();
        let base = declared.split('(').next().unwrap_or("").trim();
        let integer_family = matches!(base, "INTEGER" | "INT" | "BIGINT" | "SMALLINT");

        match self {
            ColumnType::Date => base == "DATE",
            ColumnType::Integer => integer_family,
            ColumnType::Text => matches!(base, "TEXT" | "VARCHAR" | "CHAR"),
            ColumnType::TimestampTz => matches!(
                base,
                "TIMESTAMPTZ" | "TIMESTAMP WITH TIME ZONE" | "TIMESTAMP"
            ),
            ColumnType::Identity => integer_family && primary_key,
        }
    }

    /// Parse the short names accepted on the command line.
    pub fn from_cli(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "TEXT" => Some(ColumnType::Text),
            "DATE" => Some(ColumnType::Date),
            "INTEGER" => Some(ColumnType::Integer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub default: Option<String>,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: column_type != ColumnType::Identity,
            default: None,
        }
    }

    pub fn identity(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Identity)
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn default(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }

    /// `"name" TYPE [NOT NULL] [DEFAULT expr]`
    pub fn definition_sql(&self) -> String {
        let mut sql = format!("\"{}\" {}", self.name, self.column_type.sql());
        if !self.nullable && self.column_type != ColumnType::Identity {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = &self.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(default);
        }
        sql
    }

    /// SQLite's `ADD COLUMN` refuses primary keys and non-constant defaults;
    /// such a column only arrives by rebuilding the table.
    pub fn requires_rebuild(&self) -> bool {
        self.column_type == ColumnType::Identity
            || self.default.as_deref().is_some_and(|expr| {
                let expr = expr.trim().to_ascii_uppercase();
                expr.starts_with('(') || expr.starts_with("CURRENT_")
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexSpec {
    pub name: String,
    pub table: LogicalTable,
    pub columns: Vec<String>,
    pub unique: bool,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>, table: LogicalTable, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            table,
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

impl fmt::Display for IndexSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{} ON {} ({})",
            if self.unique { "UNIQUE " } else { "" },
            self.name,
            self.table,
            self.columns.join(", ")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenameMapping {
    pub from: String,
    pub to: String,
}

impl RenameMapping {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Column and index names are interpolated into DDL, so only plain
/// identifiers are accepted.
pub fn validate_identifier(name: &str) -> Result<(), MigrateError> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(MigrateError::InvalidDescriptor(format!(
            "'{name}' is not a valid identifier (use ASCII letters, digits and '_')"
        )));
    }
    Ok(())
}

/// Desired end state of one table. Immutable once built; validated at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaDescriptor {
    table: LogicalTable,
    columns: Vec<ColumnSpec>,
    indexes: Vec<IndexSpec>,
    primary_key: String,
}

impl SchemaDescriptor {
    pub fn new(
        table: LogicalTable,
        columns: Vec<ColumnSpec>,
        indexes: Vec<IndexSpec>,
        primary_key: impl Into<String>,
    ) -> Result<Self, MigrateError> {
        let primary_key = primary_key.into();

        if columns.is_empty() {
            return Err(MigrateError::InvalidDescriptor(format!(
                "{table} has no columns"
            )));
        }

        let mut seen = HashSet::new();
        for col in &columns {
            validate_identifier(&col.name)?;
            if !seen.insert(col.name.as_str()) {
                return Err(MigrateError::InvalidDescriptor(format!(
                    "{table} declares column '{}' more than once",
                    col.name
                )));
            }
        }

        if !seen.contains(primary_key.as_str()) {
            return Err(MigrateError::InvalidDescriptor(format!(
                "{table} primary key '{primary_key}' is not a column"
            )));
        }

        let mut index_names = HashSet::new();
        for index in &indexes {
            if index.table != table {
                return Err(MigrateError::InvalidDescriptor(format!(
                    "index '{}' belongs to {} but was declared on {table}",
                    index.name, index.table
                )));
            }
            if !index_names.insert(index.name.as_str()) {
                return Err(MigrateError::InvalidDescriptor(format!(
                    "{table} declares index '{}' more than once",
                    index.name
                )));
            }
            if index.columns.is_empty() {
                return Err(MigrateError::InvalidDescriptor(format!(
                    "index '{}' has no columns",
                    index.name
                )));
            }
            if let Some(missing) = index.columns.iter().find(|c| !seen.contains(c.as_str())) {
                return Err(MigrateError::InvalidDescriptor(format!(
                    "index '{}' references unknown column '{missing}'",
                    index.name
                )));
            }
        }

        Ok(Self {
            table,
            columns,
            indexes,
            primary_key,
        })
    }

    pub fn table(&self) -> LogicalTable {
        self.table
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn indexes(&self) -> &[IndexSpec] {
        &self.indexes
    }

    pub fn primary_key(&self) -> &ColumnSpec {
        // Construction guarantees the primary key names a column.
        self.columns
            .iter()
            .find(|c| c.name == self.primary_key)
            .unwrap_or(&self.columns[0])
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// `CREATE TABLE` statement for this descriptor. Indexes are created separately.
    pub fn create_table_sql(&self) -> String {
        self.create_table_sql_as(self.table.table_name(), &[])
    }

    /// Same layout under another name, with `extra` column definitions appended
    /// after the declared ones.
    pub fn create_table_sql_as(&self, name: &str, extra: &[String]) -> String {
        let mut defs: Vec<String> = self.columns.iter().map(|c| c.definition_sql()).collect();
        defs.extend(extra.iter().cloned());
        let pk = self.primary_key();
        if pk.column_type != ColumnType::Identity {
            defs.push(format!("PRIMARY KEY (\"{}\")", pk.name));
        }
        format!("CREATE TABLE \"{}\" (\n    {}\n)", name, defs.join(",\n    "))
    }
}
