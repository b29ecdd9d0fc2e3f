use serde::{Deserialize, Serialize};

use super::{ColumnSpec, ColumnType, IndexSpec, LogicalTable, SchemaDescriptor};
use crate::error::MigrateError;

/// Which of the two historical `concluidas` layouts to converge on.
///
/// The archive table exists in the wild in both shapes with no recorded path
/// between them, so the choice is an explicit configuration input.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConcluidasLayout {
    #[default]
    Current,
    Legacy,
}

fn deadline_columns() -> Vec<ColumnSpec> {
    vec![
        ColumnSpec::identity("id"),
        ColumnSpec::new("inicio_prazo", ColumnType::Date),
        ColumnSpec::new("fim_prazo", ColumnType::Date),
        ColumnSpec::new("dias_restantes", ColumnType::Integer),
        ColumnSpec::new("setor", ColumnType::Text),
        ColumnSpec::new("cliente", ColumnType::Text),
        ColumnSpec::new("processo", ColumnType::Text),
        ColumnSpec::new("para_ramon_e_adriana_despacharem", ColumnType::Text),
        ColumnSpec::new("status", ColumnType::Text),
        ColumnSpec::new("resposta_do_colaborador", ColumnType::Text),
        ColumnSpec::new("observacoes", ColumnType::Text),
    ]
}

fn processo_index(table: LogicalTable) -> IndexSpec {
    IndexSpec::new(format!("idx_{}_processo", table.table_name()), table, &["processo"])
}

/// Shared deadline layout used by `andamentos`, `publicacoes` and `financeiro`.
pub fn deadline_table(table: LogicalTable) -> Result<SchemaDescriptor, MigrateError> {
    SchemaDescriptor::new(table, deadline_columns(), vec![processo_index(table)], "id")
}

/// Archive of completed items, in whichever layout the deployment has chosen.
pub fn concluidas(layout: ConcluidasLayout) -> Result<SchemaDescriptor, MigrateError> {
    let table = LogicalTable::Concluidas;
    match layout {
        ConcluidasLayout::Current => {
            let mut columns = deadline_columns();
            // Archive date, carried over from the legacy `data` column
            columns.insert(1, ColumnSpec::new("d", ColumnType::Date));
            SchemaDescriptor::new(table, columns, vec![processo_index(table)], "id")
        }
        ConcluidasLayout::Legacy => SchemaDescriptor::new(
            table,
            vec![
                ColumnSpec::identity("id"),
                ColumnSpec::new("data", ColumnType::Date),
                ColumnSpec::new("col_b", ColumnType::Text),
                ColumnSpec::new("col_c", ColumnType::Text),
                ColumnSpec::new("status_assunto", ColumnType::Text),
                ColumnSpec::new("cliente", ColumnType::Text),
                ColumnSpec::new("numero_processo", ColumnType::Text),
                ColumnSpec::new("col_g", ColumnType::Text),
                ColumnSpec::new("col_h", ColumnType::Text),
                ColumnSpec::new("col_i", ColumnType::Text),
                ColumnSpec::new("observacoes", ColumnType::Text),
                ColumnSpec::new("created_at", ColumnType::TimestampTz),
            ],
            vec![IndexSpec::new(
                "idx_concluidas_numero_processo",
                table,
                &["numero_processo"],
            )],
            "id",
        ),
    }
}

/// Per-scope polling watermark (`scrap_email`, `pje_comunica`, ...).
pub fn last_checked() -> Result<SchemaDescriptor, MigrateError> {
    let table = LogicalTable::LastChecked;
    SchemaDescriptor::new(
        table,
        vec![
            ColumnSpec::identity("id"),
            ColumnSpec::new("scope", ColumnType::Text)
                .not_null()
                .default("'default'"),
            ColumnSpec::new("checked_at", ColumnType::TimestampTz),
        ],
        vec![IndexSpec::new("idx_last_checked_scope", table, &["scope"]).unique()],
        "id",
    )
}

pub fn agenda() -> Result<SchemaDescriptor, MigrateError> {
    let table = LogicalTable::Agenda;
    SchemaDescriptor::new(
        table,
        vec![
            ColumnSpec::identity("id"),
            ColumnSpec::new("idx", ColumnType::Integer),
            ColumnSpec::new("data", ColumnType::Date),
            ColumnSpec::new("horario", ColumnType::Text),
            ColumnSpec::new("status", ColumnType::Text),
            ColumnSpec::new("cliente", ColumnType::Text),
            ColumnSpec::new("cliente_avisado", ColumnType::Text),
            ColumnSpec::new("anotado_na_agenda", ColumnType::Text),
            ColumnSpec::new("observacao", ColumnType::Text),
            ColumnSpec::new("numero_processo", ColumnType::Text),
            ColumnSpec::new("tipo_audiencia_pericia", ColumnType::Text),
            ColumnSpec::new("materia", ColumnType::Text),
            ColumnSpec::new("parte_adversa", ColumnType::Text),
            ColumnSpec::new("sistema", ColumnType::Text),
            ColumnSpec::new("created_at", ColumnType::TimestampTz).default("CURRENT_TIMESTAMP"),
        ],
        vec![IndexSpec::new(
            "idx_agenda_numero_processo",
            table,
            &["numero_processo"],
        )],
        "id",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_deadline_tables_share_columns() {
        let andamentos = deadline_table(LogicalTable::Andamentos).unwrap();
        let publicacoes = deadline_table(LogicalTable::Publicacoes).unwrap();
        let financeiro = deadline_table(LogicalTable::Financeiro).unwrap();

        assert_eq!(andamentos.columns(), publicacoes.columns());
        assert_eq!(andamentos.columns(), financeiro.columns());
        assert_ne!(andamentos, publicacoes);
        assert_eq!(andamentos.indexes()[0].name, "idx_andamentos_processo");
        assert_eq!(financeiro.indexes()[0].name, "idx_financeiro_processo");
    }

    #[test]
    fn test_concluidas_layouts() {
        let current = concluidas(ConcluidasLayout::Current).unwrap();
        assert_eq!(current.columns()[1].name, "d");
        assert!(current.has_column("processo"));

        let legacy = concluidas(ConcluidasLayout::Legacy).unwrap();
        assert!(legacy.has_column("numero_processo"));
        assert!(!legacy.has_column("processo"));
    }

    #[test]
    fn test_last_checked_scope_is_unique() {
        let desc = last_checked().unwrap();
        let index = &desc.indexes()[0];
        assert_eq!(index.name, "idx_last_checked_scope");
        assert!(index.unique);
        assert_eq!(index.columns, vec!["scope".to_string()]);
    }

    #[test]
    fn test_agenda_builds() {
        let desc = agenda().unwrap();
        assert_eq!(desc.primary_key().name, "id");
        assert_eq!(desc.columns().len(), 15);
    }
}
