//! Text rendering of table schemas for `schema_definitions`.

use crate::database::{ColumnInfo, TableSchema};

/// Render one table: a `name:` line, one line per column, then its
/// relationships if it has any foreign keys.
pub fn describe_table(table: &TableSchema) -> String {
    let mut lines = vec![format!("{}:", table.name)];

    for column in &table.columns {
        let is_pk = table.primary_keys.iter().any(|pk| pk == &column.name);
        lines.push(format!("    {}: {}", column.name, column_parts(column, is_pk).join(", ")));
    }

    if !table.foreign_keys.is_empty() {
        lines.push(String::new());
        lines.push("    Relationships:".to_string());
        for fk in &table.foreign_keys {
            lines.push(format!(
                "      {} -> {}.{}",
                fk.constrained_columns.join(", "),
                fk.referred_table,
                fk.referred_columns.join(", ")
            ));
        }
    }

    lines.join("\n")
}

/// Render several tables, separated by newlines.
pub fn describe_tables(tables: &[TableSchema]) -> String {
    tables
        .iter()
        .map(describe_table)
        .collect::<Vec<_>>()
        .join("\n")
}

fn column_parts(column: &ColumnInfo, is_pk: bool) -> Vec<String> {
    let mut parts = Vec::new();
    if is_pk {
        parts.push("primary key".to_string());
    }
    parts.push(column.data_type.clone());

    // flags are shown by name only
    if column.nullable {
        parts.push("nullable".to_string());
    }
    if let Some(default) = column.default.as_deref().filter(|d| !d.is_empty()) {
        parts.push(format!("default={}", default));
    }
    if column.autoincrement {
        parts.push("autoincrement".to_string());
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::testing::column;
    use crate::database::ForeignKeyInfo;

    fn orders() -> TableSchema {
        let mut id = column("id", "INT", false);
        id.autoincrement = true;
        let mut status = column("status", "NVARCHAR(20)", true);
        status.default = Some("('new')".to_string());
        status.comment = Some("lifecycle state".to_string());

        TableSchema {
            name: "orders".to_string(),
            columns: vec![id, column("user_id", "INT", false), status],
            foreign_keys: vec![ForeignKeyInfo {
                name: Some("fk_orders_users".to_string()),
                constrained_columns: vec!["user_id".to_string()],
                referred_table: "users".to_string(),
                referred_columns: vec!["id".to_string()],
            }],
            primary_keys: vec!["id".to_string()],
        }
    }

    #[test]
    fn test_describe_table() {
        let expected = "orders:\n\
                        \x20   id: primary key, INT, autoincrement\n\
                        \x20   user_id: INT\n\
                        \x20   status: NVARCHAR(20), nullable, default=('new')\n\
                        \n\
                        \x20   Relationships:\n\
                        \x20     user_id -> users.id";
        assert_eq!(describe_table(&orders()), expected);
    }

    #[test]
    fn test_table_without_relationships() {
        let table = TableSchema {
            name: "tags".to_string(),
            columns: vec![column("name", "VARCHAR(50)", false)],
            foreign_keys: vec![],
            primary_keys: vec![],
        };
        assert_eq!(describe_table(&table), "tags:\n    name: VARCHAR(50)");
    }

    #[test]
    fn test_multiple_tables_newline_separated() {
        let tags = TableSchema {
            name: "tags".to_string(),
            columns: vec![],
            foreign_keys: vec![],
            primary_keys: vec![],
        };
        assert_eq!(describe_tables(&[tags.clone(), tags]), "tags:\ntags:");
    }
}
