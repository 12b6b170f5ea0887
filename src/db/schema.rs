use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::llm::estimate_tokens;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub table: String,
    pub column: String,
    /// Derived from `<table>_id` naming rather than a declared constraint.
    pub inferred: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescription {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub primary_key: bool,
    pub references: Option<ForeignKey>,
    pub sensitive: bool,
}

impl ColumnDescription {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            primary_key: false,
            references: None,
            sensitive: false,
        }
    }

    pub fn to_sql_definition(&self) -> String {
        let mut definition = format!("{} {}", self.name, self.data_type);
        if self.primary_key {
            definition.push_str(" PRIMARY KEY");
        } else if !self.nullable {
            definition.push_str(" NOT NULL");
        }
        if let Some(fk) = &self.references {
            definition.push_str(&format!(" REFERENCES {}({})", fk.table, fk.column));
        }
        definition
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescription {
    pub name: String,
    pub columns: Vec<ColumnDescription>,
}

impl TableDescription {
    pub fn column(&self, name: &str) -> Option<&ColumnDescription> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn to_create_table_sql(&self) -> String {
        let columns_sql: Vec<String> = self
            .columns
            .iter()
            .map(|col| col.to_sql_definition())
            .collect();

        format!(
            "CREATE TABLE {} (\n    {}\n);",
            self.name,
            columns_sql.join(",\n    ")
        )
    }

    /// Free-text description of the table, used as the embedding document.
    pub fn to_embedding_text(&self, business_context: Option<&str>) -> String {
        let readable_name = self.name.replace('_', " ");
        let mut description = format!("Table: {} ({})\n", self.name, readable_name);
        match business_context {
            Some(context) => description.push_str(&format!("Purpose: {}\n", context)),
            None => description.push_str(&format!("Purpose: records of {}\n", readable_name)),
        }

        let column_names: Vec<String> = self.columns.iter().map(|c| c.name.replace('_', " ")).collect();
        description.push_str(&format!("Columns: {}\n", column_names.join(", ")));

        let relationships: Vec<String> = self
            .columns
            .iter()
            .filter_map(|c| {
                c.references
                    .as_ref()
                    .map(|fk| format!("links to {} via {}", fk.table, c.name))
            })
            .collect();
        if !relationships.is_empty() {
            description.push_str(&format!("Relationships: {}\n", relationships.join("; ")));
        }

        description
    }

    /// Infer foreign keys for `<x>_id` columns that lack a declared constraint.
    pub fn infer_foreign_keys(&mut self, other_tables: &[(String, bool)]) {
        for col in &mut self.columns {
            if col.references.is_some() || col.primary_key || !col.name.ends_with("_id") {
                continue;
            }
            let stem = col.name.trim_end_matches("_id").to_lowercase();
            let candidates = [stem.clone(), format!("{}s", stem), format!("{}es", stem)];

            // Tables are passed as (name, has_id_column)
            if let Some((table, _)) = other_tables.iter().find(|(name, has_id)| {
                *has_id && candidates.iter().any(|c| c == &name.to_lowercase())
            }) {
                col.references = Some(ForeignKey {
                    table: table.clone(),
                    column: "id".to_string(),
                    inferred: true,
                });
            }
        }
    }
}

/// Snapshot of the database structure at `introspected_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescription {
    pub tables: Vec<TableDescription>,
    pub introspected_at: DateTime<Utc>,
}

impl SchemaDescription {
    pub fn new(tables: Vec<TableDescription>) -> Self {
        Self {
            tables,
            introspected_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn table(&self, name: &str) -> Option<&TableDescription> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }

    /// Tables named in `names`, in that order; unknown names are skipped.
    pub fn subset<S: AsRef<str>>(&self, names: &[S]) -> SchemaDescription {
        let mut seen = BTreeSet::new();
        let tables = names
            .iter()
            .filter_map(|n| self.table(n.as_ref()))
            .filter(|t| seen.insert(t.name.clone()))
            .cloned()
            .collect();
        SchemaDescription {
            tables,
            introspected_at: self.introspected_at,
        }
    }

    /// DDL rendering handed to the model as schema context.
    pub fn to_prompt_context(&self) -> String {
        self.tables
            .iter()
            .map(TableDescription::to_create_table_sql)
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn token_estimate(&self) -> usize {
        estimate_tokens(&self.to_prompt_context())
    }

    /// Lower-cased names of every column flagged sensitive.
    pub fn sensitive_columns(&self) -> BTreeSet<String> {
        self.tables
            .iter()
            .flat_map(|t| t.columns.iter())
            .filter(|c| c.sensitive)
            .map(|c| c.name.to_lowercase())
            .collect()
    }
}
