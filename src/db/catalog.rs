use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

use crate::config::CatalogConfig;
use crate::db::db_pool::DbPool;
use crate::db::schema::{ColumnDescription, ForeignKey, SchemaDescription, TableDescription};
use crate::error::PipelineError;

static PRIMARY_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)PRIMARY\s+KEY\s*\(([^)]*)\)"#).expect("primary key pattern")
});

static FOREIGN_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)FOREIGN\s+KEY\s*\(([^)]*)\)\s*REFERENCES\s+"?([\w.]+?)"?\s*\(([^)]*)\)"#)
        .expect("foreign key pattern")
});

/// Decides which columns hold personal data, by name.
#[derive(Debug, Clone)]
pub struct SensitivityRules {
    patterns: Vec<String>,
    exact: Vec<String>,
}

impl SensitivityRules {
    pub fn new(patterns: &[String], exact: &[String]) -> Self {
        Self {
            patterns: patterns.iter().map(|p| p.to_lowercase()).collect(),
            exact: exact.iter().map(|e| e.to_lowercase()).collect(),
        }
    }

    pub fn is_sensitive(&self, column: &str) -> bool {
        let column = column.to_lowercase();
        if self.exact.contains(&column) {
            return true;
        }
        let tokens: Vec<&str> = column.split('_').collect();
        self.patterns.iter().any(|pattern| {
            // Short patterns like "dob" or "ssn" must match a whole token
            if pattern.len() < 5 {
                tokens.iter().any(|t| t == pattern)
            } else {
                column.contains(pattern.as_str())
            }
        })
    }
}

impl From<&CatalogConfig> for SensitivityRules {
    fn from(config: &CatalogConfig) -> Self {
        Self::new(&config.sensitive_patterns, &config.sensitive_columns)
    }
}

/// Introspects the live database. Nothing is cached: every `describe` re-reads the
/// catalog.
pub struct SchemaCatalog {
    pool: DbPool,
    schema: String,
    rules: SensitivityRules,
}

type Row3 = (String, String, String);

impl SchemaCatalog {
    pub fn new(pool: DbPool, config: &CatalogConfig) -> Self {
        Self {
            pool,
            schema: config.schema.clone(),
            rules: SensitivityRules::from(config),
        }
    }

    pub async fn describe(&self) -> Result<SchemaDescription, PipelineError> {
        let pool = self.pool.clone();
        let schema = self.schema.clone();
        let rules = self.rules.clone();

        let described = tokio::task::spawn_blocking(move || introspect(&pool, &schema, &rules))
            .await
            .map_err(|e| PipelineError::Introspection(format!("introspection task failed: {}", e)))??;

        info!(
            "Introspected {} tables from schema '{}'",
            described.tables.len(),
            self.schema
        );
        Ok(described)
    }
}

fn introspection_error(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Introspection(e.to_string())
}

fn introspect(
    pool: &DbPool,
    schema: &str,
    rules: &SensitivityRules,
) -> Result<SchemaDescription, PipelineError> {
    let conn = pool.get().map_err(introspection_error)?;

    let mut stmt = conn
        .prepare(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = ? AND table_type = 'BASE TABLE' \
             ORDER BY table_name",
        )
        .map_err(introspection_error)?;
    let table_names: Vec<String> = stmt
        .query_map([schema], |row| row.get::<_, String>(0))
        .map_err(introspection_error)?
        .collect::<Result<_, _>>()
        .map_err(introspection_error)?;

    let mut stmt = conn
        .prepare(
            "SELECT table_name, column_name, data_type, is_nullable \
             FROM information_schema.columns \
             WHERE table_schema = ? \
             ORDER BY table_name, ordinal_position",
        )
        .map_err(introspection_error)?;
    let column_rows: Vec<(String, String, String, String)> = stmt
        .query_map([schema], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })
        .map_err(introspection_error)?
        .collect::<Result<_, _>>()
        .map_err(introspection_error)?;

    let mut stmt = conn
        .prepare(
            "SELECT table_name, constraint_type, constraint_text FROM duckdb_constraints() \
             WHERE schema_name = ? AND constraint_type IN ('PRIMARY KEY', 'FOREIGN KEY')",
        )
        .map_err(introspection_error)?;
    let constraints: Vec<Row3> = stmt
        .query_map([schema], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
        .map_err(introspection_error)?
        .collect::<Result<_, _>>()
        .map_err(introspection_error)?;

    let mut columns_by_table: HashMap<String, Vec<ColumnDescription>> = HashMap::new();
    for (table, name, data_type, is_nullable) in column_rows {
        let mut column = ColumnDescription::new(name, data_type);
        column.nullable = is_nullable.eq_ignore_ascii_case("YES");
        column.sensitive = rules.is_sensitive(&column.name);
        columns_by_table.entry(table).or_default().push(column);
    }

    let mut tables = Vec::with_capacity(table_names.len());
    for name in &table_names {
        let columns = columns_by_table.remove(name).unwrap_or_default();
        if columns.is_empty() {
            return Err(PipelineError::Introspection(format!(
                "table '{}' reported no columns",
                name
            )));
        }
        tables.push(TableDescription {
            name: name.clone(),
            columns,
        });
    }

    apply_constraints(&mut tables, &constraints);

    let id_tables: Vec<(String, bool)> = tables
        .iter()
        .map(|t| (t.name.clone(), t.column("id").is_some()))
        .collect();
    for table in &mut tables {
        table.infer_foreign_keys(&id_tables);
    }

    debug!("Schema snapshot: {:?}", table_names);
    Ok(SchemaDescription::new(tables))
}

fn split_column_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(|c| c.trim().trim_matches('"').to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

fn apply_constraints(tables: &mut [TableDescription], constraints: &[Row3]) {
    for (table_name, constraint_type, text) in constraints {
        let Some(table) = tables.iter_mut().find(|t| &t.name == table_name) else {
            continue;
        };

        if constraint_type == "PRIMARY KEY" {
            if let Some(caps) = PRIMARY_KEY_RE.captures(text) {
                for column in split_column_list(&caps[1]) {
                    if let Some(col) = table.columns.iter_mut().find(|c| c.name == column) {
                        col.primary_key = true;
                        col.nullable = false;
                    }
                }
            }
            continue;
        }

        let Some(caps) = FOREIGN_KEY_RE.captures(text) else {
            warn!("Unrecognized constraint on {}: {}", table_name, text);
            continue;
        };
        let local = split_column_list(&caps[1]);
        let referenced_table = caps[2].rsplit('.').next().unwrap_or(&caps[2]).to_string();
        let remote = split_column_list(&caps[3]);

        for (i, column) in local.iter().enumerate() {
            if let Some(col) = table.columns.iter_mut().find(|c| &c.name == column) {
                col.references = Some(ForeignKey {
                    table: referenced_table.clone(),
                    column: remote.get(i).cloned().unwrap_or_else(|| "id".to_string()),
                    inferred: false,
                });
            }
        }
    }
}
