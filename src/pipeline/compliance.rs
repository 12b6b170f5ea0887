//! Rule-based gate between review and execution.
//!
//! The checker never asks a model. It parses the text with the DuckDB dialect, takes each
//! statement's verb from the syntax tree and applies the configured verb lists and the
//! sensitive-column rule. Same input, same verdict. Text that does not parse is rejected.

use serde::Serialize;
use sqlparser::ast::{Expr, SetExpr, Statement, visit_expressions};
use sqlparser::dialect::DuckDbDialect;
use sqlparser::parser::Parser;
use std::collections::BTreeSet;
use std::fmt;
use std::ops::ControlFlow;
use tracing::{debug, info};

use super::stage::Rejection;
use crate::config::ComplianceConfig;
use crate::db::schema::SchemaDescription;

/// Verbs that only read.
const READ_ONLY_VERBS: &[&str] = &[
    "SELECT", "VALUES", "TABLE", "FROM", "SHOW", "DESCRIBE", "SUMMARIZE", "EXPLAIN",
];

/// Replacing an object discards its data, so it falls under the `DROP` rule.
const CREATE_OR_REPLACE: &str = "CREATE OR REPLACE";

/// SQL text that passed compliance. Only [`ComplianceChecker::check`] creates one, so
/// holding it proves the statement was checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct AllowedSql(String);

impl AllowedSql {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AllowedSql {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Allowed {
        sql: AllowedSql,
        verb: String,
        notes: Vec<String>,
    },
    Rejected {
        rule: String,
        reason: String,
    },
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed { .. })
    }

    fn rejected(rule: &str, reason: impl Into<String>) -> Self {
        Verdict::Rejected {
            rule: rule.to_string(),
            reason: reason.into(),
        }
    }

    pub fn rejection(&self) -> Option<Rejection> {
        match self {
            Verdict::Rejected { rule, reason } => Some(Rejection {
                rule: rule.clone(),
                reason: reason.clone(),
            }),
            Verdict::Allowed { .. } => None,
        }
    }
}

fn first_keyword(text: &str) -> String {
    text.trim_start_matches(|c: char| c == '(' || c.is_whitespace())
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or("")
        .to_ascii_uppercase()
}

/// Upper-cased verb of a parsed statement. A `WITH` query reports the verb of its body.
fn statement_verb(statement: &Statement) -> String {
    match statement {
        Statement::Query(query) => match first_keyword(&query.body.to_string()).as_str() {
            "" => "SELECT".to_string(),
            verb => verb.to_string(),
        },
        other => {
            let text = other.to_string();
            if text.to_ascii_uppercase().starts_with(CREATE_OR_REPLACE) {
                CREATE_OR_REPLACE.to_string()
            } else {
                first_keyword(&text)
            }
        }
    }
}

/// Bare, lower-cased column names in a rendered column list such as `(a, t.b)`.
fn column_names(rendered: &str) -> impl Iterator<Item = String> + '_ {
    rendered
        .split(|c: char| c == ',' || c == '(' || c == ')')
        .filter_map(|part| part.rsplit('.').next())
        .map(|name| name.trim().trim_matches('"').to_lowercase())
        .filter(|name| !name.is_empty())
}

/// Columns the statement names anywhere in an expression, plus the columns it writes.
fn referenced_columns(statement: &Statement) -> BTreeSet<String> {
    let mut columns = BTreeSet::new();
    let _ = visit_expressions(statement, |expr| {
        match expr {
            Expr::Identifier(ident) => {
                columns.insert(ident.value.to_lowercase());
            }
            Expr::CompoundIdentifier(parts) => {
                if let Some(last) = parts.last() {
                    columns.insert(last.value.to_lowercase());
                }
            }
            _ => {}
        }
        ControlFlow::<()>::Continue(())
    });
    write_targets(statement, &mut columns);
    columns
}

fn write_targets(statement: &Statement, columns: &mut BTreeSet<String>) {
    match statement {
        Statement::Insert(insert) => {
            for column in &insert.columns {
                columns.extend(column_names(&column.to_string()));
            }
        }
        Statement::Update(update) => {
            for assignment in &update.assignments {
                columns.extend(column_names(&assignment.target.to_string()));
            }
        }
        Statement::Query(query) => {
            if let SetExpr::Insert(inner) | SetExpr::Update(inner) = query.body.as_ref() {
                write_targets(inner, columns);
            }
        }
        _ => {}
    }
}

/// Enforces the statement policy: no denied verbs, nothing reaching outside the database,
/// no writes touching sensitive columns.
#[derive(Debug, Clone)]
pub struct ComplianceChecker {
    denied_verbs: Vec<String>,
    external_verbs: Vec<String>,
}

fn upper_case_except(verbs: &[String], permitted: &[String]) -> Vec<String> {
    verbs
        .iter()
        .map(|v| v.trim().to_ascii_uppercase())
        .filter(|v| !permitted.contains(v))
        .collect()
}

impl From<&ComplianceConfig> for ComplianceChecker {
    fn from(config: &ComplianceConfig) -> Self {
        let permitted: Vec<String> = config
            .permitted_verbs
            .iter()
            .map(|v| v.trim().to_ascii_uppercase())
            .collect();
        Self {
            denied_verbs: upper_case_except(&config.denied_verbs, &permitted),
            external_verbs: upper_case_except(&config.external_verbs, &permitted),
        }
    }
}

impl Default for ComplianceChecker {
    fn default() -> Self {
        Self::from(&ComplianceConfig::default())
    }
}

impl ComplianceChecker {
    pub fn check(&self, sql: &str, schema: &SchemaDescription) -> Verdict {
        let statements = match Parser::parse_sql(&DuckDbDialect {}, sql) {
            Ok(statements) => statements,
            Err(e) => {
                info!("Compliance rejected unparseable SQL: {}", e);
                return Verdict::rejected("unparseable", format!("statement could not be parsed: {}", e));
            }
        };
        if statements.is_empty() {
            return Verdict::rejected("empty_statement", "empty statement");
        }

        let sensitive = schema.sensitive_columns();
        let mut notes = Vec::new();
        let mut verbs = Vec::with_capacity(statements.len());

        for statement in &statements {
            match self.check_statement(statement, &sensitive) {
                Ok((verb, note)) => {
                    notes.extend(note);
                    verbs.push(verb);
                }
                Err(verdict) => return verdict,
            }
        }

        if statements.len() > 1 {
            return Verdict::rejected(
                "single_statement",
                format!("expected one statement, found {}", statements.len()),
            );
        }

        debug!("Compliance allowed {:?}", verbs);
        Verdict::Allowed {
            sql: AllowedSql(sql.trim().to_string()),
            verb: verbs.remove(0),
            notes,
        }
    }

    fn is_denied(&self, verb: &str) -> bool {
        let denied = |v: &str| self.denied_verbs.iter().any(|d| d == v);
        denied(verb) || (verb == CREATE_OR_REPLACE && denied("DROP"))
    }

    /// The statement's verb and an optional note, or the rejection it earns.
    fn check_statement(
        &self,
        statement: &Statement,
        sensitive: &BTreeSet<String>,
    ) -> Result<(String, Option<String>), Verdict> {
        // EXPLAIN ANALYZE executes what it explains
        if let Statement::Explain {
            statement: inner,
            analyze: true,
            ..
        } = statement
        {
            return self.check_statement(inner, sensitive);
        }

        let verb = statement_verb(statement);
        if verb.is_empty() {
            return Err(Verdict::rejected("empty_statement", "empty statement"));
        }
        if self.is_denied(&verb) {
            info!("Compliance rejected {} statement", verb);
            return Err(Verdict::rejected("forbidden_verb", format!("forbidden verb: {}", verb)));
        }
        if self.external_verbs.contains(&verb) {
            info!("Compliance rejected {} statement", verb);
            return Err(Verdict::rejected(
                "external_access",
                format!("statement reaches outside the database: {}", verb),
            ));
        }

        let touched: Vec<String> = referenced_columns(statement)
            .into_iter()
            .filter(|column| sensitive.contains(column))
            .collect();
        if touched.is_empty() {
            return Ok((verb, None));
        }
        if READ_ONLY_VERBS.contains(&verb.as_str()) {
            let note = format!("reads sensitive columns: {}", touched.join(", "));
            return Ok((verb, Some(note)));
        }

        info!("Compliance rejected {} touching sensitive column {}", verb, touched[0]);
        Err(Verdict::rejected(
            "sensitive_column",
            format!("sensitive column referenced: {}", touched[0]),
        ))
    }
}
