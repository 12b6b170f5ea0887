//! Pulls a SQL statement out of free-form model output.
//!
//! A candidate only counts when it parses as DuckDB SQL, so prose that happens to open
//! with a keyword ("With pleasure, ...") is skipped.

use serde_json::Value;
use sqlparser::dialect::DuckDbDialect;
use sqlparser::parser::Parser;
use tracing::debug;

const SQL_KEYWORDS: [&str; 11] = [
    "SELECT", "WITH", "INSERT", "UPDATE", "DELETE", "CREATE", "ALTER", "DROP", "TRUNCATE",
    "MERGE", "VALUES",
];

const JSON_KEYS: [&str; 4] = ["sql", "sqlquery", "reviewed_sqlquery", "query"];

fn starts_with_keyword(text: &str) -> bool {
    let first = text
        .trim_start_matches(|c: char| c.is_whitespace() || c == '(')
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    SQL_KEYWORDS.contains(&first.as_str())
}

fn parses(sql: &str) -> bool {
    matches!(Parser::parse_sql(&DuckDbDialect {}, sql), Ok(statements) if !statements.is_empty())
}

fn is_statement(text: &str) -> bool {
    starts_with_keyword(text) && parses(text)
}

/// Returns the first recognizable statement, or `None` when the response has none.
pub fn extract_sql(content: &str) -> Option<String> {
    // ```sql ... ``` blocks first, then bare ``` ... ``` blocks
    for marker in ["```sql", "```SQL", "```"] {
        let mut rest = content;
        while let Some(start) = rest.find(marker) {
            let after = &rest[start + marker.len()..];
            let Some(end) = after.find("```") else {
                break;
            };
            let block = after[..end].trim();
            if is_statement(block) {
                debug!("Extracted SQL from code block: {}", block);
                return Some(block.to_string());
            }
            rest = &after[end + 3..];
        }
    }

    if let Some(sql) = extract_from_json(content) {
        debug!("Extracted SQL from JSON payload: {}", sql);
        return Some(sql);
    }

    // Line scan: from each line that opens with a keyword, gather lines up to a fence or
    // `;` and keep the longest run that parses
    let lines: Vec<&str> = content.lines().map(str::trim).collect();
    for (i, line) in lines.iter().enumerate() {
        if !starts_with_keyword(line) {
            continue;
        }

        let mut span = Vec::new();
        for next_line in &lines[i..] {
            if next_line.starts_with("```") {
                break;
            }
            if next_line.is_empty() {
                continue;
            }
            span.push(*next_line);
            if next_line.ends_with(';') {
                break;
            }
        }

        for end in (1..=span.len()).rev() {
            let sql = span[..end].join(" ");
            if parses(&sql) {
                debug!("Extracted SQL using line scanning: {}", sql);
                return Some(sql);
            }
        }
    }

    None
}

fn extract_from_json(content: &str) -> Option<String> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end <= start {
        return None;
    }
    let value: Value = serde_json::from_str(&content[start..=end]).ok()?;
    JSON_KEYS
        .iter()
        .filter_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|sql| is_statement(sql))
        .map(str::to_string)
}

/// Collapses whitespace, drops trailing semicolons and case-folds everything outside
/// quoted text, so cosmetically different statements compare equal.
pub fn normalize_sql(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut pending_space = false;

    for c in sql.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace()).chars() {
        match quote {
            Some(q) => {
                out.push(c);
                if c == q {
                    quote = None;
                }
            }
            None if c.is_whitespace() => pending_space = true,
            None => {
                if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                if c == '\'' || c == '"' {
                    quote = Some(c);
                    out.push(c);
                } else {
                    out.extend(c.to_lowercase());
                }
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_sql_fence() {
        let response = "Here you go:\n```sql\nSELECT * FROM customers;\n```\nThis lists them.";
        assert_eq!(extract_sql(response).as_deref(), Some("SELECT * FROM customers;"));
    }

    #[test]
    fn skips_non_sql_fences() {
        let response = "```text\nnot sql\n```\n```\nselect 1;\n```";
        assert_eq!(extract_sql(response).as_deref(), Some("select 1;"));
    }

    #[test]
    fn reads_json_payload() {
        let response = r#"{"sqlquery": "SELECT name FROM products"}"#;
        assert_eq!(extract_sql(response).as_deref(), Some("SELECT name FROM products"));
    }

    #[test]
    fn scans_lines_after_primed_fence() {
        // The generation prompt ends with an open ```sql fence, so models often reply
        // with the statement and a closing fence only.
        let response = "SELECT id,\n  name\nFROM customers;\n```\n";
        assert_eq!(
            extract_sql(response).as_deref(),
            Some("SELECT id, name FROM customers;")
        );
    }

    #[test]
    fn prose_opening_with_a_keyword_is_skipped() {
        let response = "With pleasure, here is the query:\nSELECT * FROM customers;";
        assert_eq!(extract_sql(response).as_deref(), Some("SELECT * FROM customers;"));

        let response = "Update: I fixed the join.\nSELECT o.id\nFROM orders o;\nDelete nothing.";
        assert_eq!(extract_sql(response).as_deref(), Some("SELECT o.id FROM orders o;"));

        assert_eq!(extract_sql("With that said, nothing needs to change."), None);
    }

    #[test]
    fn unparseable_fences_are_skipped() {
        let response = "```sql\nSELECT FROM WHERE;\n```\nSELECT 1;";
        assert_eq!(extract_sql(response).as_deref(), Some("SELECT 1;"));
    }

    #[test]
    fn prose_only_yields_nothing() {
        assert_eq!(extract_sql("I am not sure what you mean."), None);
        assert_eq!(extract_sql(""), None);
    }

    #[test]
    fn normalization_ignores_layout_and_case() {
        assert_eq!(
            normalize_sql("SELECT  *\nFROM customers ;"),
            normalize_sql("select * from customers")
        );
        assert_ne!(
            normalize_sql("SELECT * FROM t WHERE name = 'Bob'"),
            normalize_sql("SELECT * FROM t WHERE name = 'bob'")
        );
    }
}
