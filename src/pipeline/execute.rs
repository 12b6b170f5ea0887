use chrono::DateTime;
use duckdb::types::{TimeUnit, ValueRef};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::compliance::AllowedSql;
use crate::config::ExecutionConfig;
use crate::db::db_pool::DbPool;
use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Truncation {
    RowCap,
    TimeCap,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
    pub truncated: bool,
    pub truncation: Option<Truncation>,
    pub elapsed_ms: f64,
}

/// Rows read so far. Shared with the blocking reader so a timed-out query still reports
/// what it had.
#[derive(Default)]
struct Partial {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

fn lock(partial: &Mutex<Partial>) -> MutexGuard<'_, Partial> {
    partial.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Runs allowed statements against the pooled database, capping rows and time.
#[derive(Clone)]
pub struct QueryExecutor {
    pool: DbPool,
    row_cap: usize,
    time_cap: Duration,
}

impl QueryExecutor {
    pub fn new(pool: DbPool, config: &ExecutionConfig) -> Self {
        Self {
            pool,
            row_cap: config.row_cap.max(1),
            time_cap: Duration::from_millis(config.time_cap_ms),
        }
    }

    /// Runs the statement until it finishes, hits the row cap or runs out of time. A query
    /// still running at the time cap is abandoned and the rows read so far are returned.
    pub async fn execute(&self, sql: &AllowedSql) -> Result<ResultSet, PipelineError> {
        let started = Instant::now();
        let partial = Arc::new(Mutex::new(Partial::default()));
        let stop = Arc::new(AtomicBool::new(false));

        let task = {
            let pool = self.pool.clone();
            let sql = sql.as_str().to_string();
            let row_cap = self.row_cap;
            let (partial, stop) = (partial.clone(), stop.clone());
            tokio::task::spawn_blocking(move || run_query(&pool, &sql, row_cap, &partial, &stop))
        };

        let truncation = match tokio::time::timeout(self.time_cap, task).await {
            Ok(joined) => joined
                .map_err(|e| PipelineError::Execution(format!("execution task failed: {}", e)))??,
            Err(_) => {
                // The reader notices on its next row; the connection stays busy until then
                stop.store(true, Ordering::SeqCst);
                Some(Truncation::TimeCap)
            }
        };

        let Partial { columns, rows } = std::mem::take(&mut *lock(&partial));
        if let Some(reason) = truncation {
            warn!("Result truncated after {} rows ({:?})", rows.len(), reason);
        }

        let result = ResultSet {
            columns,
            row_count: rows.len(),
            rows,
            truncated: truncation.is_some(),
            truncation,
            elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
        };
        info!(
            "Query returned {} rows in {:.1} ms{}",
            result.row_count,
            result.elapsed_ms,
            if result.truncated { " (truncated)" } else { "" }
        );
        Ok(result)
    }
}

fn execution_error(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Execution(e.to_string())
}

fn run_query(
    pool: &DbPool,
    sql: &str,
    row_cap: usize,
    partial: &Mutex<Partial>,
    stop: &AtomicBool,
) -> Result<Option<Truncation>, PipelineError> {
    let conn = pool.get().map_err(execution_error)?;
    let mut stmt = conn.prepare(sql).map_err(execution_error)?;
    let mut rows = stmt.query([]).map_err(execution_error)?;

    // Column metadata is only reliable once the statement has run
    let columns: Vec<String> = rows.as_ref().map(|s| s.column_names()).unwrap_or_default();
    let width = columns.len();
    lock(partial).columns = columns;

    while let Some(row) = rows.next().map_err(execution_error)? {
        if stop.load(Ordering::SeqCst) {
            return Ok(Some(Truncation::TimeCap));
        }

        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(to_json(row.get_ref(i).map_err(execution_error)?));
        }

        let mut partial = lock(partial);
        if partial.rows.len() == row_cap {
            return Ok(Some(Truncation::RowCap));
        }
        partial.rows.push(values);
    }
    Ok(None)
}

fn to_micros(unit: TimeUnit, value: i64) -> i64 {
    match unit {
        TimeUnit::Second => value.saturating_mul(1_000_000),
        TimeUnit::Millisecond => value.saturating_mul(1_000),
        TimeUnit::Microsecond => value,
        TimeUnit::Nanosecond => value / 1_000,
    }
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Boolean(b) => Value::Bool(b),
        ValueRef::TinyInt(i) => serde_json::json!(i),
        ValueRef::SmallInt(i) => serde_json::json!(i),
        ValueRef::Int(i) => serde_json::json!(i),
        ValueRef::BigInt(i) => serde_json::json!(i),
        ValueRef::HugeInt(i) => match i64::try_from(i) {
            Ok(small) => serde_json::json!(small),
            Err(_) => Value::String(i.to_string()),
        },
        ValueRef::UTinyInt(i) => serde_json::json!(i),
        ValueRef::USmallInt(i) => serde_json::json!(i),
        ValueRef::UInt(i) => serde_json::json!(i),
        ValueRef::UBigInt(i) => serde_json::json!(i),
        ValueRef::Float(f) => serde_json::json!(f),
        ValueRef::Double(f) => serde_json::json!(f),
        ValueRef::Decimal(d) => {
            let text = d.to_string();
            match text.parse::<f64>() {
                Ok(f) => serde_json::json!(f),
                Err(_) => Value::String(text),
            }
        }
        ValueRef::Text(s) => Value::String(String::from_utf8_lossy(s).to_string()),
        ValueRef::Blob(b) => Value::String(format!("<blob {} bytes>", b.len())),
        ValueRef::Date32(days) => DateTime::from_timestamp(i64::from(days) * 86_400, 0)
            .map(|d| Value::String(d.date_naive().to_string()))
            .unwrap_or(Value::Null),
        ValueRef::Timestamp(unit, value) => DateTime::from_timestamp_micros(to_micros(unit, value))
            .map(|t| Value::String(t.naive_utc().format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
            .unwrap_or(Value::Null),
        other => Value::String(format!("{:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::db_pool::build_pool;
    use crate::db::schema::SchemaDescription;
    use crate::pipeline::compliance::{ComplianceChecker, Verdict};

    fn allowed(sql: &str) -> AllowedSql {
        match ComplianceChecker::default().check(sql, &SchemaDescription::new(vec![])) {
            Verdict::Allowed { sql, .. } => sql,
            other => panic!("expected allowed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn row_cap_keeps_the_first_rows() {
        let pool = build_pool(":memory:", 2).unwrap();
        let config = ExecutionConfig {
            row_cap: 3,
            time_cap_ms: 10_000,
        };
        let result = QueryExecutor::new(pool, &config)
            .execute(&allowed("SELECT n FROM generate_series(1, 10) AS t(n)"))
            .await
            .unwrap();

        assert_eq!(result.columns, vec!["n"]);
        assert_eq!(result.row_count, 3);
        assert_eq!(result.truncation, Some(Truncation::RowCap));
    }

    #[tokio::test]
    async fn slow_queries_stop_at_the_time_cap() {
        let pool = build_pool(":memory:", 2).unwrap();
        let config = ExecutionConfig {
            row_cap: 10,
            time_cap_ms: 5,
        };
        let started = Instant::now();
        let result = QueryExecutor::new(pool, &config)
            .execute(&allowed(
                "SELECT SUM(a.x * b.y) FROM generate_series(1, 3000) AS a(x), \
                 generate_series(1, 3000) AS b(y)",
            ))
            .await
            .unwrap();

        assert!(result.truncated);
        assert_eq!(result.truncation, Some(Truncation::TimeCap));
        assert!(result.rows.is_empty());
        assert!(started.elapsed() < Duration::from_millis(1_000), "{:?}", started.elapsed());
    }

    #[test]
    fn converts_scalars() {
        assert_eq!(to_json(ValueRef::Int(7)), serde_json::json!(7));
        assert_eq!(to_json(ValueRef::Text(b"hi")), serde_json::json!("hi"));
        assert_eq!(to_json(ValueRef::Date32(19_723)), serde_json::json!("2024-01-01"));
        assert_eq!(
            to_json(ValueRef::Timestamp(TimeUnit::Second, 1_704_067_200)),
            serde_json::json!("2024-01-01T00:00:00")
        );
    }
}
