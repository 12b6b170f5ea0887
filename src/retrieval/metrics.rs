use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;

use super::{RetrievalResult, RetrievalStrategy};

const DEFAULT_CAPACITY: usize = 1000;

/// One retrieval call as observed by the service.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalRecord {
    pub strategy: RetrievalStrategy,
    pub question: String,
    pub tables_selected: Vec<String>,
    pub token_estimate: usize,
    pub full_token_estimate: usize,
    pub token_reduction_pct: f64,
    pub latency_ms: f64,
    pub fell_back: bool,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategySummary {
    pub strategy: RetrievalStrategy,
    pub queries_processed: usize,
    pub avg_token_reduction: f64,
    pub avg_latency_ms: f64,
    pub avg_table_count: f64,
    pub fallbacks: usize,
}

/// Bounded, oldest-first log of retrieval calls.
pub struct RetrievalLog {
    records: Mutex<VecDeque<RetrievalRecord>>,
    capacity: usize,
}

impl Default for RetrievalLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl RetrievalLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<RetrievalRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, question: &str, result: &RetrievalResult) {
        let record = RetrievalRecord {
            strategy: result.strategy,
            question: question.to_string(),
            tables_selected: result.table_names(),
            token_estimate: result.token_estimate,
            full_token_estimate: result.full_token_estimate,
            token_reduction_pct: result.token_reduction_pct(),
            latency_ms: result.latency_ms,
            fell_back: result.fell_back,
            recorded_at: Utc::now(),
        };

        let mut records = self.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    pub fn records(&self) -> Vec<RetrievalRecord> {
        self.lock().iter().cloned().collect()
    }

    /// Per-strategy averages, in strategy order; strategies never used are omitted.
    pub fn summary(&self) -> Vec<StrategySummary> {
        let records = self.lock();
        RetrievalStrategy::ALL
            .iter()
            .filter_map(|strategy| {
                let runs: Vec<&RetrievalRecord> =
                    records.iter().filter(|r| r.strategy == *strategy).collect();
                if runs.is_empty() {
                    return None;
                }
                let n = runs.len() as f64;
                Some(StrategySummary {
                    strategy: *strategy,
                    queries_processed: runs.len(),
                    avg_token_reduction: runs.iter().map(|r| r.token_reduction_pct).sum::<f64>() / n,
                    avg_latency_ms: runs.iter().map(|r| r.latency_ms).sum::<f64>() / n,
                    avg_table_count: runs.iter().map(|r| r.tables_selected.len() as f64).sum::<f64>()
                        / n,
                    fallbacks: runs.iter().filter(|r| r.fell_back).count(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::{ColumnDescription, SchemaDescription, TableDescription};

    fn result(strategy: RetrievalStrategy, tables: &[&str], tokens: usize) -> RetrievalResult {
        RetrievalResult {
            strategy,
            selected: SchemaDescription::new(
                tables
                    .iter()
                    .map(|t| TableDescription {
                        name: t.to_string(),
                        columns: vec![ColumnDescription::new("id", "INTEGER")],
                    })
                    .collect(),
            ),
            token_estimate: tokens,
            full_token_estimate: 100,
            latency_ms: 2.0,
            rationale: String::new(),
            fell_back: false,
        }
    }

    #[test]
    fn summarizes_per_strategy() {
        let log = RetrievalLog::default();
        log.record("q1", &result(RetrievalStrategy::Keyword, &["orders"], 20));
        log.record("q2", &result(RetrievalStrategy::Keyword, &["orders", "customers"], 40));
        log.record("q3", &result(RetrievalStrategy::Full, &["a", "b", "c"], 100));

        let summary = log.summary();
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].strategy, RetrievalStrategy::Full);
        assert_eq!(summary[0].avg_token_reduction, 0.0);

        let keyword = &summary[1];
        assert_eq!(keyword.queries_processed, 2);
        assert!((keyword.avg_token_reduction - 70.0).abs() < 1e-9);
        assert!((keyword.avg_table_count - 1.5).abs() < 1e-9);
    }

    #[test]
    fn drops_oldest_beyond_capacity() {
        let log = RetrievalLog::with_capacity(2);
        for q in ["a", "b", "c"] {
            log.record(q, &result(RetrievalStrategy::Vector, &["orders"], 10));
        }
        let questions: Vec<String> = log.records().into_iter().map(|r| r.question).collect();
        assert_eq!(questions, vec!["b", "c"]);
    }
}
