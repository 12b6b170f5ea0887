use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;

use super::{PipelineRun, RunStatus};
use crate::retrieval::RetrievalStrategy;

/// Condensed record of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct QueryHistoryItem {
    pub question: String,
    pub strategy: RetrievalStrategy,
    pub sql: Option<String>,
    pub status: RunStatus,
    pub row_count: usize,
    pub execution_time_ms: f64,
    pub cost_usd: f64,
    pub timestamp: DateTime<Utc>,
}

impl From<&PipelineRun> for QueryHistoryItem {
    fn from(run: &PipelineRun) -> Self {
        Self {
            question: run.question.clone(),
            strategy: run.strategy,
            sql: run.final_sql().map(str::to_string),
            status: run.status,
            row_count: run.result_set().map(|r| r.row_count).unwrap_or(0),
            execution_time_ms: run.totals.elapsed_ms,
            cost_usd: run.totals.usd,
            timestamp: run.started_at,
        }
    }
}

/// Most recent runs, newest last, bounded by `capacity`.
pub struct QueryHistory {
    items: Mutex<VecDeque<QueryHistoryItem>>,
    capacity: usize,
}

impl QueryHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, run: &PipelineRun) {
        let mut items = self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if items.len() == self.capacity {
            items.pop_front();
        }
        items.push_back(QueryHistoryItem::from(run));
    }

    pub fn items(&self) -> Vec<QueryHistoryItem> {
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}
