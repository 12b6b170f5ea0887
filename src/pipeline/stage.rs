use serde::Serialize;
use std::fmt;

use super::execute::ResultSet;
use crate::error::{ErrorKind, PipelineError};
use crate::llm::{CostModel, TokenUsage};
use crate::retrieval::{RetrievalResult, RetrievalStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Retrieve,
    Generate,
    Review,
    Comply,
    Execute,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Retrieve => "retrieve",
            Stage::Generate => "generate",
            Stage::Review => "review",
            Stage::Comply => "comply",
            Stage::Execute => "execute",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Rejected,
    Failed,
}

/// A compliance rule that fired, by name, with the reason shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub rule: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StagePayload {
    Retrieval {
        strategy: RetrievalStrategy,
        tables: Vec<String>,
        token_estimate: usize,
        full_token_estimate: usize,
        token_reduction_pct: f64,
        rationale: String,
        fell_back: bool,
    },
    Generated {
        sql: String,
    },
    Reviewed {
        sql: String,
        revised: bool,
    },
    Verdict {
        verb: String,
        notes: Vec<String>,
    },
    Rows(ResultSet),
    Rejection(Rejection),
    Error {
        kind: ErrorKind,
        message: String,
        guidance: Option<String>,
    },
}

impl From<&RetrievalResult> for StagePayload {
    fn from(result: &RetrievalResult) -> Self {
        StagePayload::Retrieval {
            strategy: result.strategy,
            tables: result.table_names(),
            token_estimate: result.token_estimate,
            full_token_estimate: result.full_token_estimate,
            token_reduction_pct: result.token_reduction_pct(),
            rationale: result.rationale.clone(),
            fell_back: result.fell_back,
        }
    }
}

impl From<&PipelineError> for StagePayload {
    fn from(err: &PipelineError) -> Self {
        StagePayload::Error {
            kind: err.kind(),
            message: err.to_string(),
            guidance: err.guidance().map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StageCost {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub usd: f64,
}

impl StageCost {
    pub fn priced(usage: TokenUsage, costs: &CostModel) -> Self {
        Self {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            usd: costs.cost(usage),
        }
    }
}

/// Outcome record of one stage of one run.
#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub stage: Stage,
    pub status: StageStatus,
    pub payload: StagePayload,
    pub cost: StageCost,
    pub elapsed_ms: f64,
}

/// What a stage hands back to the orchestrator.
#[derive(Debug)]
pub enum StageOutcome<T> {
    Continue(T),
    Reject(Rejection),
    Fail(PipelineError),
}

impl<T> StageOutcome<T> {
    /// Stages that can only succeed or fail.
    pub fn from_result(result: Result<T, PipelineError>) -> Self {
        match result {
            Ok(value) => StageOutcome::Continue(value),
            Err(err) => StageOutcome::Fail(err),
        }
    }
}
