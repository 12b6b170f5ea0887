//! The query pipeline: retrieve, generate, review, comply, execute.
//!
//! Each stage reports a [`StageOutcome`]. `Continue` hands its value to the next stage;
//! `Reject` and `Fail` end the run. Every outcome, including the terminal one, is
//! recorded as a [`StageResult`] in the run log, so an aborted run still shows how far
//! it got and why it stopped.

pub mod compliance;
pub mod execute;
pub mod generate;
pub mod history;
pub mod review;
pub mod stage;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::db::schema::SchemaDescription;
use crate::llm::{CompletionService, CostModel, TokenUsage};
use crate::retrieval::{RetrievalService, RetrievalStrategy};

use self::compliance::{ComplianceChecker, Verdict};
use self::execute::{QueryExecutor, ResultSet};
use self::generate::SqlGenerator;
use self::review::SqlReviewer;
use self::stage::{
    Rejection, Stage, StageCost, StageOutcome, StagePayload, StageResult, StageStatus,
};

/// Per-request knobs chosen by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOptions {
    pub strategy: RetrievalStrategy,
    /// Overrides the configured model for every completion in the run.
    pub model: Option<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            strategy: RetrievalStrategy::Keyword,
            model: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub question: String,
    pub schema: Arc<SchemaDescription>,
    pub options: SessionOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Rejected,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RunTotals {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub usd: f64,
    pub elapsed_ms: f64,
}

/// The full log of one request.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub question: String,
    pub strategy: RetrievalStrategy,
    pub model: String,
    pub started_at: DateTime<Utc>,
    pub stages: Vec<StageResult>,
    pub status: RunStatus,
    pub totals: RunTotals,
}

impl PipelineRun {
    pub fn terminal(&self) -> Option<&StageResult> {
        self.stages.last()
    }

    /// The most refined statement the run produced: reviewed if review ran, else generated.
    pub fn final_sql(&self) -> Option<&str> {
        self.stages.iter().rev().find_map(|s| match &s.payload {
            StagePayload::Reviewed { sql, .. } | StagePayload::Generated { sql } => {
                Some(sql.as_str())
            }
            _ => None,
        })
    }

    pub fn result_set(&self) -> Option<&ResultSet> {
        self.stages.iter().find_map(|s| match &s.payload {
            StagePayload::Rows(rows) => Some(rows),
            _ => None,
        })
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

/// Collects stage results for one run and forwards each to an optional observer.
struct RunRecorder<'a> {
    stages: Vec<StageResult>,
    status: RunStatus,
    model: String,
    costs: &'a CostModel,
    observer: Option<&'a mpsc::UnboundedSender<StageResult>>,
}

impl<'a> RunRecorder<'a> {
    fn push(&mut self, result: StageResult) {
        info!(
            "Stage {} {:?} in {:.1} ms",
            result.stage, result.status, result.elapsed_ms
        );
        if let Some(observer) = self.observer {
            if observer.send(result.clone()).is_err() {
                // The run still finishes and is returned; later stages are not sent
                debug!("Stage observer went away before {}, no longer streaming", result.stage);
                self.observer = None;
            }
        }
        self.stages.push(result);
    }

    /// Records the outcome of `stage` and returns the value to carry forward, if any.
    fn settle<T>(
        &mut self,
        stage: Stage,
        outcome: StageOutcome<T>,
        started: Instant,
        describe: impl FnOnce(&T) -> (StagePayload, TokenUsage),
    ) -> Option<T> {
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let (status, payload, usage, value) = match outcome {
            StageOutcome::Continue(value) => {
                let (payload, usage) = describe(&value);
                (StageStatus::Succeeded, payload, usage, Some(value))
            }
            StageOutcome::Reject(rejection) => {
                self.status = RunStatus::Rejected;
                (
                    StageStatus::Rejected,
                    StagePayload::Rejection(rejection),
                    TokenUsage::default(),
                    None,
                )
            }
            StageOutcome::Fail(err) => {
                warn!("Stage {} failed: {}", stage, err);
                self.status = RunStatus::Failed;
                (StageStatus::Failed, StagePayload::from(&err), err.usage(), None)
            }
        };

        self.push(StageResult {
            stage,
            status,
            payload,
            cost: StageCost::priced(usage, self.costs),
            elapsed_ms,
        });
        value
    }
}

pub struct Pipeline {
    retrieval: Arc<RetrievalService>,
    generator: SqlGenerator,
    reviewer: SqlReviewer,
    compliance: ComplianceChecker,
    executor: QueryExecutor,
    costs: CostModel,
    backend: String,
    default_model: String,
}

impl Pipeline {
    pub fn new(
        retrieval: Arc<RetrievalService>,
        llm: Arc<dyn CompletionService>,
        compliance: ComplianceChecker,
        executor: QueryExecutor,
        costs: CostModel,
    ) -> Self {
        Self {
            retrieval,
            backend: llm.backend().to_string(),
            default_model: llm.model().to_string(),
            generator: SqlGenerator::new(llm.clone()),
            reviewer: SqlReviewer::new(llm),
            compliance,
            executor,
            costs,
        }
    }

    pub fn retrieval(&self) -> &Arc<RetrievalService> {
        &self.retrieval
    }

    /// Name of the completion backend behind generation and review.
    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub async fn run(&self, request: PipelineRequest) -> PipelineRun {
        self.run_observed(request, None).await
    }

    /// Like [`Pipeline::run`], also sending each stage result to `observer` as it is
    /// recorded.
    pub async fn run_observed(
        &self,
        request: PipelineRequest,
        observer: Option<&mpsc::UnboundedSender<StageResult>>,
    ) -> PipelineRun {
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(
            "Pipeline run for {:?} with {} retrieval",
            request.question, request.options.strategy
        );

        let mut recorder = RunRecorder {
            stages: Vec::new(),
            status: RunStatus::Completed,
            model: request
                .options
                .model
                .clone()
                .unwrap_or_else(|| self.default_model.clone()),
            costs: &self.costs,
            observer,
        };

        self.drive(&request, &mut recorder).await;

        let mut totals = RunTotals {
            elapsed_ms: clock.elapsed().as_secs_f64() * 1000.0,
            ..RunTotals::default()
        };
        for stage in &recorder.stages {
            totals.prompt_tokens += stage.cost.prompt_tokens;
            totals.completion_tokens += stage.cost.completion_tokens;
            totals.usd += stage.cost.usd;
        }

        info!(
            "Pipeline run finished {:?} after {} stages, ${:.6}",
            recorder.status,
            recorder.stages.len(),
            totals.usd
        );

        PipelineRun {
            question: request.question,
            strategy: request.options.strategy,
            model: recorder.model,
            started_at,
            stages: recorder.stages,
            status: recorder.status,
            totals,
        }
    }

    /// Walks the stages in order; returns `None` as soon as one rejects or fails.
    async fn drive(&self, request: &PipelineRequest, recorder: &mut RunRecorder<'_>) -> Option<()> {
        let question = request.question.as_str();
        let schema = request.schema.as_ref();
        let model = request.options.model.as_deref();
        let no_usage = TokenUsage::default();

        let started = Instant::now();
        let retrieval = self
            .retrieval
            .retrieve(question, schema, request.options.strategy)
            .await;
        let retrieval = recorder.settle(
            Stage::Retrieve,
            StageOutcome::Continue(retrieval),
            started,
            |r| (StagePayload::from(r), no_usage),
        )?;

        let started = Instant::now();
        let outcome = StageOutcome::from_result(
            self.generator
                .generate(question, &retrieval.selected, model)
                .await,
        );
        let generation = recorder.settle(Stage::Generate, outcome, started, |g| {
            (StagePayload::Generated { sql: g.sql.clone() }, g.usage)
        })?;
        recorder.model = generation.model.clone();

        // Review always sees the whole schema, whatever retrieval picked
        let started = Instant::now();
        let outcome =
            StageOutcome::from_result(self.reviewer.review(&generation.sql, schema, model).await);
        let review = recorder.settle(Stage::Review, outcome, started, |r| {
            (
                StagePayload::Reviewed {
                    sql: r.sql.clone(),
                    revised: r.revised,
                },
                r.usage,
            )
        })?;

        let started = Instant::now();
        let outcome = match self.compliance.check(&review.sql, schema) {
            Verdict::Allowed { sql, verb, notes } => StageOutcome::Continue((sql, verb, notes)),
            Verdict::Rejected { rule, reason } => StageOutcome::Reject(Rejection { rule, reason }),
        };
        let (allowed, _, _) = recorder.settle(Stage::Comply, outcome, started, |(_, verb, notes)| {
            (
                StagePayload::Verdict {
                    verb: verb.clone(),
                    notes: notes.clone(),
                },
                no_usage,
            )
        })?;

        let started = Instant::now();
        let outcome = StageOutcome::from_result(self.executor.execute(&allowed).await);
        recorder.settle(Stage::Execute, outcome, started, |rows: &ResultSet| {
            (StagePayload::Rows(rows.clone()), no_usage)
        })?;

        Some(())
    }
}
