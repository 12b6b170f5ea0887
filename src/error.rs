use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::{LlmError, TokenUsage};

/// Failures that terminate a pipeline run.
///
/// A compliance rejection is not an error: it is a verdict, reported through
/// [`crate::pipeline::compliance::Verdict`].
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("schema introspection failed: {0}")]
    Introspection(String),

    #[error("completion service failed: {0}")]
    Completion(#[from] LlmError),

    #[error("could not extract SQL: {message}")]
    Generation { message: String, usage: TokenUsage },

    #[error("query execution failed: {0}")]
    Execution(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Introspection,
    Completion,
    Generation,
    Execution,
}

impl PipelineError {
    pub fn generation(message: impl Into<String>, usage: TokenUsage) -> Self {
        PipelineError::Generation {
            message: message.into(),
            usage,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Introspection(_) => ErrorKind::Introspection,
            PipelineError::Completion(_) => ErrorKind::Completion,
            PipelineError::Generation { .. } => ErrorKind::Generation,
            PipelineError::Execution(_) => ErrorKind::Execution,
        }
    }

    /// Tokens already spent when the failure happened.
    pub fn usage(&self) -> TokenUsage {
        match self {
            PipelineError::Generation { usage, .. } => *usage,
            _ => TokenUsage::default(),
        }
    }

    pub fn guidance(&self) -> Option<&'static str> {
        match self {
            PipelineError::Generation { .. } => {
                Some("No usable SQL came back; try rephrasing the question more concretely.")
            }
            PipelineError::Execution(_) => Some(
                "The database could not run the query. This is an execution fault, not a policy violation.",
            ),
            PipelineError::Completion(_) => {
                Some("The language model backend is unavailable; check the llm configuration.")
            }
            PipelineError::Introspection(_) => None,
        }
    }
}
