use std::sync::Arc;
use tracing::{debug, info};

use crate::db::schema::SchemaDescription;
use crate::error::PipelineError;
use crate::llm::extract::{extract_sql, normalize_sql};
use crate::llm::{CompletionRequest, CompletionService, TokenUsage};

const UNCHANGED: &str = "UNCHANGED";

#[derive(Debug, Clone)]
pub struct Review {
    pub sql: String,
    /// False when the model left the statement as it was.
    pub revised: bool,
    pub usage: TokenUsage,
}

/// Second look at a candidate statement, always against the whole schema.
pub struct SqlReviewer {
    llm: Arc<dyn CompletionService>,
}

impl SqlReviewer {
    pub fn new(llm: Arc<dyn CompletionService>) -> Self {
        Self { llm }
    }

    pub fn prompt(candidate: &str, schema_context: &str) -> String {
        format!(
            r#"
### Instructions:
You review SQL written for a DuckDB database. Check the query below for correctness and
performance against the schema: table and column names must exist, joins must follow the
key relationships, and filters or aggregations must match the intent.
- If the query is already correct and efficient, reply with the single word {UNCHANGED}.
- Otherwise reply with the corrected query only, in a ```sql block, ending with a semicolon.
Do not change what the query returns unless it is wrong.

### Schema:
{schema_context}

### Query:
```sql
{candidate}
```

### Response:
"#
        )
    }

    pub async fn review(
        &self,
        candidate: &str,
        full_schema: &SchemaDescription,
        model: Option<&str>,
    ) -> Result<Review, PipelineError> {
        let prompt = Self::prompt(candidate, &full_schema.to_prompt_context());
        let completion = self
            .llm
            .complete(CompletionRequest::new(&prompt).with_model(model))
            .await?;
        let usage = completion.usage;

        let answer = completion.text.trim();
        if answer
            .trim_matches(|c: char| !c.is_ascii_alphabetic())
            .eq_ignore_ascii_case(UNCHANGED)
        {
            debug!("Reviewer kept the candidate");
            return Ok(Review {
                sql: candidate.to_string(),
                revised: false,
                usage,
            });
        }

        let Some(revised) = extract_sql(answer) else {
            return Err(PipelineError::generation(
                "the review response contained no recognizable SQL statement",
                usage,
            ));
        };

        // Cosmetic rewrites keep the candidate text so repeated reviews are stable
        if normalize_sql(&revised) == normalize_sql(candidate) {
            return Ok(Review {
                sql: candidate.to_string(),
                revised: false,
                usage,
            });
        }

        info!("Reviewer revised SQL to: {}", revised);
        Ok(Review {
            sql: revised,
            revised: true,
            usage,
        })
    }
}
