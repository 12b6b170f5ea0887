use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::schema::SchemaDescription;
use crate::error::PipelineError;
use crate::llm::extract::extract_sql;
use crate::llm::{CompletionRequest, CompletionService, TokenUsage};

#[derive(Debug, Clone)]
pub struct Generation {
    pub sql: String,
    pub usage: TokenUsage,
    pub model: String,
}

/// Turns a question plus schema context into one candidate statement.
pub struct SqlGenerator {
    llm: Arc<dyn CompletionService>,
}

impl SqlGenerator {
    pub fn new(llm: Arc<dyn CompletionService>) -> Self {
        Self { llm }
    }

    pub fn prompt(question: &str, schema_context: &str) -> String {
        format!(
            r#"
### Instructions:
Your task is to convert a question into a SQL query for DuckDB, given a database schema.
Adhere to these rules:
- **Use the exact spelling of table and column names as provided in the schema**
- **Only reference tables and columns that appear in the schema**
- **Deliberately go through the question and database schema word by word** to appropriately answer the question
- **Use Table Aliases** to prevent ambiguity. For example, `SELECT c.name, o.total FROM customers c JOIN orders o ON o.customer_id = c.id`.
- When creating a ratio, always cast the numerator as float
- Return exactly one statement

### Input:
Generate a SQL query that answers the question `{question}`.
This query will run on a DuckDB database with the following tables and columns:

{schema_context}

### Expected SQL Format:
- Reference column names exactly as shown in the schema
- Use double quotes around identifiers with spaces or special characters
- End your query with a semicolon

### Response:
Based on your instructions, here is the SQL query I have generated to answer the question `{question}`:
```sql
"#
        )
    }

    pub async fn generate(
        &self,
        question: &str,
        schema: &SchemaDescription,
        model: Option<&str>,
    ) -> Result<Generation, PipelineError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(PipelineError::generation("the question is empty", TokenUsage::default()));
        }

        let prompt = Self::prompt(question, &schema.to_prompt_context());
        debug!("Generation prompt: {}", prompt);

        let completion = self
            .llm
            .complete(CompletionRequest::new(&prompt).with_model(model))
            .await?;

        let Some(sql) = extract_sql(&completion.text) else {
            warn!("No SQL statement in model response: {}", completion.text);
            return Err(PipelineError::generation(
                "the model response contained no recognizable SQL statement",
                completion.usage,
            ));
        };

        info!("Generated SQL: {}", sql);
        Ok(Generation {
            sql,
            usage: completion.usage,
            model: completion.model,
        })
    }
}
