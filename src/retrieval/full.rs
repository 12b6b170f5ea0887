use async_trait::async_trait;

use super::{RetrievalError, RetrievalStrategy, SchemaRetriever, Selection};
use crate::db::schema::SchemaDescription;

/// No narrowing: the whole schema, every time.
pub struct FullSchemaRetriever;

#[async_trait]
impl SchemaRetriever for FullSchemaRetriever {
    fn strategy(&self) -> RetrievalStrategy {
        RetrievalStrategy::Full
    }

    async fn select(
        &self,
        _question: &str,
        schema: &SchemaDescription,
    ) -> Result<Selection, RetrievalError> {
        Ok(Selection {
            tables: schema.table_names(),
            rationale: "full schema".to_string(),
        })
    }
}
