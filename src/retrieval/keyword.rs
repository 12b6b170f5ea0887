use async_trait::async_trait;
use std::collections::{HashMap, HashSet};

use super::text::{identifier_terms, stem, terms};
use super::{RetrievalError, RetrievalStrategy, SchemaRetriever, Selection};
use crate::db::schema::SchemaDescription;

const TABLE_HIT: usize = 3;
const COLUMN_HIT: usize = 1;

/// Canonical schema term followed by the everyday words people use for it.
const BUILTIN_SYNONYMS: &[(&str, &[&str])] = &[
    ("customer", &["user", "client", "buyer", "shopper", "account"]),
    ("product", &["item", "catalog", "goods", "merchandise", "sku"]),
    ("order", &["purchase", "transaction", "sale", "buy", "bought"]),
    ("payment", &["pay", "paid", "money", "revenue"]),
    ("total", &["amount", "revenue", "sum", "spent", "spend"]),
    ("price", &["cost", "pricing"]),
    ("quantity", &["qty", "units", "sold"]),
    ("inventory", &["stock", "warehouse", "available"]),
    ("review", &["rating", "feedback", "comment", "opinion"]),
    ("supplier", &["vendor", "procurement"]),
    ("category", &["classification", "group"]),
    ("brand", &["manufacturer", "make"]),
    ("address", &["location", "city", "country"]),
    ("shipment", &["delivery", "shipping", "tracking"]),
    ("carrier", &["courier", "shipper"]),
    ("discount", &["coupon", "promotion", "offer"]),
    ("employee", &["staff", "worker"]),
    ("date", &["when", "day", "month", "year"]),
];

/// Matches question words against table names, column names and a synonym list.
pub struct KeywordRetriever {
    max_tables: usize,
    /// Stemmed synonym to the stemmed canonical terms it stands for.
    synonyms: HashMap<String, HashSet<String>>,
}

impl KeywordRetriever {
    pub fn new(max_tables: usize, extra_synonyms: &HashMap<String, Vec<String>>) -> Self {
        let mut synonyms: HashMap<String, HashSet<String>> = HashMap::new();
        let mut add = |canonical: &str, synonym: &str| {
            synonyms
                .entry(stem(synonym))
                .or_default()
                .insert(stem(canonical));
        };

        for (canonical, words) in BUILTIN_SYNONYMS {
            for word in *words {
                add(canonical, word);
            }
        }
        for (canonical, words) in extra_synonyms {
            for word in words {
                add(canonical, word);
            }
        }

        Self {
            max_tables: max_tables.max(1),
            synonyms,
        }
    }

    fn expand(&self, term: &str) -> Vec<String> {
        let mut expanded = vec![term.to_string()];
        if let Some(canonical) = self.synonyms.get(term) {
            expanded.extend(canonical.iter().cloned());
        }
        expanded
    }

    fn score(
        &self,
        question_terms: &[String],
        schema: &SchemaDescription,
    ) -> Vec<(String, usize, Vec<String>)> {
        let mut scored = Vec::new();

        for table in &schema.tables {
            let name_terms: HashSet<String> = identifier_terms(&table.name).into_iter().collect();
            let column_terms: HashSet<String> = table
                .columns
                .iter()
                .flat_map(|c| identifier_terms(&c.name))
                .collect();

            let mut score = 0;
            let mut hits = Vec::new();
            for term in question_terms {
                let expanded = self.expand(term);
                if expanded.iter().any(|t| name_terms.contains(t)) {
                    score += TABLE_HIT;
                    hits.push(format!("{} (table)", term));
                } else if expanded.iter().any(|t| column_terms.contains(t)) {
                    score += COLUMN_HIT;
                    hits.push(format!("{} (column)", term));
                }
            }

            if score > 0 {
                scored.push((table.name.clone(), score, hits));
            }
        }

        // Stable sort keeps schema order between equal scores
        scored.sort_by(|a, b| b.1.cmp(&a.1));
        scored
    }
}

#[async_trait]
impl SchemaRetriever for KeywordRetriever {
    fn strategy(&self) -> RetrievalStrategy {
        RetrievalStrategy::Keyword
    }

    async fn select(
        &self,
        question: &str,
        schema: &SchemaDescription,
    ) -> Result<Selection, RetrievalError> {
        let question_terms = terms(question);
        let mut scored = self.score(&question_terms, schema);
        scored.truncate(self.max_tables);

        let rationale = if scored.is_empty() {
            format!("no keyword matches for {:?}", question_terms)
        } else {
            scored
                .iter()
                .map(|(table, score, hits)| format!("{} [{}]: {}", table, score, hits.join(", ")))
                .collect::<Vec<_>>()
                .join("; ")
        };

        Ok(Selection {
            tables: scored.into_iter().map(|(table, _, _)| table).collect(),
            rationale,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::{ColumnDescription, TableDescription};

    fn schema() -> SchemaDescription {
        let table = |name: &str, columns: &[&str]| TableDescription {
            name: name.to_string(),
            columns: columns.iter().map(|c| ColumnDescription::new(*c, "VARCHAR")).collect(),
        };
        SchemaDescription::new(vec![
            table("customers", &["id", "name", "email", "city"]),
            table("orders", &["id", "customer_id", "order_date", "total"]),
            table("order_items", &["id", "order_id", "product_id", "quantity", "unit_price"]),
            table("products", &["id", "name", "price", "category"]),
            table("shipping_carriers", &["id", "name", "phone"]),
        ])
    }

    #[tokio::test]
    async fn ranks_table_hits_above_column_hits() {
        let retriever = KeywordRetriever::new(5, &HashMap::new());
        let selection = retriever.select("order total", &schema()).await.unwrap();
        assert_eq!(selection.tables, vec!["orders", "order_items"]);
        assert!(selection.rationale.contains("orders [4]"));
    }

    #[tokio::test]
    async fn synonyms_reach_canonical_tables() {
        let retriever = KeywordRetriever::new(5, &HashMap::new());
        let selection = retriever.select("which buyers live in Paris", &schema()).await.unwrap();
        // customer_id on orders is a column hit
        assert_eq!(selection.tables, vec!["customers", "orders"]);
    }

    #[tokio::test]
    async fn configured_synonyms_extend_builtins() {
        let mut extra = HashMap::new();
        extra.insert("carrier".to_string(), vec!["fedex".to_string()]);
        let retriever = KeywordRetriever::new(5, &extra);
        let selection = retriever.select("fedex contacts", &schema()).await.unwrap();
        assert_eq!(selection.tables, vec!["shipping_carriers"]);
    }

    #[tokio::test]
    async fn no_match_returns_empty_selection() {
        let retriever = KeywordRetriever::new(5, &HashMap::new());
        let selection = retriever.select("weather tomorrow", &schema()).await.unwrap();
        assert!(selection.tables.is_empty());
    }

    #[tokio::test]
    async fn respects_max_tables() {
        let retriever = KeywordRetriever::new(1, &HashMap::new());
        let selection = retriever.select("order items", &schema()).await.unwrap();
        assert_eq!(selection.tables, vec!["order_items"]);
    }
}
