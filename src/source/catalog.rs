//! AQ-015: Cached schema catalogs and lexical relevance ranking.
//!
//! Stands in for embedding similarity search: tables are scored by how many
//! question tokens appear in the table name (weight 3) and column names
//! (weight 1). When nothing scores, the first `top_k` tables by name are
//! returned so a question that never names a table still gets a schema.

use super::{RetrievalError, SchemaRetriever, TableSchema};
use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::HashSet;
use std::path::Path;

const TABLE_WEIGHT: usize = 3;
const COLUMN_WEIGHT: usize = 1;

/// Schema catalogs keyed by database id.
#[derive(Debug, Clone, Default)]
pub struct LexicalRetriever {
    catalogs: IndexMap<String, Vec<TableSchema>>,
}

impl LexicalRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cached catalog.
    pub fn with_catalog(mut self, database_id: &str, tables: Vec<TableSchema>) -> Self {
        self.catalogs.insert(database_id.to_string(), tables);
        self
    }

    /// Introspect a SQLite file and register it.
    pub fn with_sqlite(self, database_id: &str, path: &Path) -> Result<Self, RetrievalError> {
        let tables = super::sqlite::load_schema(path)?;
        Ok(self.with_catalog(database_id, tables))
    }

    pub fn catalog(&self, database_id: &str) -> Option<&[TableSchema]> {
        self.catalogs.get(database_id).map(Vec::as_slice)
    }

    /// Rank a catalog against a question.
    pub fn rank(tables: &[TableSchema], question: &str, top_k: usize) -> Vec<TableSchema> {
        let words = tokens(question);
        let mut scored: Vec<(usize, &TableSchema)> = tables
            .iter()
            .map(|t| (score(t, &words), t))
            .filter(|(s, _)| *s > 0)
            .collect();

        if scored.is_empty() {
            let mut by_name: Vec<&TableSchema> = tables.iter().collect();
            by_name.sort_by(|a, b| a.name.cmp(&b.name));
            return by_name.into_iter().take(top_k).cloned().collect();
        }

        scored.sort_by(|(sa, ta), (sb, tb)| sb.cmp(sa).then_with(|| ta.name.cmp(&tb.name)));
        scored.into_iter().take(top_k).map(|(_, t)| t.clone()).collect()
    }
}

#[async_trait]
impl SchemaRetriever for LexicalRetriever {
    async fn retrieve_relevant_schema(
        &self,
        database_id: &str,
        question: &str,
        top_k: usize,
    ) -> Result<Vec<TableSchema>, RetrievalError> {
        let tables = self
            .catalogs
            .get(database_id)
            .ok_or_else(|| RetrievalError::UnknownDatabase(database_id.to_string()))?;
        Ok(Self::rank(tables, question, top_k))
    }
}

fn score(table: &TableSchema, words: &HashSet<String>) -> usize {
    let mut total = 0;
    for t in tokens(&table.name) {
        if words.contains(&t) {
            total += TABLE_WEIGHT;
        }
    }
    for column in &table.columns {
        for t in tokens(&column.name) {
            if words.contains(&t) {
                total += COLUMN_WEIGHT;
            }
        }
    }
    total
}

/// Lowercased alphanumeric tokens with a trailing plural `s` stripped.
fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 1)
        .map(|w| {
            let w = w.to_lowercase();
            match w.strip_suffix('s') {
                Some(stem) if stem.len() > 2 && !stem.ends_with('s') => stem.to_string(),
                _ => w,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ColumnSchema;

    fn table(name: &str, cols: &[&str]) -> TableSchema {
        TableSchema {
            name: name.to_string(),
            columns: cols
                .iter()
                .map(|c| ColumnSchema {
                    name: c.to_string(),
                    data_type: "TEXT".to_string(),
                    nullable: true,
                    primary_key: false,
                })
                .collect(),
        }
    }

    fn catalog() -> Vec<TableSchema> {
        vec![
            table("customers", &["id", "name", "region"]),
            table("orders", &["id", "customer_id", "total"]),
            table("products", &["sku", "label"]),
        ]
    }

    #[test]
    fn test_aq015_tokens_singularize() {
        let t = tokens("Total orders per Customer_Region?");
        assert!(t.contains("order"));
        assert!(t.contains("customer"));
        assert!(t.contains("region"));
        assert!(t.contains("total"));
        assert!(!t.contains("orders"));
    }

    #[test]
    fn test_aq015_rank_prefers_table_names() {
        let ranked = LexicalRetriever::rank(&catalog(), "total of orders by region", 2);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].name, "orders");
        assert_eq!(ranked[1].name, "customers");
    }

    #[test]
    fn test_aq015_rank_fallback_when_nothing_matches() {
        let ranked = LexicalRetriever::rank(&catalog(), "how is business?", 2);
        let names: Vec<_> = ranked.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["customers", "orders"]);
    }

    #[tokio::test]
    async fn test_aq015_retrieve_unknown_database() {
        let retriever = LexicalRetriever::new().with_catalog("shop", catalog());
        let err = retriever
            .retrieve_relevant_schema("crm", "anything", 3)
            .await
            .unwrap_err();
        assert_eq!(err, RetrievalError::UnknownDatabase("crm".to_string()));
    }

    #[tokio::test]
    async fn test_aq015_retrieve_empty_catalog() {
        let retriever = LexicalRetriever::new().with_catalog("empty", vec![]);
        let tables = retriever
            .retrieve_relevant_schema("empty", "orders", 3)
            .await
            .unwrap();
        assert!(tables.is_empty());
    }

    #[test]
    fn test_aq015_with_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let path = crate::source::sqlite::tests::shop_db(dir.path());
        let retriever = LexicalRetriever::new().with_sqlite("shop", &path).unwrap();
        assert_eq!(retriever.catalog("shop").unwrap().len(), 3);
    }
}
