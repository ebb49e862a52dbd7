//! AQ-015: Data source collaborators — query execution and schema retrieval.
//!
//! The engine consumes both through async traits. `sqlite` provides a
//! read-only executor and catalog over a SQLite file; `catalog` ranks
//! cached tables against a question; `memory` is an in-process executor
//! with scripted responses.

pub mod catalog;
pub mod memory;
pub mod sqlite;

use crate::core::types::QueryResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// A table and its columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct TableSchema {
    pub name: String,
    #[serde(default)]
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    /// One-line `table(col type, ...)` rendering for prompts and the CLI.
    pub fn render(&self) -> String {
        let cols: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let mut s = format!("{} {}", c.name, c.data_type);
                if c.primary_key {
                    s.push_str(" pk");
                }
                s
            })
            .collect();
        format!("{}({})", self.name, cols.join(", "))
    }
}

/// A column of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ColumnSchema {
    pub name: String,
    #[serde(default)]
    pub data_type: String,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
}

/// Raised by a query executor. Every variant is retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("database error: {0}")]
    Database(String),

    #[error("statement timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection error: {0}")]
    Connection(String),
}

/// Raised by schema retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetrievalError {
    #[error("unknown database '{0}'")]
    UnknownDatabase(String),

    #[error("schema unavailable: {0}")]
    Unavailable(String),
}

/// Executes one read-only statement.
///
/// Implementations own their connections and must release them on every
/// exit path, timeouts included.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute_query(&self, sql: &str) -> Result<QueryResult, QueryError>;
}

/// Returns the schema subset relevant to a question.
#[async_trait]
pub trait SchemaRetriever: Send + Sync {
    async fn retrieve_relevant_schema(
        &self,
        database_id: &str,
        question: &str,
        top_k: usize,
    ) -> Result<Vec<TableSchema>, RetrievalError>;
}
