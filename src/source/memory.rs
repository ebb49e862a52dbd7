//! AQ-015: In-process query executor with scripted responses.
//!
//! Responses are keyed by normalized SQL. Every statement handed to the
//! executor is logged, which lets callers assert what actually reached the
//! data source.

use super::{QueryError, QueryExecutor};
use crate::core::fingerprint::normalize_sql;
use crate::core::types::{QueryResult, Row};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Scripted executor.
#[derive(Debug, Default)]
pub struct MemoryExecutor {
    responses: Mutex<HashMap<String, VecDeque<Result<QueryResult, QueryError>>>>,
    fallback: Option<Result<QueryResult, QueryError>>,
    log: Mutex<Vec<String>>,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for a statement. Queued responses are consumed in
    /// order; the last one repeats.
    pub fn respond(self, sql: &str, response: Result<QueryResult, QueryError>) -> Self {
        if let Ok(mut map) = self.responses.lock() {
            map.entry(normalize_sql(sql)).or_default().push_back(response);
        }
        self
    }

    /// Respond with `n` single-column rows.
    pub fn rows(self, sql: &str, n: usize) -> Self {
        self.respond(sql, Ok(numbered_rows(n)))
    }

    /// Respond with a database error.
    pub fn fail(self, sql: &str, error: &str) -> Self {
        self.respond(sql, Err(QueryError::Database(error.to_string())))
    }

    /// Response for statements with nothing queued.
    pub fn otherwise(mut self, response: Result<QueryResult, QueryError>) -> Self {
        self.fallback = Some(response);
        self
    }

    /// Every statement executed so far, verbatim.
    pub fn executed(&self) -> Vec<String> {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// How many times a statement (compared normalized) was executed.
    pub fn count(&self, sql: &str) -> usize {
        let key = normalize_sql(sql);
        self.executed()
            .iter()
            .filter(|s| normalize_sql(s) == key)
            .count()
    }
}

/// A result of `n` rows with a single `n` column.
pub fn numbered_rows(n: usize) -> QueryResult {
    let rows = (0..n)
        .map(|i| {
            let mut row = Row::new();
            row.insert("n".to_string(), serde_json::json!(i));
            row
        })
        .collect();
    QueryResult::new(vec!["n".to_string()], rows)
}

#[async_trait]
impl QueryExecutor for MemoryExecutor {
    async fn execute_query(&self, sql: &str) -> Result<QueryResult, QueryError> {
        if let Ok(mut log) = self.log.lock() {
            log.push(sql.to_string());
        }

        let key = normalize_sql(sql);
        let queued = self.responses.lock().ok().and_then(|mut map| {
            let queue = map.get_mut(&key)?;
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        });

        match queued.or_else(|| self.fallback.clone()) {
            Some(response) => response,
            None => Err(QueryError::Database(format!("no scripted response for: {}", sql))),
        }
    }
}
