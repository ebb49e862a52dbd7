//! AQ-015: Read-only SQLite executor and schema introspection.
//!
//! Each statement opens its own read-only connection inside
//! `spawn_blocking`; the connection drops on every return path. A progress
//! handler interrupts statements that run past the deadline, and the
//! interruption surfaces as `QueryError::Timeout`.

use super::{ColumnSchema, QueryError, QueryExecutor, RetrievalError, TableSchema};
use crate::core::types::{ExecutorSettings, QueryResult, Row};
use async_trait::async_trait;
use base64::Engine as _;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Virtual-machine instructions between deadline checks.
const PROGRESS_OPS: i32 = 1000;

/// Read-only executor over a SQLite file.
#[derive(Debug, Clone)]
pub struct SqliteExecutor {
    path: PathBuf,
    timeout: Duration,
    max_rows: usize,
}

impl SqliteExecutor {
    pub fn new(path: impl Into<PathBuf>, settings: &ExecutorSettings) -> Self {
        Self {
            path: path.into(),
            timeout: Duration::from_millis(settings.timeout_ms),
            max_rows: settings.max_rows,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl QueryExecutor for SqliteExecutor {
    async fn execute_query(&self, sql: &str) -> Result<QueryResult, QueryError> {
        let path = self.path.clone();
        let sql = sql.to_string();
        let timeout = self.timeout;
        let max_rows = self.max_rows;

        tokio::task::spawn_blocking(move || run_statement(&path, &sql, timeout, max_rows))
            .await
            .map_err(|e| QueryError::Connection(format!("executor task failed: {}", e)))?
    }
}

/// Open a read-only, query-only connection.
fn open_read_only(path: &Path) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI,
    )?;
    conn.pragma_update(None, "query_only", "ON")?;
    Ok(conn)
}

fn run_statement(
    path: &Path,
    sql: &str,
    timeout: Duration,
    max_rows: usize,
) -> Result<QueryResult, QueryError> {
    let conn = open_read_only(path)
        .map_err(|e| QueryError::Connection(format!("cannot open {}: {}", path.display(), e)))?;

    let start = Instant::now();
    let deadline = start + timeout;
    conn.progress_handler(PROGRESS_OPS, Some(move || Instant::now() >= deadline));

    let map_err = |e: rusqlite::Error| classify(e, start.elapsed(), timeout);

    let mut stmt = conn.prepare(sql).map_err(map_err)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query([]).map_err(map_err)?;

    let mut collected: Vec<Row> = Vec::new();
    let mut total = 0usize;
    while let Some(row) = rows.next().map_err(map_err)? {
        total += 1;
        if collected.len() >= max_rows {
            continue;
        }
        let mut out = Row::new();
        for (i, name) in columns.iter().enumerate() {
            let value = row.get_ref(i).map_err(map_err)?;
            out.insert(name.clone(), to_json(value));
        }
        collected.push(out);
    }

    let truncated = total > collected.len();
    Ok(QueryResult {
        columns,
        rows: collected,
        row_count: total,
        truncated,
    })
}

/// Interrupted statements past the deadline are timeouts; the rest are database errors.
fn classify(err: rusqlite::Error, elapsed: Duration, timeout: Duration) -> QueryError {
    if let rusqlite::Error::SqliteFailure(ref code, _) = err {
        if code.code == rusqlite::ErrorCode::OperationInterrupted && elapsed >= timeout {
            return QueryError::Timeout(timeout);
        }
    }
    QueryError::Database(err.to_string())
}

fn to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(t) => serde_json::Value::String(String::from_utf8_lossy(t).to_string()),
        ValueRef::Blob(b) => {
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b))
        }
    }
}

/// Introspect every table and view of a SQLite file, ordered by name.
pub fn load_schema(path: &Path) -> Result<Vec<TableSchema>, RetrievalError> {
    let conn = open_read_only(path)
        .map_err(|e| RetrievalError::Unavailable(format!("cannot open {}: {}", path.display(), e)))?;
    let unavailable = |e: rusqlite::Error| RetrievalError::Unavailable(e.to_string());

    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master \
             WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
             ORDER BY name",
        )
        .map_err(unavailable)?;
    let names: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(unavailable)?
        .collect::<Result<_, _>>()
        .map_err(unavailable)?;

    let mut tables = Vec::with_capacity(names.len());
    for name in names {
        let pragma = format!("PRAGMA table_info(\"{}\")", name.replace('"', "\"\""));
        let mut info = conn.prepare(&pragma).map_err(unavailable)?;
        let columns: Vec<ColumnSchema> = info
            .query_map([], |row| {
                Ok(ColumnSchema {
                    name: row.get(1)?,
                    data_type: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    nullable: row.get::<_, i64>(3)? == 0,
                    primary_key: row.get::<_, i64>(5)? > 0,
                })
            })
            .map_err(unavailable)?
            .collect::<Result<_, _>>()
            .map_err(unavailable)?;
        tables.push(TableSchema { name, columns });
    }

    Ok(tables)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A small shop database: customers, orders, products.
    pub(crate) fn shop_db(dir: &Path) -> PathBuf {
        let path = dir.join("shop.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL, region TEXT);
             CREATE TABLE orders (id INTEGER PRIMARY KEY, customer_id INTEGER, total REAL, created_at TEXT);
             CREATE TABLE products (sku TEXT PRIMARY KEY, label TEXT, photo BLOB);
             INSERT INTO customers VALUES (1, 'Ada', 'north'), (2, 'Brian', 'south'), (3, 'Chen', 'north');
             INSERT INTO orders VALUES (1, 1, 10.5, '2026-01-02'), (2, 1, 4.0, '2026-01-03'), (3, 3, 99.9, '2026-02-01');
             INSERT INTO products VALUES ('A1', 'widget', x'CAFE');",
        )
        .unwrap();
        path
    }

    fn settings(timeout_ms: u64, max_rows: usize) -> ExecutorSettings {
        ExecutorSettings {
            timeout_ms,
            max_rows,
        }
    }

    #[tokio::test]
    async fn test_aq015_sqlite_select() {
        let dir = tempfile::tempdir().unwrap();
        let exec = SqliteExecutor::new(shop_db(dir.path()), &settings(5_000, 100));
        let result = exec
            .execute_query("SELECT id, name FROM customers ORDER BY id")
            .await
            .unwrap();
        assert_eq!(result.columns, vec!["id", "name"]);
        assert_eq!(result.row_count, 3);
        assert_eq!(result.rows[0]["name"], serde_json::json!("Ada"));
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn test_aq015_sqlite_value_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let exec = SqliteExecutor::new(shop_db(dir.path()), &settings(5_000, 100));
        let result = exec
            .execute_query("SELECT sku, photo, NULL AS missing, 1.5 AS ratio FROM products")
            .await
            .unwrap();
        let row = &result.rows[0];
        assert_eq!(row["photo"], serde_json::json!("yv4="));
        assert!(row["missing"].is_null());
        assert_eq!(row["ratio"], serde_json::json!(1.5));
    }

    #[tokio::test]
    async fn test_aq015_sqlite_truncates_but_counts() {
        let dir = tempfile::tempdir().unwrap();
        let exec = SqliteExecutor::new(shop_db(dir.path()), &settings(5_000, 2));
        let result = exec.execute_query("SELECT * FROM customers").await.unwrap();
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.row_count, 3);
        assert!(result.truncated);
    }

    #[tokio::test]
    async fn test_aq015_sqlite_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let exec = SqliteExecutor::new(shop_db(dir.path()), &settings(5_000, 100));
        let err = exec
            .execute_query("INSERT INTO customers VALUES (9, 'x', 'y')")
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Database(_)));
    }

    #[tokio::test]
    async fn test_aq015_sqlite_syntax_error() {
        let dir = tempfile::tempdir().unwrap();
        let exec = SqliteExecutor::new(shop_db(dir.path()), &settings(5_000, 100));
        let err = exec.execute_query("SELECT * FROM nowhere").await.unwrap_err();
        assert!(err.to_string().contains("no such table"));
    }

    #[tokio::test]
    async fn test_aq015_sqlite_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let exec = SqliteExecutor::new(shop_db(dir.path()), &settings(50, 100));
        let err = exec
            .execute_query(
                "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
                 SELECT count(*) FROM c",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_aq015_sqlite_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let exec = SqliteExecutor::new(dir.path().join("absent.db"), &settings(5_000, 100));
        let err = exec.execute_query("SELECT 1").await.unwrap_err();
        assert!(matches!(err, QueryError::Connection(_)));
    }

    #[test]
    fn test_aq015_load_schema() {
        let dir = tempfile::tempdir().unwrap();
        let tables = load_schema(&shop_db(dir.path())).unwrap();
        let names: Vec<_> = tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["customers", "orders", "products"]);
        let customers = &tables[0];
        assert!(customers.columns[0].primary_key);
        assert!(!customers.columns[1].nullable);
        assert_eq!(customers.columns[2].data_type, "TEXT");
    }
}
