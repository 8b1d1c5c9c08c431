//! SQLite document store
//!
//! Tasks, scraped records and stats counters live in three tables. Task and
//! record bodies are stored as JSON text; the columns the coordinator filters
//! on (`status`, `last_crawl_time`, `leased_at`) are kept outside the body.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::info;
use yyspider_common::protocol::{id_key, Document, TaskStatus, ID_FIELD};
use yyspider_common::{Error, Result};

use super::{BulkWriteReport, DocumentStore, LeaseRequest, WriteError, WriteOp};
use crate::stats::StatIncrement;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn storage(e: sqlx::Error) -> Error {
    Error::Storage(e.to_string())
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `db_path` and ensure the schema
    pub async fn open(db_path: &Path) -> Result<Self> {
        let newly_created = !db_path.exists();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(storage)?;

        if newly_created {
            info!("Initialized new database: {}", db_path.display());
        } else {
            info!("Opened existing database: {}", db_path.display());
        }

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Private in-memory database on a single pinned connection
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(storage)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables if missing (idempotent)
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                coll_name TEXT NOT NULL,
                id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'NOT_CRAWL',
                last_crawl_time INTEGER,
                leased_at INTEGER,
                doc TEXT NOT NULL,
                PRIMARY KEY (coll_name, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (coll_name, status)")
            .execute(&self.pool)
            .await
            .map_err(storage)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scraped_data (
                coll_name TEXT NOT NULL,
                id TEXT NOT NULL,
                doc TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (coll_name, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stats (
                date TEXT NOT NULL,
                coll_name TEXT NOT NULL,
                event_type TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (date, coll_name, event_type)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(())
    }
}

/// Bind value for dynamically built statements
#[derive(Debug, Clone, PartialEq)]
enum SqlParam {
    Text(String),
    Int(i64),
    Real(f64),
}

type SqliteQuery<'q> = sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

fn bind_all<'q>(mut query: SqliteQuery<'q>, params: Vec<SqlParam>) -> SqliteQuery<'q> {
    for param in params {
        query = match param {
            SqlParam::Text(s) => query.bind(s),
            SqlParam::Int(i) => query.bind(i),
            SqlParam::Real(f) => query.bind(f),
        };
    }
    query
}

/// JSON path for a (possibly dotted) payload field: `a.b` -> `$."a"."b"`
fn json_path(field: &str) -> Result<String> {
    let mut path = String::from("$");
    for segment in field.split('.') {
        if segment.is_empty() || segment.contains('"') {
            return Err(Error::InvalidInput(format!("unsupported condition field '{}'", field)));
        }
        path.push_str(&format!(".\"{}\"", segment));
    }
    Ok(path)
}

fn scalar_param(field: &str, value: &Value) -> Result<Option<SqlParam>> {
    match value {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(SqlParam::Int(*b as i64))),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(Some(SqlParam::Int(i))),
            None => Ok(Some(SqlParam::Real(n.as_f64().unwrap_or(f64::NAN)))),
        },
        Value::String(s) => Ok(Some(SqlParam::Text(s.clone()))),
        Value::Array(_) | Value::Object(_) => Err(Error::InvalidInput(format!(
            "condition on '{}' must be a scalar",
            field
        ))),
    }
}

/// Translate an equality-only condition map into a WHERE fragment
fn condition_sql(cond: &Document) -> Result<(String, Vec<SqlParam>)> {
    let mut clauses = Vec::new();
    let mut params = Vec::new();

    for (field, value) in cond {
        if field.starts_with('$') {
            return Err(Error::InvalidInput(format!("unsupported condition operator '{}'", field)));
        }

        match field.as_str() {
            ID_FIELD => {
                clauses.push("id = ?".to_string());
                params.push(SqlParam::Text(id_key(value)?));
            }
            "status" => {
                let status: TaskStatus = value
                    .as_str()
                    .ok_or_else(|| Error::InvalidInput("status condition must be a string".to_string()))?
                    .parse()?;
                clauses.push("status = ?".to_string());
                params.push(SqlParam::Text(status.as_str().to_string()));
            }
            "last_crawl_time" => match scalar_param(field, value)? {
                Some(param) => {
                    clauses.push("last_crawl_time = ?".to_string());
                    params.push(param);
                }
                None => clauses.push("last_crawl_time IS NULL".to_string()),
            },
            _ => {
                let path = json_path(field)?;
                match scalar_param(field, value)? {
                    Some(param) => {
                        clauses.push("json_extract(doc, ?) = ?".to_string());
                        params.push(SqlParam::Text(path));
                        params.push(param);
                    }
                    None => {
                        clauses.push("json_extract(doc, ?) IS NULL".to_string());
                        params.push(SqlParam::Text(path));
                    }
                }
            }
        }
    }

    Ok((clauses.join(" AND "), params))
}

fn parse_doc(text: &str) -> Result<Document> {
    Ok(serde_json::from_str(text)?)
}

/// Rebuild the client-facing task document from a row
fn task_from_row(row: &SqliteRow) -> Result<Document> {
    let text: String = row.try_get("doc").map_err(storage)?;
    let status: String = row.try_get("status").map_err(storage)?;
    let last_crawl_time: Option<i64> = row.try_get("last_crawl_time").map_err(storage)?;

    let mut doc = parse_doc(&text)?;
    doc.insert("status".to_string(), Value::String(status));
    if let Some(t) = last_crawl_time {
        doc.insert("last_crawl_time".to_string(), Value::from(t));
    }
    Ok(doc)
}

async fn apply_op(
    conn: &mut sqlx::SqliteConnection,
    coll_name: &str,
    op: &WriteOp,
) -> std::result::Result<(), String> {
    let result = match op {
        WriteOp::InsertTask { id, status, doc } => {
            let mut body = doc.clone();
            body.remove("status");
            let last_crawl_time = body.remove("last_crawl_time").and_then(|v| v.as_i64());
            let text = serde_json::to_string(&body).map_err(|e| e.to_string())?;

            sqlx::query(
                "INSERT INTO tasks (coll_name, id, status, last_crawl_time, doc) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(coll_name)
            .bind(id)
            .bind(status.as_str())
            .bind(last_crawl_time)
            .bind(text)
            .execute(&mut *conn)
            .await
        }
        WriteOp::UpdateStatus {
            id,
            status,
            last_crawl_time,
        } => {
            sqlx::query(
                r#"
                UPDATE tasks
                SET status = ?,
                    last_crawl_time = ?,
                    leased_at = CASE WHEN ? = 'CRAWLING' THEN leased_at ELSE NULL END
                WHERE coll_name = ? AND id = ?
                "#,
            )
            .bind(status.as_str())
            .bind(last_crawl_time)
            .bind(status.as_str())
            .bind(coll_name)
            .bind(id)
            .execute(&mut *conn)
            .await
        }
        WriteOp::UpsertData { id, doc } => {
            let text = serde_json::to_string(doc).map_err(|e| e.to_string())?;
            sqlx::query(
                r#"
                INSERT INTO scraped_data (coll_name, id, doc, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(coll_name, id) DO UPDATE SET
                    doc = excluded.doc,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(coll_name)
            .bind(id)
            .bind(text)
            .bind(chrono::Utc::now().timestamp())
            .execute(&mut *conn)
            .await
        }
    };

    result.map(|_| ()).map_err(|e| e.to_string())
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn existing_task_ids(&self, coll_name: &str, ids: &[String]) -> Result<HashSet<String>> {
        let mut found = HashSet::new();

        // Stay well below SQLite's bound-parameter limit
        for chunk in ids.chunks(500) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT id FROM tasks WHERE coll_name = ? AND id IN ({})",
                placeholders
            );
            let mut query = sqlx::query(&sql).bind(coll_name);
            for id in chunk {
                query = query.bind(id);
            }
            let rows = query.fetch_all(&self.pool).await.map_err(storage)?;
            for row in rows {
                found.insert(row.try_get::<String, _>("id").map_err(storage)?);
            }
        }

        Ok(found)
    }

    async fn lease_tasks(&self, request: LeaseRequest<'_>) -> Result<Vec<Document>> {
        if request.count == 0 {
            return Ok(Vec::new());
        }

        let (cond_sql, cond_params) = condition_sql(request.cond)?;

        let mut params = vec![
            SqlParam::Int(request.now),
            SqlParam::Text(request.coll_name.to_string()),
            SqlParam::Text(request.coll_name.to_string()),
        ];

        let eligible = match request.stale_before {
            Some(cutoff) => {
                params.push(SqlParam::Int(cutoff));
                "(status = 'NOT_CRAWL' OR (status = 'CRAWLING' AND leased_at IS NOT NULL AND leased_at < ?))"
            }
            None => "status = 'NOT_CRAWL'",
        };

        let cond_sql = if cond_sql.is_empty() {
            String::new()
        } else {
            format!(" AND {}", cond_sql)
        };
        params.extend(cond_params);
        params.push(SqlParam::Int(i64::from(request.count)));

        // Single statement: SQLite serializes writers, so no two leases
        // can claim the same row.
        let sql = format!(
            r#"
            UPDATE tasks SET status = 'CRAWLING', leased_at = ?
            WHERE coll_name = ? AND id IN (
                SELECT id FROM tasks
                WHERE coll_name = ? AND {}{}
                ORDER BY rowid
                LIMIT ?
            )
            RETURNING id, status, last_crawl_time, doc
            "#,
            eligible, cond_sql
        );

        let rows = bind_all(sqlx::query(&sql), params)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;

        rows.iter().map(task_from_row).collect()
    }

    async fn release_tasks(&self, coll_name: &str, ids: &[String], status: TaskStatus) -> Result<u64> {
        let mut changed = 0;

        for chunk in ids.chunks(500) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "UPDATE tasks SET status = ?, leased_at = NULL \
                 WHERE coll_name = ? AND status = 'CRAWLING' AND id IN ({})",
                placeholders
            );
            let mut query = sqlx::query(&sql).bind(status.as_str()).bind(coll_name);
            for id in chunk {
                query = query.bind(id);
            }
            changed += query.execute(&self.pool).await.map_err(storage)?.rows_affected();
        }

        Ok(changed)
    }

    async fn bulk_write(&self, coll_name: &str, ops: &[WriteOp]) -> Result<BulkWriteReport> {
        let mut report = BulkWriteReport {
            attempted: ops.len(),
            errors: Vec::new(),
        };
        if ops.is_empty() {
            return Ok(report);
        }

        // A failing statement only rolls back itself; the rest of the
        // transaction still commits.
        let mut tx = self.pool.begin().await.map_err(storage)?;
        for (index, op) in ops.iter().enumerate() {
            if let Err(message) = apply_op(&mut tx, coll_name, op).await {
                report.errors.push(WriteError { index, message });
            }
        }
        tx.commit().await.map_err(storage)?;

        Ok(report)
    }

    async fn increment_stats(&self, increments: &[StatIncrement]) -> Result<BulkWriteReport> {
        let mut report = BulkWriteReport {
            attempted: increments.len(),
            errors: Vec::new(),
        };
        if increments.is_empty() {
            return Ok(report);
        }

        let mut tx = self.pool.begin().await.map_err(storage)?;
        for (index, inc) in increments.iter().enumerate() {
            let result = sqlx::query(
                r#"
                INSERT INTO stats (date, coll_name, event_type, count)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(date, coll_name, event_type) DO UPDATE SET
                    count = count + excluded.count
                "#,
            )
            .bind(&inc.date)
            .bind(&inc.coll_name)
            .bind(inc.event.as_str())
            .bind(inc.amount)
            .execute(&mut *tx)
            .await;

            if let Err(e) = result {
                report.errors.push(WriteError {
                    index,
                    message: e.to_string(),
                });
            }
        }
        tx.commit().await.map_err(storage)?;

        Ok(report)
    }

    async fn find_task(&self, coll_name: &str, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT status, last_crawl_time, doc FROM tasks WHERE coll_name = ? AND id = ?",
        )
        .bind(coll_name)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn find_data(&self, coll_name: &str, id: &str) -> Result<Option<Document>> {
        let text: Option<String> =
            sqlx::query_scalar("SELECT doc FROM scraped_data WHERE coll_name = ? AND id = ?")
                .bind(coll_name)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage)?;

        text.as_deref().map(parse_doc).transpose()
    }

    async fn stat_count(&self, date: &str, coll_name: &str, event_type: &str) -> Result<i64> {
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT count FROM stats WHERE date = ? AND coll_name = ? AND event_type = ?",
        )
        .bind(date)
        .bind(coll_name)
        .bind(event_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        Ok(count.unwrap_or(0))
    }
}
