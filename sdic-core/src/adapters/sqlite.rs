//! SQLite session.
//!
//! # Connection Modes
//! - File-based: `sqlite:///path/to/database.db`, `sqlite://./relative.db`,
//!   or a bare path ending in `.db` / `.sqlite` / `.sqlite3`
//! - In-memory: `sqlite::memory:` or `:memory:`
//!
//! File databases are opened read-only and are never created.
//!
//! SQLite has no server to cancel a statement, so the statement timeout is a
//! progress handler that interrupts the running statement once its deadline
//! has passed.

use super::{DatabaseType, MULTIPLE_RESULT_SETS, QueryRows, SqlConnection, same_columns};
use crate::error::BoxDynError;
use crate::models::ScalarValue;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Column, ConnectOptions, Connection, Row, TypeInfo, ValueRef};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Virtual machine steps between two deadline checks.
const PROGRESS_INTERVAL_OPS: i32 = 10_000;

/// A single SQLite connection.
pub struct SqliteConnection {
    conn: sqlx::SqliteConnection,
    statement_timeout: Option<Duration>,
    // Read by the progress handler on the worker thread.
    deadline: Arc<Mutex<Option<Instant>>>,
}

impl std::fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnection").finish_non_exhaustive()
    }
}

impl SqliteConnection {
    /// Opens a connection; file databases are opened read-only.
    ///
    /// # Errors
    /// Returns the driver error if the path is invalid or the file does not
    /// exist.
    pub async fn open(connection_string: &str) -> Result<Self, BoxDynError> {
        let normalized = normalize_connection_string(connection_string);
        let mut options = SqliteConnectOptions::from_str(&normalized)?.create_if_missing(false);
        if !is_in_memory(&normalized) {
            options = options.read_only(true);
        }
        let conn = options.connect().await?;
        Ok(Self {
            conn,
            statement_timeout: None,
            deadline: Arc::new(Mutex::new(None)),
        })
    }

    fn arm_deadline(&self, deadline: Option<Instant>) {
        if let Ok(mut slot) = self.deadline.lock() {
            *slot = deadline;
        }
    }
}

#[async_trait]
impl SqlConnection for SqliteConnection {
    async fn fetch_all(&mut self, sql: &str) -> Result<QueryRows, BoxDynError> {
        self.arm_deadline(self.statement_timeout.map(|limit| Instant::now() + limit));
        let fetched = sqlx::Executor::fetch_all(&mut self.conn, sqlx::raw_sql(sql)).await;
        self.arm_deadline(None);
        materialize(&fetched?)
    }

    async fn set_statement_timeout(&mut self, timeout: Duration) -> Result<(), BoxDynError> {
        let deadline = Arc::clone(&self.deadline);
        let mut handle = self.conn.lock_handle().await?;
        // Returning false interrupts the statement.
        handle.set_progress_handler(PROGRESS_INTERVAL_OPS, move || {
            deadline
                .lock()
                .map_or(true, |slot| (*slot).is_none_or(|at| Instant::now() < at))
        });
        drop(handle);
        self.statement_timeout = Some(timeout);
        Ok(())
    }

    async fn close(self: Box<Self>) {
        if let Err(e) = self.conn.close().await {
            tracing::debug!(error = %e, "SQLite connection did not close cleanly");
        }
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::SQLite
    }
}

fn is_in_memory(connection_string: &str) -> bool {
    connection_string.contains(":memory:") || connection_string.contains("mode=memory")
}

/// Normalizes connection string to SQLite URL format.
fn normalize_connection_string(connection_string: &str) -> String {
    if connection_string == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    if connection_string.starts_with("sqlite:") {
        return connection_string.to_string();
    }

    format!("sqlite://{}", connection_string)
}

fn materialize(rows: &[SqliteRow]) -> Result<QueryRows, BoxDynError> {
    let columns: Vec<String> = rows
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();
    let mut cells = Vec::with_capacity(rows.len());
    for row in rows {
        if !same_columns(&columns, row.columns().iter().map(|c| c.name())) {
            return Err(MULTIPLE_RESULT_SETS.into());
        }
        cells.push((0..row.len()).map(|idx| extract_cell(row, idx)).collect());
    }
    Ok(QueryRows {
        columns,
        rows: cells,
    })
}

/// SQLite is dynamically typed, so the storage class of each value decides
/// how it is decoded.
fn extract_cell(row: &SqliteRow, idx: usize) -> ScalarValue {
    let storage_class = match row.try_get_raw(idx) {
        Ok(raw) if raw.is_null() => return ScalarValue::Null,
        Ok(raw) => raw.type_info().name().to_string(),
        Err(_) => return ScalarValue::Null,
    };

    let decoded = match storage_class.as_str() {
        "INTEGER" => row.try_get_unchecked::<i64, _>(idx).map(ScalarValue::Int),
        "REAL" => row.try_get_unchecked::<f64, _>(idx).map(ScalarValue::Float),
        "TEXT" => row
            .try_get_unchecked::<Vec<u8>, _>(idx)
            .map(|bytes| ScalarValue::from_bytes(&bytes)),
        _ => row
            .try_get_unchecked::<Vec<u8>, _>(idx)
            .map(|bytes| ScalarValue::from_bytes(&bytes)),
    };

    decoded.unwrap_or_else(|e| {
        tracing::debug!(column = idx, error = %e, "Undecodable SQLite value");
        ScalarValue::Null
    })
}
