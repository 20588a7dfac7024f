//! MySQL / MariaDB session.
//!
//! Queries go over the text protocol (`COM_QUERY`), so values arrive as the
//! server's textual rendering. Legacy tables frequently hold bytes that are
//! not valid UTF-8; those cells fall back to raw bytes with the invalid
//! sequences dropped.
//!
//! The statement limit is `max_execution_time`, which MySQL 5.7.8+ applies to
//! SELECT statements only.

use super::{
    DatabaseType, MULTIPLE_RESULT_SETS, QueryRows, SqlConnection, same_columns, scalar_from_text,
};
use crate::error::BoxDynError;
use crate::models::ScalarValue;
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlRow};
use sqlx::{Column, ConnectOptions, Connection, Row, TypeInfo, ValueRef};
use std::str::FromStr;
use std::time::Duration;

/// A single MySQL connection with a read-only session.
pub struct MySqlConnection {
    conn: sqlx::MySqlConnection,
}

impl std::fmt::Debug for MySqlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlConnection").finish_non_exhaustive()
    }
}

impl MySqlConnection {
    /// Opens a connection and marks the session read-only.
    ///
    /// # Errors
    /// Returns the driver error if the URI is invalid or the server refuses
    /// the connection.
    pub async fn open(connection_string: &str) -> Result<Self, BoxDynError> {
        // mariadb:// is accepted as an alias
        let normalized = connection_string
            .strip_prefix("mariadb://")
            .map_or_else(|| connection_string.to_string(), |rest| format!("mysql://{}", rest));
        let options = MySqlConnectOptions::from_str(&normalized)?;
        let mut conn = options.connect().await?;

        // Best effort: servers before 5.6.5 do not know READ ONLY sessions.
        if let Err(e) =
            sqlx::Executor::execute(&mut conn, sqlx::raw_sql("SET SESSION TRANSACTION READ ONLY"))
                .await
        {
            tracing::warn!(error = %e, "Could not mark MySQL session read-only");
        }

        Ok(Self { conn })
    }
}

#[async_trait]
impl SqlConnection for MySqlConnection {
    async fn fetch_all(&mut self, sql: &str) -> Result<QueryRows, BoxDynError> {
        let rows = sqlx::Executor::fetch_all(&mut self.conn, sqlx::raw_sql(sql)).await?;
        materialize(&rows)
    }

    async fn set_statement_timeout(&mut self, timeout: Duration) -> Result<(), BoxDynError> {
        // MariaDB names this max_statement_time; the provider logs the failure.
        let statement = format!("SET SESSION max_execution_time = {}", timeout.as_millis());
        sqlx::Executor::execute(&mut self.conn, sqlx::raw_sql(&statement)).await?;
        Ok(())
    }

    async fn close(self: Box<Self>) {
        if let Err(e) = self.conn.close().await {
            tracing::debug!(error = %e, "MySQL session did not close cleanly");
        }
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::MySQL
    }
}

fn materialize(rows: &[MySqlRow]) -> Result<QueryRows, BoxDynError> {
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

/// Extract a cell by position, tolerating invalid UTF-8.
fn extract_cell(row: &MySqlRow, idx: usize) -> ScalarValue {
    let type_name = match row.try_get_raw(idx) {
        Ok(raw) if raw.is_null() => return ScalarValue::Null,
        Ok(raw) => raw.type_info().name().to_string(),
        Err(_) => return ScalarValue::Null,
    };
    if let Ok(v) = row.try_get_unchecked::<Option<String>, _>(idx) {
        return v.map_or(ScalarValue::Null, |text| scalar_from_text(&type_name, text));
    }
    match row.try_get_unchecked::<Option<Vec<u8>>, _>(idx) {
        Ok(v) => v.map_or(ScalarValue::Null, |bytes| ScalarValue::from_bytes(&bytes)),
        Err(e) => {
            tracing::debug!(column = idx, error = %e, "Undecodable MySQL value");
            ScalarValue::Null
        }
    }
}
