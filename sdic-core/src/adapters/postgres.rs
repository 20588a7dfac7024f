//! PostgreSQL session.
//!
//! Constraint text is sent with the simple query protocol, so every value
//! arrives in its text form regardless of type (NUMERIC, INTERVAL, arrays,
//! extension types). Known scalar types are then parsed back into typed
//! values for display.
//!
//! # Security Features
//! - `default_transaction_read_only=on` is set for the session at startup
//! - `statement_timeout` bounds every constraint query on the server side
//! - Connection string is never logged

use super::{
    DatabaseType, MULTIPLE_RESULT_SETS, QueryRows, SqlConnection, same_columns, scalar_from_text,
};
use crate::error::BoxDynError;
use crate::models::ScalarValue;
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgRow};
use sqlx::{Column, ConnectOptions, Connection, Row, TypeInfo, ValueRef};
use std::str::FromStr;
use std::time::Duration;

/// Session name shown in `pg_stat_activity`.
const APPLICATION_NAME: &str = "sql-data-integrity-checker";

/// A single read-only PostgreSQL connection.
pub struct PostgresConnection {
    conn: sqlx::PgConnection,
}

impl std::fmt::Debug for PostgresConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresConnection").finish_non_exhaustive()
    }
}

impl PostgresConnection {
    /// Opens a read-only session.
    ///
    /// # Errors
    /// Returns the driver error if the URI is invalid or the server refuses
    /// the connection.
    pub async fn open(connection_string: &str) -> Result<Self, BoxDynError> {
        let options = PgConnectOptions::from_str(connection_string)?
            .application_name(APPLICATION_NAME)
            .options([("default_transaction_read_only", "on")]);
        let conn = options.connect().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl SqlConnection for PostgresConnection {
    async fn fetch_all(&mut self, sql: &str) -> Result<QueryRows, BoxDynError> {
        let rows = sqlx::Executor::fetch_all(&mut self.conn, sqlx::raw_sql(sql)).await?;
        materialize(&rows)
    }

    async fn set_statement_timeout(&mut self, timeout: Duration) -> Result<(), BoxDynError> {
        let statement = format!("SET statement_timeout = '{}ms'", timeout.as_millis());
        sqlx::Executor::execute(&mut self.conn, sqlx::raw_sql(&statement)).await?;
        Ok(())
    }

    async fn close(self: Box<Self>) {
        if let Err(e) = self.conn.close().await {
            tracing::debug!(error = %e, "PostgreSQL session did not close cleanly");
        }
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }
}

fn materialize(rows: &[PgRow]) -> Result<QueryRows, BoxDynError> {
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

/// Extract a cell by position; names may repeat in a constraint's select list.
fn extract_cell(row: &PgRow, idx: usize) -> ScalarValue {
    let type_name = match row.try_get_raw(idx) {
        Ok(raw) if raw.is_null() => return ScalarValue::Null,
        Ok(raw) => raw.type_info().name().to_string(),
        Err(_) => return ScalarValue::Null,
    };
    match row.try_get_unchecked::<Option<String>, _>(idx) {
        Ok(Some(text)) => scalar_from_text(&type_name, text),
        Ok(None) => ScalarValue::Null,
        Err(e) => {
            tracing::debug!(column = idx, error = %e, "Undecodable PostgreSQL value");
            ScalarValue::Null
        }
    }
}
