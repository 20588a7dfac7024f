//! SQL driver adapters behind a generic connection capability.
//!
//! The engine only ever needs two things from a database: run one query text
//! and hand back every row, and close the session. [`SqlConnection`] is that
//! contract; [`Connector`] opens one from a [`ServerDescriptor`]. The
//! production [`DriverConnector`] dispatches on the URI scheme to the
//! feature-gated `sqlx` backends below.
//!
//! # Security
//! - Sessions are opened read-only wherever the driver allows it
//! - Connection strings are redacted in every error message

use crate::error::{BoxDynError, SdicError};
use crate::models::{ScalarValue, ServerDescriptor};
use crate::Result;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "postgresql")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

/// Database engines the checker can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseType {
    /// PostgreSQL and wire-compatible servers
    PostgreSQL,
    /// MySQL and MariaDB
    MySQL,
    /// SQLite database files
    SQLite,
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        };
        f.write_str(name)
    }
}

/// Every row of one query, fully materialized.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRows {
    /// Column names in select-list order; empty when no row came back
    pub columns: Vec<String>,
    /// Cell values, one vector per row, in column order
    pub rows: Vec<Vec<ScalarValue>>,
}

/// A live session to one server.
///
/// Implementations must materialize every row before returning so no driver
/// cursor outlives the call.
#[async_trait]
pub trait SqlConnection: Send {
    /// Executes `sql` as one unit and returns all rows.
    ///
    /// # Errors
    /// Returns the driver's error untouched; the executor adds server and
    /// constraint context.
    async fn fetch_all(&mut self, sql: &str) -> std::result::Result<QueryRows, BoxDynError>;

    /// Makes the server abandon any later statement that runs longer than
    /// `timeout`, so an expired query stops consuming the session. Sessions
    /// with no way to enforce a limit keep the default no-op.
    ///
    /// # Errors
    /// Returns the driver's error when the limit cannot be set.
    async fn set_statement_timeout(
        &mut self,
        _timeout: Duration,
    ) -> std::result::Result<(), BoxDynError> {
        Ok(())
    }

    /// Closes the session gracefully.
    async fn close(self: Box<Self>);

    /// Engine behind this session.
    fn database_type(&self) -> DatabaseType;
}

/// Opens sessions for servers.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a new session to `server`.
    ///
    /// # Errors
    /// Returns [`SdicError::Connection`] when the URI cannot be resolved or the
    /// server refuses the connection.
    async fn connect(&self, server: &ServerDescriptor) -> Result<Box<dyn SqlConnection>>;
}

/// Production connector backed by `sqlx`.
#[derive(Debug, Clone)]
pub struct DriverConnector {
    connect_timeout: Duration,
}

impl DriverConnector {
    /// Creates a connector that gives up after `connect_timeout`.
    pub const fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for DriverConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl Connector for DriverConnector {
    async fn connect(&self, server: &ServerDescriptor) -> Result<Box<dyn SqlConnection>> {
        let uri = server.connection_uri.as_str();
        let database_type = detect_database_type(uri)
            .map_err(|message| SdicError::connection_refused(&server.name, uri, message))?;

        let opened = tokio::time::timeout(self.connect_timeout, open(database_type, uri))
            .await
            .map_err(|_| {
                SdicError::connection_refused(
                    &server.name,
                    uri,
                    format!(
                        "timed out after {}s",
                        self.connect_timeout.as_secs()
                    ),
                )
            })?;

        opened.map_err(|e| SdicError::connection_failed(&server.name, uri, e))
    }
}

#[allow(unused_variables)]
async fn open(
    database_type: DatabaseType,
    uri: &str,
) -> std::result::Result<Box<dyn SqlConnection>, BoxDynError> {
    match database_type {
        #[cfg(feature = "postgresql")]
        DatabaseType::PostgreSQL => Ok(Box::new(postgres::PostgresConnection::open(uri).await?)),
        #[cfg(feature = "mysql")]
        DatabaseType::MySQL => Ok(Box::new(mysql::MySqlConnection::open(uri).await?)),
        #[cfg(feature = "sqlite")]
        DatabaseType::SQLite => Ok(Box::new(sqlite::SqliteConnection::open(uri).await?)),
        #[allow(unreachable_patterns)]
        other => Err(format!(
            "{} support not compiled in; rebuild with the matching feature",
            other
        )
        .into()),
    }
}

/// Detects the database engine from a connection string.
///
/// # Errors
/// Returns a message when the format is unrecognized.
pub fn detect_database_type(connection_string: &str) -> std::result::Result<DatabaseType, String> {
    if connection_string.starts_with("postgres://")
        || connection_string.starts_with("postgresql://")
    {
        Ok(DatabaseType::PostgreSQL)
    } else if connection_string.starts_with("mysql://")
        || connection_string.starts_with("mariadb://")
    {
        Ok(DatabaseType::MySQL)
    } else if connection_string.starts_with("sqlite:")
        || connection_string.ends_with(".db")
        || connection_string.ends_with(".sqlite")
        || connection_string.ends_with(".sqlite3")
    {
        Ok(DatabaseType::SQLite)
    } else {
        Err("Unrecognized database connection string format".to_string())
    }
}

/// Converts a text-protocol value to a typed scalar using the column's type
/// name. Values that do not parse stay text.
#[cfg_attr(not(any(feature = "postgresql", feature = "mysql")), allow(dead_code))]
pub(crate) fn scalar_from_text(type_name: &str, text: String) -> ScalarValue {
    let upper = type_name.to_ascii_uppercase();
    let base = upper.trim_end_matches(" UNSIGNED");
    match base {
        "INT2" | "INT4" | "INT8" | "OID" | "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT"
        | "INTEGER" | "BIGINT" | "YEAR" => match text.parse::<i64>() {
            Ok(v) => ScalarValue::Int(v),
            Err(_) => ScalarValue::Text(text),
        },
        "FLOAT4" | "FLOAT8" | "FLOAT" | "DOUBLE" | "REAL" => match text.parse::<f64>() {
            Ok(v) => ScalarValue::Float(v),
            Err(_) => ScalarValue::Text(text),
        },
        "BOOL" | "BOOLEAN" => match text.as_str() {
            "t" | "true" | "1" => ScalarValue::Bool(true),
            "f" | "false" | "0" => ScalarValue::Bool(false),
            _ => ScalarValue::Text(text),
        },
        _ => ScalarValue::Text(text),
    }
}

/// Driver error for a constraint file whose statements yield rows of
/// different shapes.
#[cfg_attr(
    not(any(feature = "postgresql", feature = "mysql", feature = "sqlite")),
    allow(dead_code)
)]
pub(crate) const MULTIPLE_RESULT_SETS: &str = "constraint returned more than one result set";

/// True when a row's column names match the header taken from the first row.
/// Rows of a second result-producing statement fail this check.
#[cfg_attr(
    not(any(feature = "postgresql", feature = "mysql", feature = "sqlite")),
    allow(dead_code)
)]
pub(crate) fn same_columns<'a>(
    header: &[String],
    names: impl ExactSizeIterator<Item = &'a str>,
) -> bool {
    names.len() == header.len() && names.zip(header).all(|(name, expected)| name == expected)
}
