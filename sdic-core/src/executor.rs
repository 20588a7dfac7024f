//! Runs one constraint file against one live session.
//!
//! The query text is read from disk on every execution and sent to the
//! driver as a single unit. Every row is materialized before the call
//! returns. Failures carry the server and file names; the caller logs them
//! together with the literal query and moves on to the next file.

use crate::adapters::SqlConnection;
use crate::error::SdicError;
use crate::models::{ConstraintFile, ViolationResult};
use crate::Result;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// One constraint ready to run: the file plus its current text.
#[derive(Debug, Clone)]
pub struct LoadedConstraint {
    /// Catalog entry
    pub file: ConstraintFile,
    /// Query text as read just before execution
    pub source_text: String,
}

impl LoadedConstraint {
    /// Reads the constraint's query text from disk.
    ///
    /// # Errors
    /// An unreadable or empty file is a [`SdicError::QueryExecution`], so it
    /// only affects this constraint.
    pub async fn load(file: &ConstraintFile) -> Result<Self> {
        let source_text = tokio::fs::read_to_string(&file.path)
            .await
            .map_err(|e| SdicError::query_failed(&file.server_name, &file.relative_path, e))?;

        if source_text.trim().is_empty() {
            return Err(SdicError::QueryExecution {
                server: file.server_name.clone(),
                constraint: file.relative_path.clone(),
                context: "constraint file is empty".to_string(),
                source: None,
            });
        }

        Ok(Self {
            file: file.clone(),
            source_text,
        })
    }
}

/// Executes constraint queries with an optional per-query timeout.
#[derive(Debug, Clone, Copy)]
pub struct ConstraintExecutor {
    query_timeout: Option<Duration>,
}

impl ConstraintExecutor {
    /// `None` lets a query run for as long as the server allows.
    pub const fn new(query_timeout: Option<Duration>) -> Self {
        Self { query_timeout }
    }

    /// Configured per-query timeout.
    pub const fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout
    }

    /// Executes `constraint` on `conn` and returns every row it produced.
    ///
    /// # Errors
    /// - [`SdicError::QueryExecution`] when the driver rejects or aborts the
    ///   query
    /// - [`SdicError::QueryTimeout`] when the timeout expires first
    pub async fn execute(
        &self,
        conn: &mut dyn SqlConnection,
        constraint: &LoadedConstraint,
    ) -> Result<ViolationResult> {
        let file = &constraint.file;
        trace!(
            server = %file.server_name,
            constraint = %file.relative_path,
            query = %constraint.source_text,
            "Executing constraint"
        );

        let started = Instant::now();
        let fetched = match self.query_timeout {
            Some(limit) => tokio::time::timeout(limit, conn.fetch_all(&constraint.source_text))
                .await
                .map_err(|_| SdicError::QueryTimeout {
                    server: file.server_name.clone(),
                    constraint: file.relative_path.clone(),
                    timeout: limit,
                })?,
            None => conn.fetch_all(&constraint.source_text).await,
        };
        let elapsed = started.elapsed();

        let rows =
            fetched.map_err(|e| SdicError::query_failed(&file.server_name, &file.relative_path, e))?;

        debug!(
            server = %file.server_name,
            constraint = %file.relative_path,
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            rows = rows.rows.len(),
            "Constraint executed"
        );

        Ok(ViolationResult::new(rows.columns, rows.rows, elapsed))
    }
}

impl Default for ConstraintExecutor {
    fn default() -> Self {
        Self::new(Some(Duration::from_secs(300)))
    }
}
