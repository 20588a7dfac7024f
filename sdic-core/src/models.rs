//! Data model shared by every engine component.

use crate::error::redact_database_url;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One target database.
///
/// The name doubles as the constraint sub-directory name under the root.
///
/// # Security
/// `Debug` output redacts the password part of the connection URI.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Unique server name, also its constraint directory
    pub name: String,
    /// Driver connection URI; may hold credentials
    pub connection_uri: String,
}

impl ServerDescriptor {
    /// Creates a new server descriptor.
    pub fn new(name: impl Into<String>, connection_uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connection_uri: connection_uri.into(),
        }
    }

    /// Connection URI with any password masked, safe to log.
    pub fn redacted_uri(&self) -> String {
        redact_database_url(&self.connection_uri)
    }
}

impl fmt::Debug for ServerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerDescriptor")
            .field("name", &self.name)
            .field("connection_uri", &self.redacted_uri())
            .finish()
    }
}

impl fmt::Display for ServerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// One soft-constraint query file.
///
/// The query text is not held here; it is read from disk at execution time so
/// every run sees the latest version of the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintFile {
    /// Server this constraint belongs to
    pub server_name: String,
    /// File name within the server's sub-directory
    pub relative_path: String,
    /// Full path on disk
    pub path: PathBuf,
}

impl ConstraintFile {
    /// Creates a constraint file entry for `file_name` inside `server_dir`.
    pub fn new(server_name: impl Into<String>, server_dir: &Path, file_name: &str) -> Self {
        Self {
            server_name: server_name.into(),
            relative_path: file_name.to_string(),
            path: server_dir.join(file_name),
        }
    }

    /// Logger name used by the system-log sink: `sdic.<server>.<file stem>`.
    pub fn logger_name(&self) -> String {
        let stem = Path::new(&self.relative_path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.relative_path);
        format!("sdic.{}.{}", self.server_name, stem)
    }
}

/// A single cell of a result set.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ScalarValue {
    /// SQL NULL
    Null,
    /// Boolean
    Bool(bool),
    /// Any integer type that fits in 64 bits
    Int(i64),
    /// Floating point
    Float(f64),
    /// Everything else, in the server's text rendering
    Text(String),
}

impl ScalarValue {
    /// Builds a text value from raw bytes, dropping invalid UTF-8 sequences.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::Text(decode_text_lossy(bytes))
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(v) => write!(f, "{}", v),
            Self::Int(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(v) => f.write_str(v),
        }
    }
}

/// Decodes bytes as UTF-8, silently dropping invalid sequences.
///
/// Legacy data stored in the wrong encoding must not abort a report, and
/// replacement characters would make the grid misleading.
pub fn decode_text_lossy(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for chunk in bytes.utf8_chunks() {
        out.push_str(chunk.valid());
    }
    out
}

/// Rows returned by one constraint query.
///
/// Fields are private: a result is immutable once produced and is handed by
/// value to the formatter.
#[derive(Debug, Clone, PartialEq)]
pub struct ViolationResult {
    column_names: Vec<String>,
    rows: Vec<Vec<ScalarValue>>,
    elapsed: Duration,
}

impl ViolationResult {
    /// Wraps a fully materialized result set.
    pub const fn new(
        column_names: Vec<String>,
        rows: Vec<Vec<ScalarValue>>,
        elapsed: Duration,
    ) -> Self {
        Self {
            column_names,
            rows,
            elapsed,
        }
    }

    /// Column names in select-list order.
    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    /// Rows in the order the server returned them.
    pub fn rows(&self) -> &[Vec<ScalarValue>] {
        &self.rows
    }

    /// Zero means the constraint passed.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Query execution time.
    pub const fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// True when the constraint returned at least one row.
    pub fn is_violation(&self) -> bool {
        !self.rows.is_empty()
    }
}

/// Counters accumulated over a run, logged in the final summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    /// Servers the run tried to check
    pub servers_attempted: usize,
    /// Servers skipped for a missing directory or a failed connection
    pub servers_skipped: usize,
    /// Constraint files picked up for execution
    pub constraints_executed: usize,
    /// Constraints that returned no row
    pub constraints_passed: usize,
    /// Constraints that returned rows and produced a report
    pub constraints_violated: usize,
    /// Constraints that could not be read, run or formatted
    pub constraints_failed: usize,
    /// Reports a sink failed to deliver
    pub sink_warnings: usize,
}

/// Aggregate result of a full run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
    /// True iff at least one constraint returned rows and was reported
    pub violations_found: bool,
    /// Counters for the final summary
    pub stats: RunStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_descriptor_debug_redacts_password() {
        let server = ServerDescriptor::new("payments", "postgres://app:s3cret@db/payments");
        let debug = format!("{:?}", server);
        assert!(debug.contains("payments"));
        assert!(!debug.contains("s3cret"));
        assert_eq!(server.to_string(), "payments");
    }

    #[test]
    fn test_decode_text_lossy_drops_invalid_bytes() {
        assert_eq!(decode_text_lossy(b"caf\xc3\xa9"), "café");
        assert_eq!(decode_text_lossy(b"ab\xffcd\xfe"), "abcd");
        assert_eq!(decode_text_lossy(b""), "");
        assert_eq!(ScalarValue::from_bytes(b"\xff"), ScalarValue::Text(String::new()));
    }

    #[test]
    fn test_scalar_display() {
        assert_eq!(ScalarValue::Null.to_string(), "NULL");
        assert_eq!(ScalarValue::Int(-5).to_string(), "-5");
        assert_eq!(ScalarValue::Bool(true).to_string(), "true");
        assert_eq!(ScalarValue::Float(1.5).to_string(), "1.5");
        assert_eq!(ScalarValue::Text("x".to_string()).to_string(), "x");
    }

    #[test]
    fn test_constraint_logger_name() {
        let file = ConstraintFile::new("payments", Path::new("/srv/c/payments"), "dup_emails.sql");
        assert_eq!(file.logger_name(), "sdic.payments.dup_emails");
        assert_eq!(file.path, PathBuf::from("/srv/c/payments/dup_emails.sql"));
    }

    #[test]
    fn test_violation_result_counts() {
        let passed = ViolationResult::new(vec!["id".to_string()], vec![], Duration::ZERO);
        assert_eq!(passed.row_count(), 0);
        assert!(!passed.is_violation());

        let violated = ViolationResult::new(
            vec!["id".to_string()],
            vec![vec![ScalarValue::Int(1)], vec![ScalarValue::Int(2)]],
            Duration::from_millis(3),
        );
        assert_eq!(violated.row_count(), 2);
        assert!(violated.is_violation());
    }
}
