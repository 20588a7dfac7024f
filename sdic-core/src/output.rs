//! Report delivery.
//!
//! Two sinks exist. The console sink writes a banner, the server and file
//! names, the literal query and the grid to stdout (or any writer). The
//! system-log sink emits the grid and the query as one `tracing` event at
//! ERROR level so the process subscriber (JSON lines in production) turns it
//! into a single structured record.
//!
//! Delivery is fire-and-forget: a failed write is logged, counted, and the
//! run carries on.

use crate::config::Destination;
use crate::error::SdicError;
use crate::formatter::RenderedReport;
use crate::models::ConstraintFile;
use crate::Result;
use std::io::Write;
use tracing::warn;

const BANNER_WIDTH: usize = 80;

/// Where a report came from.
#[derive(Debug, Clone, Copy)]
pub struct ReportContext<'a> {
    /// Constraint that produced the report
    pub constraint: &'a ConstraintFile,
    /// Literal query text as executed
    pub query: &'a str,
}

/// Routes rendered reports to the configured sink.
pub struct OutputRouter {
    destination: Destination,
    console: Box<dyn Write + Send>,
    warnings: usize,
}

impl std::fmt::Debug for OutputRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputRouter")
            .field("destination", &self.destination)
            .field("warnings", &self.warnings)
            .finish_non_exhaustive()
    }
}

impl OutputRouter {
    /// Router writing console reports to stdout.
    pub fn new(destination: Destination) -> Self {
        Self::with_writer(destination, Box::new(std::io::stdout()))
    }

    /// Router writing console reports to `console`.
    pub fn with_writer(destination: Destination, console: Box<dyn Write + Send>) -> Self {
        Self {
            destination,
            console,
            warnings: 0,
        }
    }

    /// Configured destination.
    pub const fn destination(&self) -> Destination {
        self.destination
    }

    /// Failed deliveries so far.
    pub const fn warnings(&self) -> usize {
        self.warnings
    }

    /// Delivers one report. Returns whether it reached the sink.
    ///
    /// Never fails: delivery errors become a warning log line and bump
    /// [`OutputRouter::warnings`].
    pub fn emit(&mut self, report: &RenderedReport, context: &ReportContext<'_>) -> bool {
        let delivered = match self.destination {
            Destination::Console => self.write_console(report, context),
            Destination::Syslog => {
                log_report(report, context);
                Ok(())
            }
        };

        match delivered {
            Ok(()) => true,
            Err(e) => {
                self.warnings += 1;
                warn!(
                    server = %context.constraint.server_name,
                    constraint = %context.constraint.relative_path,
                    error = %e,
                    "Report could not be delivered"
                );
                false
            }
        }
    }

    fn write_console(&mut self, report: &RenderedReport, context: &ReportContext<'_>) -> Result<()> {
        write_console_report(&mut *self.console, report, context).map_err(|source| {
            SdicError::Sink {
                constraint: context.constraint.relative_path.clone(),
                context: "console write failed".to_string(),
                source,
            }
        })
    }
}

fn write_console_report(
    out: &mut dyn Write,
    report: &RenderedReport,
    context: &ReportContext<'_>,
) -> std::io::Result<()> {
    let banner = "=".repeat(BANNER_WIDTH);
    writeln!(out, "{}", banner)?;
    writeln!(
        out,
        "CONSTRAINT VIOLATION  {} row(s) in {} ms  ({})",
        report.row_count,
        report.elapsed.as_millis(),
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    )?;
    writeln!(out, "{}", banner)?;
    writeln!(out, "Server:     {}", context.constraint.server_name)?;
    writeln!(out, "Constraint: {}", context.constraint.relative_path)?;
    writeln!(out, "Query:")?;
    for line in context.query.trim_end().lines() {
        writeln!(out, "    {}", line)?;
    }
    writeln!(out)?;
    writeln!(out, "{}", report.grid)?;
    writeln!(out)?;
    out.flush()
}

fn log_report(report: &RenderedReport, context: &ReportContext<'_>) {
    let constraint = context.constraint;
    tracing::error!(
        logger = %constraint.logger_name(),
        server = %constraint.server_name,
        constraint = %constraint.relative_path,
        elapsed_ms = u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
        rows = report.row_count,
        query = %context.query.trim_end(),
        report = %report.grid,
        "Constraint violation"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn report() -> RenderedReport {
        RenderedReport {
            grid: "+----+\n| id |\n+----+\n| 42 |\n+----+".to_string(),
            row_count: 1,
            elapsed: Duration::from_millis(7),
        }
    }

    fn constraint() -> ConstraintFile {
        ConstraintFile::new("payments", Path::new("/c/payments"), "no_negative_amounts.sql")
    }

    #[test]
    fn test_console_report_layout() {
        let buf = SharedBuf::default();
        let mut router = OutputRouter::with_writer(Destination::Console, Box::new(buf.clone()));
        let file = constraint();
        let context = ReportContext {
            constraint: &file,
            query: "SELECT id\nFROM accounts\n",
        };

        assert!(router.emit(&report(), &context));
        assert_eq!(router.warnings(), 0);

        let out = buf.contents();
        assert!(out.starts_with(&"=".repeat(BANNER_WIDTH)));
        assert!(out.contains("1 row(s) in 7 ms"));
        assert!(out.contains("Server:     payments\n"));
        assert!(out.contains("Constraint: no_negative_amounts.sql\n"));
        assert!(out.contains("    SELECT id\n    FROM accounts\n"));
        assert!(out.contains("| 42 |"));
    }

    #[test]
    fn test_console_failure_is_counted_not_raised() {
        let mut router = OutputRouter::with_writer(Destination::Console, Box::new(BrokenPipe));
        let file = constraint();
        let context = ReportContext {
            constraint: &file,
            query: "SELECT 1",
        };

        assert!(!router.emit(&report(), &context));
        assert!(!router.emit(&report(), &context));
        assert_eq!(router.warnings(), 2);
    }

    #[test]
    fn test_syslog_report_is_one_structured_error_event() {
        let logs = SharedBuf::default();
        let console = SharedBuf::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_writer(move || writer.clone())
            .finish();

        let mut router = OutputRouter::with_writer(Destination::Syslog, Box::new(console.clone()));
        let file = constraint();
        let context = ReportContext {
            constraint: &file,
            query: "SELECT account_id\nFROM accounts WHERE amount < 0\n",
        };
        let delivered =
            tracing::subscriber::with_default(subscriber, || router.emit(&report(), &context));

        assert!(delivered);
        assert!(console.contents().is_empty());

        let out = logs.contents();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 1);
        let event: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(event["level"], "ERROR");
        assert_eq!(event["fields"]["logger"], "sdic.payments.no_negative_amounts");
        assert_eq!(event["fields"]["constraint"], "no_negative_amounts.sql");
        assert_eq!(event["fields"]["rows"], 1);
        assert_eq!(
            event["fields"]["query"],
            "SELECT account_id\nFROM accounts WHERE amount < 0"
        );
        assert!(
            event["fields"]["report"]
                .as_str()
                .unwrap()
                .contains("| 42 |")
        );
    }
}
