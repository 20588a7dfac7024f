//! Command-line front end for the SQL data integrity checker.
//!
//! The binary in `main.rs` only parses arguments, installs logging and maps
//! the result to an exit code. Everything else lives here so it can be
//! tested without spawning a process.

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use sdic_core::config::{CONFIG_FILE_NAME, CheckerConfig, Destination, RunSettings, timeout_from_secs};
use sdic_core::logging::LogFormat;
use sdic_core::{DriverConnector, OutputRouter, RunCoordinator, RunOutcome, RunRequest, Selection, catalog};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// No violation reported.
pub const EXIT_CLEAN: u8 = 0;
/// At least one violation was reported.
pub const EXIT_VIOLATIONS: u8 = 1;
/// Setup failed before or instead of checking.
pub const EXIT_FATAL: u8 = 2;

/// CLI argument structure
#[derive(Debug, Parser)]
#[command(name = "sql-data-integrity-checker")]
#[command(about = "Runs soft constraint queries against your databases and reports violations")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(long_about = "
SQL Data Integrity Checker - soft constraints for your databases

Every *.sql file under <root>/<server>/ is a query returning the rows that
break a rule. A query returning rows is reported as a violation.

LAYOUT:
  <root>/servers.toml            server name -> connection URI
  <root>/payments/no_negative_amounts.sql
  <root>/payments/dup_emails.sql

EXIT STATUS:
  0  no violation reported
  1  at least one violation reported
  2  setup failure (already running, missing directory, unknown server, ...)

EXAMPLES:
  sql-data-integrity-checker --root /etc/sdic
  sql-data-integrity-checker check --server payments --constraint dup_emails
  sql-data-integrity-checker check --server local --uri sqlite:///var/db/app.db
  sql-data-integrity-checker list --json
")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    /// Subcommand to execute; defaults to `check`
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Arguments for the implicit `check`
    #[command(flatten)]
    pub check: CheckArgs,
}

/// Available CLI commands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run constraints and report violations (default)
    Check(CheckArgs),
    /// Show configured servers and their constraint files
    List(ListArgs),
}

#[derive(Debug, Clone, Default, Args)]
pub struct CheckArgs {
    /// Only check this server
    #[arg(long, value_name = "NAME")]
    pub server: Option<String>,

    /// Only run this constraint file of the selected server
    #[arg(long, value_name = "FILE", requires = "server")]
    pub constraint: Option<String>,

    /// Connection URI for --server, overriding the configuration file
    #[arg(
        long,
        value_name = "URI",
        requires = "server",
        help = "Connection URI for --server (credentials are redacted in logs)"
    )]
    pub uri: Option<String>,

    /// Report destination
    #[arg(long, value_enum)]
    pub output: Option<OutputArg>,

    /// Per-query timeout in seconds, 0 disables it
    #[arg(long, value_name = "SECS")]
    pub query_timeout: Option<u64>,

    /// Directory holding the single-instance lock file
    #[arg(long, value_name = "DIR")]
    pub lock_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Args)]
pub struct ListArgs {
    /// Print JSON instead of text
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, Args)]
pub struct GlobalArgs {
    /// Constraint root directory
    #[arg(long, global = true, env = "SDIC_ROOT", default_value = ".", value_name = "DIR")]
    pub root: PathBuf,

    /// Configuration file (default: <root>/servers.toml)
    #[arg(long, global = true, env = "SDIC_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity
    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Increase verbosity (-v, -vv)"
    )]
    pub verbose: u8,

    /// Suppress output
    #[arg(
        short,
        long,
        global = true,
        conflicts_with = "verbose",
        help = "Suppress all logs except errors"
    )]
    pub quiet: bool,

    /// Log line format
    #[arg(long, global = true, value_enum, default_value_t = LogFormatArg::Text)]
    pub log_format: LogFormatArg,
}

/// Report destination on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputArg {
    /// Print reports to stdout
    Console,
    /// Emit reports as structured ERROR log records
    Syslog,
}

impl From<OutputArg> for Destination {
    fn from(value: OutputArg) -> Self {
        match value {
            OutputArg::Console => Self::Console,
            OutputArg::Syslog => Self::Syslog,
        }
    }
}

/// Log line format on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    /// Human-readable lines
    Text,
    /// One JSON object per line
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Text => Self::Text,
            LogFormatArg::Json => Self::Json,
        }
    }
}

/// How a successful invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Nothing to report
    Clean,
    /// At least one violation was reported
    ViolationsFound,
}

impl RunStatus {
    /// Status for a finished run.
    pub const fn from_outcome(outcome: &RunOutcome) -> Self {
        if outcome.violations_found {
            Self::ViolationsFound
        } else {
            Self::Clean
        }
    }

    /// Process exit code.
    pub const fn exit_code(self) -> u8 {
        match self {
            Self::Clean => EXIT_CLEAN,
            Self::ViolationsFound => EXIT_VIOLATIONS,
        }
    }
}

/// Exit code for the result of [`run`]: any error is fatal.
pub fn exit_code_for(result: &anyhow::Result<RunStatus>) -> u8 {
    match result {
        Ok(status) => status.exit_code(),
        Err(_) => EXIT_FATAL,
    }
}

/// Executes the parsed command line.
///
/// # Errors
/// Any error returned here is fatal and maps to [`EXIT_FATAL`].
pub async fn run(cli: Cli) -> anyhow::Result<RunStatus> {
    match cli.command {
        Some(Command::List(args)) => {
            let config = load_config(&cli.global.root, cli.global.config.as_deref())?;
            let listing = list_servers(&cli.global.root, &config);
            let mut stdout = std::io::stdout().lock();
            write_listing(&mut stdout, &listing, args.json)?;
            Ok(RunStatus::Clean)
        }
        Some(Command::Check(args)) => run_check(&cli.global, &args).await,
        None => run_check(&cli.global, &cli.check).await,
    }
}

async fn run_check(global: &GlobalArgs, args: &CheckArgs) -> anyhow::Result<RunStatus> {
    let config = load_config(&global.root, global.config.as_deref())?;
    let request = build_request(&global.root, args, config)?;

    let connector = Arc::new(DriverConnector::new(request.settings.connect_timeout));
    let router = OutputRouter::new(request.settings.destination);
    let mut coordinator = RunCoordinator::new(connector, router);

    let outcome = coordinator.run(&request).await?;
    let status = RunStatus::from_outcome(&outcome);
    if status == RunStatus::ViolationsFound {
        warn!(
            violated = outcome.stats.constraints_violated,
            "Constraint violations reported"
        );
    } else {
        info!("No constraint violation reported");
    }
    Ok(status)
}

/// Loads the configuration file.
///
/// An explicit path must exist. Without one, `<root>/servers.toml` is used
/// when present and an empty configuration otherwise, so a single
/// `--server NAME --uri URI` run needs no file at all.
///
/// # Errors
/// Returns an error when the file cannot be read or is invalid.
pub fn load_config(root: &Path, explicit: Option<&Path>) -> anyhow::Result<CheckerConfig> {
    let (path, required) = match explicit {
        Some(path) => (path.to_path_buf(), true),
        None => (root.join(CONFIG_FILE_NAME), false),
    };

    if !required && !path.exists() {
        info!(path = %path.display(), "No configuration file, starting from defaults");
        return Ok(CheckerConfig::default());
    }

    CheckerConfig::load(&path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

/// Merges configuration and command-line overrides into a run request.
///
/// # Errors
/// Returns an error for an invalid `--server`/`--uri` pair.
pub fn build_request(root: &Path, args: &CheckArgs, mut config: CheckerConfig) -> anyhow::Result<RunRequest> {
    if let Some(uri) = &args.uri {
        let Some(server) = &args.server else {
            bail!("--uri requires --server");
        };
        config.upsert_server(server, uri)?;
    }

    if let Some(output) = args.output {
        config.settings.output = output.into();
    }
    if let Some(lock_dir) = &args.lock_dir {
        config.settings.lock_dir = Some(lock_dir.clone());
    }

    let mut settings = RunSettings::from_settings(&config.settings, sdic_core::lock::default_lock_name());
    if let Some(secs) = args.query_timeout {
        settings.query_timeout = timeout_from_secs(secs);
    }

    let selection = match &args.server {
        Some(name) => Selection::Server {
            name: name.clone(),
            constraint: args.constraint.clone(),
        },
        None => Selection::All,
    };

    Ok(RunRequest {
        root: root.to_path_buf(),
        servers: config.server_descriptors(),
        selection,
        settings,
    })
}

/// One server as shown by `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerListing {
    /// Server name
    pub name: String,
    /// Connection URI with the password masked
    pub uri: String,
    /// Constraint file names, sorted
    pub constraints: Vec<String>,
    /// Why the constraint directory could not be listed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Lists every configured server with its constraint files. Touches no
/// database and takes no lock.
pub fn list_servers(root: &Path, config: &CheckerConfig) -> Vec<ServerListing> {
    config
        .server_descriptors()
        .into_iter()
        .map(|server| {
            let (constraints, error) = match catalog::list_constraints(root, &server.name) {
                Ok(files) => (files.into_iter().map(|f| f.relative_path).collect(), None),
                Err(e) => (Vec::new(), Some(e.to_string())),
            };
            ServerListing {
                uri: server.redacted_uri(),
                name: server.name,
                constraints,
                error,
            }
        })
        .collect()
}

/// Writes a listing as text or pretty JSON.
///
/// # Errors
/// Returns an error when the writer fails.
pub fn write_listing(out: &mut dyn Write, listing: &[ServerListing], json: bool) -> anyhow::Result<()> {
    if json {
        serde_json::to_writer_pretty(&mut *out, listing).context("Failed to serialize listing")?;
        writeln!(out)?;
        return Ok(());
    }

    if listing.is_empty() {
        writeln!(out, "No servers configured")?;
    }
    for server in listing {
        writeln!(out, "{} ({})", server.name, server.uri)?;
        if let Some(error) = &server.error {
            writeln!(out, "  ! {}", error)?;
        } else if server.constraints.is_empty() {
            writeln!(out, "  (no constraints)")?;
        }
        for constraint in &server.constraints {
            writeln!(out, "  - {}", constraint)?;
        }
    }
    Ok(())
}
