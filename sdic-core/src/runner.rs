//! Run coordination.
//!
//! A run moves through [`RunState`]:
//!
//! ```text
//! Idle -> LockAcquired -> Running -> Completed
//!   \          \             \
//!    `----------`-------------`--> Aborted
//! ```
//!
//! The single-instance lock is taken before anything else and released only
//! after every connection of the run is closed. Failures are contained at the
//! narrowest scope that makes sense: a broken constraint skips that file, an
//! unreachable server skips that server, and only setup failures abort the run.

use crate::adapters::{Connector, SqlConnection};
use crate::catalog;
use crate::config::RunSettings;
use crate::error::SdicError;
use crate::executor::{ConstraintExecutor, LoadedConstraint};
use crate::formatter;
use crate::lock::RunLock;
use crate::models::{ConstraintFile, RunOutcome, RunStats, ServerDescriptor};
use crate::output::{OutputRouter, ReportContext};
use crate::provider::ConnectionProvider;
use crate::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

/// Lifecycle of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    /// No run started yet
    #[default]
    Idle,
    /// Single-instance lock held, servers not resolved yet
    LockAcquired,
    /// Checking servers
    Running,
    /// Every selected server was processed
    Completed,
    /// Setup failed or no server was usable
    Aborted,
}

/// Which servers and constraints a run covers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Selection {
    /// Every configured server, every constraint
    #[default]
    All,
    /// One server, optionally narrowed to one constraint file
    Server {
        /// Server name
        name: String,
        /// Constraint file name, `.sql` optional
        constraint: Option<String>,
    },
}

/// Everything a run needs to know up front.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Directory holding one sub-directory per server
    pub root: PathBuf,
    /// Every configured server
    pub servers: Vec<ServerDescriptor>,
    /// Subset of servers and constraints to check
    pub selection: Selection,
    /// Destination, timeouts and lock location
    pub settings: RunSettings,
}

/// Drives runs with a given connector and report router.
pub struct RunCoordinator {
    connector: Arc<dyn Connector>,
    router: OutputRouter,
    state: RunState,
}

impl std::fmt::Debug for RunCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunCoordinator")
            .field("router", &self.router)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Mutable state of a run in progress. The lock is released once every
/// connection is closed.
struct RunContext<'a> {
    request: &'a RunRequest,
    lock: RunLock,
    provider: ConnectionProvider,
    executor: ConstraintExecutor,
    router: &'a mut OutputRouter,
    outcome: RunOutcome,
    usable_servers: usize,
}

impl RunCoordinator {
    /// Creates an idle coordinator.
    pub fn new(connector: Arc<dyn Connector>, router: OutputRouter) -> Self {
        Self {
            connector,
            router,
            state: RunState::Idle,
        }
    }

    /// State reached by the last run.
    pub const fn state(&self) -> RunState {
        self.state
    }

    /// Router used for every report.
    pub const fn router(&self) -> &OutputRouter {
        &self.router
    }

    /// Executes one full run.
    ///
    /// # Errors
    /// Only fatal errors are returned ([`crate::error::ErrorScope::Fatal`]): lock
    /// contention, a missing root, an unknown server or constraint, or no
    /// usable server at all. Everything narrower is logged and counted.
    pub async fn run(&mut self, request: &RunRequest) -> Result<RunOutcome> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id);
        self.run_inner(request).instrument(span).await
    }

    async fn run_inner(&mut self, request: &RunRequest) -> Result<RunOutcome> {
        self.state = RunState::Idle;

        let lock = match RunLock::acquire(&request.settings.lock_dir, &request.settings.lock_name) {
            Ok(lock) => lock,
            Err(e) => {
                self.state = RunState::Aborted;
                return Err(e);
            }
        };
        self.state = RunState::LockAcquired;
        debug!(lock = %lock.path().display(), "Lock acquired");

        let servers = match resolve_servers(request) {
            Ok(servers) => servers,
            Err(e) => {
                self.state = RunState::Aborted;
                return Err(e);
            }
        };

        self.state = RunState::Running;
        info!(
            root = %request.root.display(),
            servers = servers.len(),
            "Starting constraint run"
        );

        let warnings_before = self.router.warnings();
        let mut ctx = RunContext {
            request,
            lock,
            provider: ConnectionProvider::new(Arc::clone(&self.connector))
                .with_statement_timeout(request.settings.query_timeout),
            executor: ConstraintExecutor::new(request.settings.query_timeout),
            router: &mut self.router,
            outcome: RunOutcome::default(),
            usable_servers: 0,
        };

        for server in &servers {
            ctx.run_server(server).await;
        }

        ctx.provider.close_all().await;
        ctx.outcome.stats.sink_warnings = ctx.router.warnings() - warnings_before;
        let RunContext {
            lock,
            outcome,
            usable_servers,
            ..
        } = ctx;
        drop(lock);

        if usable_servers == 0 {
            self.state = RunState::Aborted;
            return Err(SdicError::NoUsableServers {
                attempted: outcome.stats.servers_attempted,
            });
        }

        let stats = &outcome.stats;
        info!(
            servers_attempted = stats.servers_attempted,
            servers_skipped = stats.servers_skipped,
            constraints_executed = stats.constraints_executed,
            constraints_passed = stats.constraints_passed,
            constraints_violated = stats.constraints_violated,
            constraints_failed = stats.constraints_failed,
            sink_warnings = stats.sink_warnings,
            violations_found = outcome.violations_found,
            "Constraint run complete"
        );
        self.state = RunState::Completed;
        Ok(outcome)
    }
}

/// Picks the servers for this run, ordered by name, and checks everything
/// that must hold before the first connection.
fn resolve_servers(request: &RunRequest) -> Result<Vec<ServerDescriptor>> {
    let mut servers: Vec<ServerDescriptor> = match &request.selection {
        Selection::All => request.servers.clone(),
        Selection::Server { name, .. } => {
            let server = request
                .servers
                .iter()
                .find(|s| &s.name == name)
                .ok_or_else(|| SdicError::UnknownServer { name: name.clone() })?;
            vec![server.clone()]
        }
    };
    servers.sort_by(|a, b| a.name.cmp(&b.name));

    catalog::ensure_root(&request.root)?;

    // A missing server directory is left to the server loop
    if let Selection::Server {
        name,
        constraint: Some(file),
    } = &request.selection
    {
        match catalog::find_constraint(&request.root, name, file) {
            Ok(_) | Err(SdicError::DirectoryNotFound { .. }) => {}
            Err(e) => return Err(e),
        }
    }

    Ok(servers)
}

impl RunContext<'_> {
    fn constraints_for(&self, server: &ServerDescriptor) -> Result<Vec<ConstraintFile>> {
        match &self.request.selection {
            Selection::Server {
                constraint: Some(file),
                ..
            } => catalog::find_constraint(&self.request.root, &server.name, file).map(|c| vec![c]),
            _ => catalog::list_constraints(&self.request.root, &server.name),
        }
    }

    async fn run_server(&mut self, server: &ServerDescriptor) {
        self.outcome.stats.servers_attempted += 1;

        let constraints = match self.constraints_for(server) {
            Ok(constraints) => constraints,
            Err(e) => {
                skip_server(&mut self.outcome.stats, server, &e);
                return;
            }
        };
        if constraints.is_empty() {
            info!(server = %server.name, "No constraints for server");
            self.usable_servers += 1;
            return;
        }

        if let Err(e) = self.provider.get_connection(server).await {
            skip_server(&mut self.outcome.stats, server, &e);
            return;
        }
        self.usable_servers += 1;

        for (idx, file) in constraints.iter().enumerate() {
            let conn = match self.provider.get_connection(server).await {
                Ok(conn) => conn,
                Err(e) => {
                    let remaining = constraints.len() - idx;
                    self.outcome.stats.constraints_failed += remaining;
                    error!(
                        server = %server.name,
                        error = %e,
                        remaining,
                        "Reconnect failed, remaining constraints not checked"
                    );
                    return;
                }
            };
            let session = check_constraint(
                conn,
                file,
                &self.executor,
                self.router,
                &mut self.outcome,
            )
            .await;
            if session == Session::Discard {
                self.provider.discard(&server.name);
            }
        }
    }
}

/// Whether a session can serve the next constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Session {
    Keep,
    /// The server may still be running an abandoned statement
    Discard,
}

fn skip_server(stats: &mut RunStats, server: &ServerDescriptor, e: &SdicError) {
    stats.servers_skipped += 1;
    error!(server = %server.name, error = %e, "Skipping server");
}

/// Execute, format and emit one constraint. Never fails: every error is
/// logged with the literal query and counted.
async fn check_constraint(
    conn: &mut dyn SqlConnection,
    file: &ConstraintFile,
    executor: &ConstraintExecutor,
    router: &mut OutputRouter,
    outcome: &mut RunOutcome,
) -> Session {
    let stats = &mut outcome.stats;
    stats.constraints_executed += 1;

    let loaded = match LoadedConstraint::load(file).await {
        Ok(loaded) => loaded,
        Err(e) => {
            stats.constraints_failed += 1;
            error!(
                server = %file.server_name,
                constraint = %file.relative_path,
                error = %e,
                "Constraint could not be read"
            );
            return Session::Keep;
        }
    };

    let result = match executor.execute(conn, &loaded).await {
        Ok(result) => result,
        Err(e) => {
            stats.constraints_failed += 1;
            error!(
                server = %file.server_name,
                constraint = %file.relative_path,
                query = %loaded.source_text,
                error = %e,
                "Constraint query failed"
            );
            return if matches!(e, SdicError::QueryTimeout { .. }) {
                Session::Discard
            } else {
                Session::Keep
            };
        }
    };

    let report = match formatter::format(file, result) {
        Ok(Some(report)) => report,
        Ok(None) => {
            stats.constraints_passed += 1;
            debug!(
                server = %file.server_name,
                constraint = %file.relative_path,
                "Constraint passed"
            );
            return Session::Keep;
        }
        Err(e) => {
            stats.constraints_failed += 1;
            error!(
                server = %file.server_name,
                constraint = %file.relative_path,
                query = %loaded.source_text,
                error = %e,
                "Constraint result could not be formatted"
            );
            return Session::Keep;
        }
    };

    stats.constraints_violated += 1;
    let context = ReportContext {
        constraint: file,
        query: &loaded.source_text,
    };
    if router.emit(&report, &context) {
        outcome.violations_found = true;
    } else {
        warn!(
            server = %file.server_name,
            constraint = %file.relative_path,
            rows = report.row_count,
            "Violation found but not reported"
        );
    }
    Session::Keep
}
