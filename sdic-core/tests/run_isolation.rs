//! Failure isolation of the run coordinator, driven by a scripted connector.
//!
//! This test suite covers:
//! - Query timeouts classified per constraint, with a fresh session after
//!   a timeout
//! - Deterministic server order and one connection per server
//! - Connections closed before the lock is released
//! - Sink failures counted without failing the run

use async_trait::async_trait;
use sdic_core::adapters::{DatabaseType, QueryRows};
use sdic_core::error::BoxDynError;
use sdic_core::lock::RunLock;
use sdic_core::{
    Connector, Destination, OutputRouter, Result, RunCoordinator, RunRequest, RunSettings,
    ScalarValue, Selection, ServerDescriptor, SqlConnection,
};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Shared journal of connector activity.
#[derive(Clone, Default)]
struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

struct ScriptedConnector {
    script: HashMap<String, QueryRows>,
    journal: Journal,
    lock_dir: PathBuf,
}

struct ScriptedConnection {
    server: String,
    script: HashMap<String, QueryRows>,
    journal: Journal,
    lock_dir: PathBuf,
}

fn lock_is_held(lock_dir: &Path) -> bool {
    RunLock::acquire(lock_dir, "isolation").is_err()
}

#[async_trait]
impl SqlConnection for ScriptedConnection {
    async fn fetch_all(&mut self, sql: &str) -> std::result::Result<QueryRows, BoxDynError> {
        self.journal.push(format!("query {} {}", self.server, sql.trim()));
        if sql.trim() == "hang" {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.script
            .get(sql.trim())
            .cloned()
            .ok_or_else(|| "no such table".into())
    }

    async fn close(self: Box<Self>) {
        let locked = lock_is_held(&self.lock_dir);
        self.journal
            .push(format!("close {} lock_held={}", self.server, locked));
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::MySQL
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, server: &ServerDescriptor) -> Result<Box<dyn SqlConnection>> {
        self.journal.push(format!("connect {}", server.name));
        Ok(Box::new(ScriptedConnection {
            server: server.name.clone(),
            script: self.script.clone(),
            journal: self.journal.clone(),
            lock_dir: self.lock_dir.clone(),
        }))
    }
}

struct BrokenConsole;

impl Write for BrokenConsole {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "stdout closed"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct Setup {
    root: TempDir,
    locks: TempDir,
    journal: Journal,
}

impl Setup {
    fn new() -> Self {
        Self {
            root: tempfile::tempdir().unwrap(),
            locks: tempfile::tempdir().unwrap(),
            journal: Journal::default(),
        }
    }

    fn constraint(&self, server: &str, file: &str, sql: &str) {
        let dir = self.root.path().join(server);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(file), sql).unwrap();
    }

    fn coordinator(&self, console: Box<dyn Write + Send>) -> RunCoordinator {
        let mut script = HashMap::new();
        script.insert("clean".to_string(), QueryRows::default());
        script.insert(
            "orphans".to_string(),
            QueryRows {
                columns: vec!["order_id".to_string()],
                rows: vec![vec![ScalarValue::Int(9)]],
            },
        );
        let connector = ScriptedConnector {
            script,
            journal: self.journal.clone(),
            lock_dir: self.locks.path().to_path_buf(),
        };
        RunCoordinator::new(
            Arc::new(connector),
            OutputRouter::with_writer(Destination::Console, console),
        )
    }

    fn request(&self, servers: &[&str], query_timeout: Option<Duration>) -> RunRequest {
        RunRequest {
            root: self.root.path().to_path_buf(),
            servers: servers
                .iter()
                .map(|name| ServerDescriptor::new(*name, format!("mysql://checker:pw@{}/app", name)))
                .collect(),
            selection: Selection::All,
            settings: RunSettings {
                destination: Destination::Console,
                query_timeout,
                connect_timeout: Duration::from_secs(1),
                lock_dir: self.locks.path().to_path_buf(),
                lock_name: "isolation".to_string(),
            },
        }
    }
}

#[tokio::test]
async fn test_timeout_is_isolated_to_one_constraint() -> Result<()> {
    let setup = Setup::new();
    setup.constraint("orders", "a_slow.sql", "hang");
    setup.constraint("orders", "b_orphans.sql", "orphans");

    let mut coordinator = setup.coordinator(Box::new(io::sink()));
    let outcome = coordinator
        .run(&setup.request(&["orders"], Some(Duration::from_millis(50))))
        .await?;

    assert_eq!(outcome.stats.constraints_failed, 1);
    assert_eq!(outcome.stats.constraints_violated, 1);
    assert!(outcome.violations_found);

    // The timed-out session is dropped, not reused
    let entries = setup.journal.entries();
    let connects = entries.iter().filter(|e| *e == "connect orders").count();
    assert_eq!(connects, 2);
    let closes: Vec<String> = entries
        .iter()
        .filter(|e| e.starts_with("close"))
        .cloned()
        .collect();
    assert_eq!(closes, vec!["close orders lock_held=true"]);
    Ok(())
}

#[tokio::test]
async fn test_servers_run_in_name_order_with_one_connection_each() -> Result<()> {
    let setup = Setup::new();
    for server in ["zeta", "alpha", "mid"] {
        setup.constraint(server, "1.sql", "clean");
        setup.constraint(server, "2.sql", "clean");
    }

    let mut coordinator = setup.coordinator(Box::new(io::sink()));
    coordinator
        .run(&setup.request(&["zeta", "alpha", "mid"], None))
        .await?;

    let connects: Vec<String> = setup
        .journal
        .entries()
        .into_iter()
        .filter(|e| e.starts_with("connect"))
        .collect();
    assert_eq!(connects, vec!["connect alpha", "connect mid", "connect zeta"]);

    let queries = setup
        .journal
        .entries()
        .iter()
        .filter(|e| e.starts_with("query"))
        .count();
    assert_eq!(queries, 6);
    Ok(())
}

#[tokio::test]
async fn test_connections_close_while_lock_is_still_held() -> Result<()> {
    let setup = Setup::new();
    setup.constraint("orders", "a.sql", "clean");
    setup.constraint("billing", "a.sql", "clean");

    let mut coordinator = setup.coordinator(Box::new(io::sink()));
    coordinator
        .run(&setup.request(&["orders", "billing"], None))
        .await?;

    let mut closes: Vec<String> = setup
        .journal
        .entries()
        .into_iter()
        .filter(|e| e.starts_with("close"))
        .collect();
    closes.sort();
    assert_eq!(
        closes,
        vec!["close billing lock_held=true", "close orders lock_held=true"]
    );
    assert!(!lock_is_held(setup.locks.path()));
    Ok(())
}

#[tokio::test]
async fn test_sink_failure_is_a_warning_not_a_reported_violation() -> Result<()> {
    let setup = Setup::new();
    setup.constraint("orders", "orphans.sql", "orphans");

    let mut coordinator = setup.coordinator(Box::new(BrokenConsole));
    let outcome = coordinator.run(&setup.request(&["orders"], None)).await?;

    assert_eq!(outcome.stats.constraints_violated, 1);
    assert_eq!(outcome.stats.sink_warnings, 1);
    assert!(!outcome.violations_found);
    Ok(())
}
