//! Per-run connection cache.
//!
//! One session per server, opened on first use and shared by every
//! constraint of that server. [`ConnectionProvider::close_all`] must run at
//! the end of every run; the coordinator calls it on all exit paths after the
//! lock is taken. Sessions still open when the provider is dropped are closed
//! non-gracefully by their drivers.
//!
//! A session whose query timed out may still be busy with the abandoned
//! statement. [`ConnectionProvider::discard`] drops it so the next constraint
//! of that server gets a fresh one.

use crate::adapters::{Connector, SqlConnection};
use crate::models::ServerDescriptor;
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lazily opens and memoizes one connection per server name.
pub struct ConnectionProvider {
    connector: Arc<dyn Connector>,
    connections: HashMap<String, Box<dyn SqlConnection>>,
    statement_timeout: Option<Duration>,
}

impl std::fmt::Debug for ConnectionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionProvider")
            .field("open_connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

impl ConnectionProvider {
    /// Creates an empty provider.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            connections: HashMap::new(),
            statement_timeout: None,
        }
    }

    /// Sets the server-side statement limit applied to every session opened
    /// from now on.
    #[must_use]
    pub const fn with_statement_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.statement_timeout = timeout;
        self
    }

    /// Returns the session for `server`, opening it on first call.
    ///
    /// # Errors
    /// Returns [`crate::SdicError::Connection`] when the server cannot be
    /// reached. Nothing is cached on failure.
    pub async fn get_connection(
        &mut self,
        server: &ServerDescriptor,
    ) -> Result<&mut (dyn SqlConnection + 'static)> {
        if !self.connections.contains_key(&server.name) {
            debug!(server = %server.name, uri = %server.redacted_uri(), "Opening connection");
            let mut conn = self.connector.connect(server).await?;
            if let Some(timeout) = self.statement_timeout
                && let Err(e) = conn.set_statement_timeout(timeout).await
            {
                warn!(
                    server = %server.name,
                    error = %e,
                    "Server-side statement timeout not set; relying on the client timeout"
                );
            }
            info!(
                server = %server.name,
                database = %conn.database_type(),
                "Connected"
            );
            self.connections.insert(server.name.clone(), conn);
        }

        self.connections
            .get_mut(&server.name)
            .map(|conn| &mut **conn)
            .ok_or_else(|| {
                crate::SdicError::connection_refused(
                    &server.name,
                    &server.connection_uri,
                    "connection vanished from cache",
                )
            })
    }

    /// Number of sessions currently open.
    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }

    /// Drops the session of `server_name` without a graceful close. A graceful
    /// close would queue behind a statement the server is still running.
    /// Returns whether a session was open.
    pub fn discard(&mut self, server_name: &str) -> bool {
        let discarded = self.connections.remove(server_name).is_some();
        if discarded {
            debug!(server = %server_name, "Discarded connection");
        }
        discarded
    }

    /// Closes every session this provider opened.
    pub async fn close_all(&mut self) {
        for (name, conn) in self.connections.drain() {
            conn.close().await;
            debug!(server = %name, "Closed connection");
        }
    }
}
