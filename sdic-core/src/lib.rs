//! Constraint execution engine for the SQL data integrity checker.
//!
//! A soft constraint is a `SELECT` that returns the rows breaking a rule the
//! schema cannot enforce. This crate discovers those queries on disk, runs
//! them against each configured server, and reports every query that came
//! back with rows.
//!
//! # Guarantees
//! - Only one run at a time per installation (lock file)
//! - All database sessions are read-only where the driver allows it
//! - One failing query never aborts the rest of the run
//! - No credentials in logs or error messages
//!
//! # Architecture
//! Data flows top-down:
//! [`runner`] → [`catalog`] → [`provider`] → [`executor`] → [`formatter`] →
//! [`output`]. Database drivers sit behind the [`adapters::Connector`] trait.

pub mod adapters;
pub mod catalog;
pub mod config;
pub mod error;
pub mod executor;
pub mod formatter;
pub mod lock;
pub mod logging;
pub mod models;
pub mod output;
pub mod provider;
pub mod runner;

// Re-export commonly used types
pub use adapters::{Connector, DatabaseType, DriverConnector, SqlConnection};
pub use config::{CheckerConfig, Destination, RunSettings};
pub use error::{ErrorScope, Result, SdicError};
pub use models::{ConstraintFile, RunOutcome, RunStats, ScalarValue, ServerDescriptor, ViolationResult};
pub use output::OutputRouter;
pub use runner::{RunCoordinator, RunRequest, RunState, Selection};
