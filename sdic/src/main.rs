//! SQL data integrity checker.
//!
//! Runs every soft constraint query found under the constraint root against
//! its server and reports the ones that return rows.
//!
//! # Guarantees
//! - Read-only database sessions
//! - One run at a time (lock file)
//! - No credentials in logs

use clap::Parser;
use sdic::{Cli, EXIT_FATAL};
use sdic_core::logging::init_logging;
use std::process::ExitCode;
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.global.verbose, cli.global.quiet, cli.global.log_format.into()) {
        eprintln!("Error: {}", e);
        return ExitCode::from(EXIT_FATAL);
    }

    let result = sdic::run(cli).await;
    if let Err(e) = &result {
        error!("{:#}", e);
    }
    ExitCode::from(sdic::exit_code_for(&result))
}
