//! `marend`; the Maren daemon.
//!
//! Wires the whole pipeline together: config, store, broker, router,
//! memory, safety, the Telegram transport, the worker pool, and the
//! reviewer HTTP API. Exit codes follow the deployment contract:
//! 0 clean shutdown, 2 configuration error, 3 unreachable store,
//! 4 unreachable broker, 5 unreachable platform at startup.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod startup;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use crate::startup::StartupError;

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "marend", about = "HITL moderation pipeline daemon")]
struct Args {
    /// Path to the config file (also `MAREN_CONFIG`).
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,

    /// Skip the startup recovery pass.
    #[arg(long)]
    no_recovery: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match maren_config::Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(StartupError::CONFIG_EXIT);
        },
    };

    startup::init_tracing(&config);

    if args.check {
        info!("configuration ok");
        return ExitCode::SUCCESS;
    }

    match startup::run(config, args.no_recovery).await {
        Ok(()) => {
            info!("clean shutdown");
            ExitCode::SUCCESS
        },
        Err(err) => {
            error!(%err, "startup failed");
            ExitCode::from(err.exit_code())
        },
    }
}
