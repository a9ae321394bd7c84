//! svcd, the service engine daemon
//!
//! # Usage
//!
//! ```bash
//! svcd [--config <path>] [--data-dir <dir>] <command>
//! ```
//!
//! `svcd run` serves JSON commands over stdio; the other subcommands run
//! once against the installed services and exit.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Control log verbosity (default: `svcd=info,svc_manager=info,svc_runner=warn`)
//! - `SVCD_CONFIG`: Path of the config file
//! - `SVCD_DATA_DIR`: Data directory overriding the configured ones

mod cli;
mod commands;
mod error;
mod logging;
mod server;

use clap::Parser;
use colored::Colorize;

use cli::{Cli, Commands};
use error::Result;
use server::Server;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{}: {}", "error".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose)?;

    let config = commands::load_config(&cli)?;
    tracing::debug!(
        service_dir = %config.service_dir.display(),
        runner = %config.runner_path.display(),
        "config loaded"
    );

    match cli.command {
        Commands::Scan { json } => commands::run_scan(config, json).await,
        Commands::Describe {
            name,
            version,
            minversion,
        } => commands::run_describe(config, &name, &version, &minversion).await,
        Commands::Resolve {
            requirements,
            index,
            fetch,
            install,
        } => commands::run_resolve(config, &requirements, index.as_deref(), fetch, install).await,
        Commands::Purge { name, version } => commands::run_purge(config, &name, &version).await,
        Commands::Run => {
            let (manager, events) = commands::start_engine(config).await;
            Server::new(manager, events).run().await
        }
    }
}
