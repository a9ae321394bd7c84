//! CLI argument parsing using clap derive

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// svcd - Host dynamically installed services
#[derive(Parser, Debug)]
#[command(name = "svcd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Engine config file (TOML)
    #[arg(short, long, global = true, env = "SVCD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Keep services, interface cache and pending updates under this directory
    #[arg(long, global = true, env = "SVCD_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Override the service root
    #[arg(long, global = true)]
    pub service_dir: Option<PathBuf>,

    /// Override the runner executable spawned for every service
    #[arg(long, global = true)]
    pub runner: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// The command to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Scan the service root and list installed services
    Scan {
        /// Output as JSON for scripting
        #[arg(long)]
        json: bool,
    },

    /// Print the interface of an installed service as JSON
    Describe {
        name: String,

        /// Exact version, components may be omitted (e.g. "1.2")
        #[arg(long, default_value = "")]
        version: String,

        /// Lowest acceptable version
        #[arg(long, default_value = "")]
        minversion: String,
    },

    /// Resolve requirements against installed services and a package index
    ///
    /// Requirements are written as NAME, NAME@VERSION or NAME>=MINVERSION.
    ///
    /// Examples:
    ///   svcd resolve Echo                      # Installed only
    ///   svcd resolve Echo --index ./mirror     # Consider a local mirror
    ///   svcd resolve Echo --index ./mirror --fetch --install
    Resolve {
        #[arg(required = true)]
        requirements: Vec<String>,

        /// Directory holding index.json and <name>-<version>.tar.gz packages
        #[arg(long)]
        index: Option<PathBuf>,

        /// Download missing packages into the pending cache
        #[arg(long, requires = "index")]
        fetch: bool,

        /// Install pending packages after fetching
        #[arg(long)]
        install: bool,
    },

    /// Stop and uninstall one service version
    Purge { name: String, version: String },

    /// Serve newline-delimited JSON commands on stdin
    Run,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_resolve_with_globals() {
        let cli = Cli::parse_from([
            "svcd",
            "resolve",
            "Echo>=1.0",
            "--index",
            "/mirror",
            "--fetch",
            "--data-dir",
            "/data",
        ]);
        assert_eq!(cli.data_dir, Some(PathBuf::from("/data")));
        assert_eq!(
            cli.command,
            Commands::Resolve {
                requirements: vec!["Echo>=1.0".to_string()],
                index: Some(PathBuf::from("/mirror")),
                fetch: true,
                install: false,
            }
        );
    }

    #[test]
    fn test_fetch_requires_index() {
        assert!(Cli::try_parse_from(["svcd", "resolve", "Echo", "--fetch"]).is_err());
    }
}
