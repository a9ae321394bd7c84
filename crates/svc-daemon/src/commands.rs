//! One-shot subcommands and shared engine setup.

use std::sync::Arc;

use colored::Colorize;
use svc_manager::{
    DirectorySource, DynamicServiceManager, EngineConfig, ManagerEvent, PackageSource,
};
use svc_resolve::RequireStatement;
use svc_runner::TokioProcessHost;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::cli::Cli;
use crate::error::{CliError, Result};

/// Config file (or defaults) with command-line overrides applied.
pub fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = EngineConfig::load_or_default(cli.config.as_deref())?;
    if let Some(data_dir) = &cli.data_dir {
        let rooted = EngineConfig::rooted_at(data_dir);
        config.service_dir = rooted.service_dir;
        config.interface_cache_dir = rooted.interface_cache_dir;
        config.pending_dir = rooted.pending_dir;
    }
    if let Some(service_dir) = &cli.service_dir {
        config.service_dir = service_dir.clone();
    }
    if let Some(runner) = &cli.runner {
        config.runner_path = runner.clone();
    }
    Ok(config)
}

/// A manager over the real process host, with the catalog loaded.
pub async fn start_engine(
    config: EngineConfig,
) -> (DynamicServiceManager, UnboundedReceiver<ManagerEvent>) {
    let host = Arc::new(TokioProcessHost::new(config.runner_path.clone()));
    let (mut manager, events) = DynamicServiceManager::new(config, host);
    manager.force_rescan().await;
    (manager, events)
}

/// Parse `NAME`, `NAME@VERSION` or `NAME>=MINVERSION`.
pub fn parse_requirement(s: &str) -> Result<RequireStatement> {
    let invalid = || CliError::InvalidRequirement(s.to_string());
    let (name, version, minversion) = if let Some((name, min)) = s.split_once(">=") {
        (name, "", min)
    } else if let Some((name, version)) = s.split_once('@') {
        (name, version, "")
    } else {
        (s, "", "")
    };
    let name = name.trim();
    if name.is_empty() {
        return Err(invalid());
    }
    RequireStatement::parse(name, version.trim(), minversion.trim()).map_err(|_| invalid())
}

pub async fn run_scan(config: EngineConfig, json: bool) -> Result<()> {
    let (manager, _events) = start_engine(config).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&manager.available_summaries())?);
        return Ok(());
    }

    let summaries = manager.available_summaries();
    if summaries.is_empty() {
        println!("{}", "No services installed.".dimmed());
        return Ok(());
    }
    let locale = &manager.config().locale;
    println!("{}", "Installed Services".bold());
    for summary in summaries {
        let title = summary
            .localization(locale)
            .map(|l| l.title.as_str())
            .unwrap_or_default();
        println!(
            "  {} {} {} {}",
            summary.name().cyan(),
            summary.version(),
            format!("[{}]", summary.service_type()).dimmed(),
            title
        );
    }
    let stats = manager.last_scan();
    println!();
    println!(
        "{} loaded, {} cached, {} removed",
        stats.loaded,
        stats.cached,
        stats.bogus + stats.blacklisted
    );
    Ok(())
}

pub async fn run_describe(
    config: EngineConfig,
    name: &str,
    version: &str,
    minversion: &str,
) -> Result<()> {
    let (manager, _events) = start_engine(config).await;
    let description = manager.describe(name, version, minversion)?;
    println!("{}", serde_json::to_string_pretty(description)?);
    Ok(())
}

pub async fn run_resolve(
    config: EngineConfig,
    requirements: &[String],
    index: Option<&std::path::Path>,
    fetch: bool,
    install: bool,
) -> Result<()> {
    let requirements = requirements
        .iter()
        .map(|r| parse_requirement(r))
        .collect::<Result<Vec<_>>>()?;
    let (mut manager, _events) = start_engine(config).await;

    let source = index.map(DirectorySource::new);
    let available = match &source {
        Some(source) => source.list().await?,
        None => Vec::new(),
    };

    let resolution = manager.satisfy_requirements(&requirements, &available, true)?;
    for service in &resolution.ordered {
        let download = resolution.to_download.iter().any(|d| d.same_identity(service));
        if download {
            println!("{} {}", service, "(download)".yellow());
        } else {
            println!("{} {}", service, "(installed)".green());
        }
    }

    if let (true, Some(source)) = (fetch, &source) {
        let staged = manager.fetch_updates(source, &requirements).await?;
        for summary in &staged {
            println!("{} {}", "fetched".green(), summary.key());
        }
    }
    if install {
        for key in manager.install_updates().await? {
            println!("{} {}", "installed".green(), key);
        }
    }
    Ok(())
}

pub async fn run_purge(config: EngineConfig, name: &str, version: &str) -> Result<()> {
    let (mut manager, _events) = start_engine(config).await;
    manager.purge_service(name, version).await?;
    println!("{} {}/{}", "purged".green(), name, version);
    Ok(())
}
