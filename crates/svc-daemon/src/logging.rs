use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::error::{CliError, Result};

const DEFAULT_FILTER: &str = "svcd=info,svc_manager=info,svc_runner=warn";
const VERBOSE_FILTER: &str = "debug";

/// Initialize a tracing subscriber writing to stderr.
///
/// `RUST_LOG` wins when set. Stdout is reserved for command output and
/// the `run` protocol.
pub fn init(verbose: bool) -> Result<()> {
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .compact();

    let fallback = if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER };
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .map_err(|e| CliError::Logging(e.to_string()))?;

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| CliError::Logging(e.to_string()))?;

    Ok(())
}
