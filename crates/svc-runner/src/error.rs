use std::path::PathBuf;

/// Errors raised while hosting service processes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to spawn {runner} for {service_dir}: {source}")]
    ProcessSpawnFailure {
        runner: PathBuf,
        service_dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("service process ended (reached ready: {reached_ready}): {reason}")]
    ProcessCrashed { reached_ready: bool, reason: String },

    #[error("service process for {0} is not connected")]
    NotConnected(String),

    #[error("channel to service process closed")]
    ChannelClosed,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("unknown allocation {0}")]
    UnknownAllocation(u32),

    #[error("unknown transaction {0}")]
    TransactionUnknown(u32),

    #[error("prompt {prompt} was not raised by allocation {allocation}")]
    PromptNotOwned { prompt: u32, allocation: u32 },
}

pub type Result<T> = std::result::Result<T, Error>;
