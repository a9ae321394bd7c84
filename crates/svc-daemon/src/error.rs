//! Error types for svcd

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Manager(#[from] svc_manager::Error),

    #[error("invalid requirement '{0}': expected NAME, NAME@VERSION or NAME>=MINVERSION")]
    InvalidRequirement(String),

    #[error("failed to initialise logging: {0}")]
    Logging(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CliError>;
