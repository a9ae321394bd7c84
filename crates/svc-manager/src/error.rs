use std::path::PathBuf;

use crate::state::InstanceId;

/// Errors surfaced by the service manager.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to load config {path}: {message}")]
    Config { path: PathBuf, message: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no installed service matches {name} (version '{version}', minversion '{minversion}')")]
    ServiceNotFound {
        name: String,
        version: String,
        minversion: String,
    },

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("unknown instance {0}")]
    InstanceUnknown(InstanceId),

    #[error("package source failed: {0}")]
    Source(String),

    #[error(transparent)]
    Meta(#[from] svc_meta::Error),

    #[error(transparent)]
    Cache(#[from] svc_cache::Error),

    #[error(transparent)]
    Resolve(#[from] svc_resolve::Error),

    #[error(transparent)]
    Runner(#[from] svc_runner::Error),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
