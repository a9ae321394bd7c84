//! Error types for svc-cache

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Lock acquisition failed for {path}")]
    LockFailed { path: PathBuf },

    #[error("Failed to serialize description: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to unpack {name} {version}: {reason}")]
    Unpack {
        name: String,
        version: String,
        reason: String,
    },

    #[error("{name} {version} is not in the pending update cache")]
    NotCached { name: String, version: String },

    #[error(transparent)]
    Manifest(#[from] svc_meta::ManifestError),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
