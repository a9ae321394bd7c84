use std::path::PathBuf;

/// Problems found while reading a service manifest.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("no manifest found at {0}")]
    MissingManifest(PathBuf),

    #[error("failed to read manifest {path}: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("manifest {path} is not valid JSON: {source}")]
    SyntaxError {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("manifest {path} is missing required key '{key}'")]
    MissingField { path: PathBuf, key: String },

    #[error("manifest {path}: '{key}' must be {expected}")]
    TypeMismatch {
        path: PathBuf,
        key: String,
        expected: &'static str,
    },

    #[error("manifest {path}: unknown service type '{value}'")]
    InvalidType { path: PathBuf, value: String },

    #[error("manifest {path}: '{key}' holds malformed version '{value}'")]
    MalformedVersion {
        path: PathBuf,
        key: String,
        value: String,
    },
}

/// Errors raised by the metadata layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("malformed version '{0}'")]
    MalformedVersion(String),

    #[error("invalid service description: {0}")]
    InvalidDescription(String),

    #[error("service has no function '{0}'")]
    UnknownFunction(String),

    #[error("function '{function}' requires argument '{argument}'")]
    MissingArgument { function: String, argument: String },

    #[error("function '{function}' takes no argument '{argument}'")]
    UnexpectedArgument { function: String, argument: String },

    #[error("argument '{argument}' of '{function}' must be of type {expected}")]
    ArgumentType {
        function: String,
        argument: String,
        expected: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
