//! Orchestration of dynamically installed services.
//!
//! - [`scanner`] walks the service root and builds the catalog of
//!   installed services with their interfaces.
//! - [`manager`] owns the catalog, the running processes and the instances
//!   multiplexed on them, and exposes the operations the command
//!   dispatcher needs.
//! - [`config`] loads [`EngineConfig`] from TOML.
//! - [`source`] defines the collaborators for downloading packages and
//!   uninstalling services.

pub mod config;
pub mod error;
pub mod manager;
pub mod policy;
pub mod scanner;
pub mod source;
pub mod state;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use manager::{
    CODE_INSTANCE_ERROR, CODE_INVALID_ARGUMENTS, CODE_SERVICE_UNAVAILABLE, DynamicServiceManager,
    ManagerEvent, Resolution,
};
pub use policy::PermissionPolicy;
pub use scanner::{Catalog, CatalogEntry, DiskScanner, ScanOutcome, ScanSettings, ScanStats};
pub use source::{DirectorySource, PackageSource, RemoveDirectory, Uninstaller};
pub use state::InstanceId;
