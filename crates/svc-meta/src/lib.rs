//! Metadata layer of the service engine.
//!
//! This crate knows how to read what a service says about itself:
//!
//! - [`version`] parses and orders service versions and holds the single
//!   "is this a better match" rule used by every selection in the engine.
//! - [`summary`] reads `manifest.json` into a typed [`ServiceSummary`].
//! - [`description`] models the function interface a running service
//!   reports about itself.
//! - [`locale`] expands a locale into its fallback chain.

pub mod description;
pub mod error;
pub mod locale;
pub mod summary;
pub mod version;

pub use description::{
    ArgumentType, FunctionDescription, ParameterDescription, ServiceDescription,
};
pub use error::{Error, ManifestError, Result};
pub use summary::{
    Localization, ProviderRequirement, ServiceKey, ServiceKind, ServiceSummary, ServiceType,
};
pub use version::{ServiceVersion, is_newer_match};

/// File name of the manifest inside every service directory.
pub const MANIFEST_FILE: &str = "manifest.json";
