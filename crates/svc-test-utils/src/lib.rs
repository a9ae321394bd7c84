//! Shared test utilities for the service engine workspace.
//!
//! Dev-dependency only, never published.
//!
//! # Modules
//!
//! - [`fixture`]: [`ServiceTree`], a temporary data directory with
//!   helpers for laying out installed services and building packages
//! - [`host`]: [`FakeHost`], an in-process [`svc_runner::ProcessHost`]
//!   whose services follow a scripted [`Behavior`]

pub mod fixture;
pub mod host;

pub use fixture::{ServiceTree, dependent_manifest, package, provider_manifest, standalone_manifest};
pub use host::{Behavior, FakeHost};
