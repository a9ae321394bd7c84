//! Disk-backed caches used by the service engine.
//!
//! - [`InterfaceCache`] keeps serialized service descriptions so a rescan
//!   does not have to spawn every service to learn its interface.
//! - [`PendingUpdateCache`] stages downloaded packages until they can be
//!   installed into the service root.
//!
//! Both stores expect a single writing process. Individual writes are
//! atomic (temp file plus rename) and take an advisory lock.

pub mod error;
pub mod interface;
pub mod io;
pub mod pending;

pub use error::{Error, Result};
pub use interface::InterfaceCache;
pub use pending::PendingUpdateCache;
