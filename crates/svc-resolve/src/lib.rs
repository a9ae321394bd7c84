//! Dependency resolution for services.
//!
//! Given what the caller asked for ([`RequireStatement`]s) and pools of
//! candidates ([`AvailableService`]s), compute the smallest set of services
//! that satisfies every requirement plus the providers its dependents need,
//! ordered so that every provider comes before the services using it.
//!
//! ```
//! use svc_resolve::{AvailableService, RequireStatement, find_satisfying_set};
//!
//! let available = vec![
//!     AvailableService::standalone("P", "2.1.0").unwrap(),
//!     AvailableService::dependent("D", "1.0.0", "P", "", "2.0").unwrap(),
//! ];
//! let wanted = vec![RequireStatement::parse("D", "", "").unwrap()];
//!
//! let set = find_satisfying_set(&wanted, &[], &available, true).unwrap();
//! let names: Vec<_> = set.iter().map(|s| s.name.as_str()).collect();
//! assert_eq!(names, ["P", "D"]);
//! ```

pub mod error;
pub mod graph;
pub mod resolver;
pub mod types;

pub use error::{Error, Result};
pub use graph::{ServiceGraph, SortOutcome};
pub use resolver::{find_best_match, find_satisfying_set, have_updates};
pub use types::{AvailableService, ProviderConstraint, RequireStatement};
