//! Running services out of process.
//!
//! A [`Controller`] owns one spawned service process and multiplexes any
//! number of logical instances of that service over it. The process is
//! reached through a [`ServiceLink`] handed out by a [`ProcessHost`]; the
//! real host is [`TokioProcessHost`], which talks newline-delimited JSON
//! over the child's stdio.
//!
//! Nothing in this crate calls back into its owner. Process output arrives
//! as [`RunnerEvent`]s on a channel, the owner feeds each one to
//! [`Controller::handle`] and acts on the returned [`ControllerOutcome`]s.

pub mod controller;
pub mod error;
pub mod host;
pub mod protocol;

pub use controller::{AllocationId, Controller, ControllerId, ControllerOutcome, ControllerState};
pub use error::{Error, Result};
pub use host::{ProcessHost, RunnerEvent, ServiceLink, SpawnRequest, TokioProcessHost};
pub use protocol::{AllocationContext, ExitReason, HostMessage, ProcessEvent, ServiceMessage};
