//! Domain types for run control
//!
//! - [`Core`] - per-core run-control state
//! - [`Cluster`] - a set of cores halted and resumed together
//! - [`RunState`], [`StopReason`] - state vocabulary shared with the debug host

mod cluster;
mod cpu;
mod state;

pub use cluster::{Cluster, ClusterId, DEFAULT_CONVERGENCE_TIMEOUT, PrimaryPolicy};
pub use cpu::{Core, CoreId, CoreStatus};
pub use state::{RunState, StopReason};
