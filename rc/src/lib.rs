//! runctl - Cross-Triggered Run Control
//!
//! runctl synchronizes halt and resume of a cluster of processor cores
//! through a cross-trigger interface (CTI) fabric, so a debug host sees one
//! coherent stop or run transition for the whole cluster instead of one
//! racily ordered event per core.
//!
//! # Core Concepts
//!
//! - **One Pulse Per Operation**: every participant is gated for the
//!   operation, then a single pulse from the initiator reaches all of them
//! - **Bounded Convergence**: participants are polled until they all reach
//!   the target state or the cluster timeout elapses
//! - **One Visible Event**: the debug host gets exactly one group stop or
//!   group run, attributed to the cluster's primary core
//! - **Explicit Fallback**: clusters without full CTI coverage are refused
//!   or driven sequentially, never half cross-triggered
//!
//! # Modules
//!
//! - [`controller`] - `SmpController`, the session entry point
//! - [`coordinator`] - cross-triggered halt and resume state machines
//! - [`cti`] - channel roles and per-core channel control
//! - [`poller`] - bounded-time convergence polling
//! - [`notifier`] - group event selection and sinks
//! - [`fallback`] - sequential per-core run control
//! - [`sim`] - simulated target for tests and the scenario harness
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface

pub mod cli;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod cti;
pub mod domain;
pub mod error;
pub mod fallback;
pub mod notifier;
pub mod poller;
pub mod registry;
pub mod scenario;
pub mod sim;
pub mod transport;

// Re-export commonly used types
pub use config::{ClusterConfig, Config, CoreConfig};
pub use controller::{SmpController, Target};
pub use coordinator::{
    GroupOp, HaltCoordinator, HaltPhase, OperationOutcome, OperationPath, OperationReport, RepeatHaltPolicy,
    ResumeCoordinator, ResumePhase,
};
pub use cti::{
    CTI_CHANNEL_COUNT, Channel, ChannelController, ChannelRoles, CtiBinding, DEFAULT_HALT_CHANNEL,
    DEFAULT_RESTART_CHANNEL, GateState,
};
pub use domain::{Cluster, ClusterId, Core, CoreId, CoreStatus, PrimaryPolicy, RunState, StopReason};
pub use error::{Result, RunControlError, TransportError};
pub use fallback::{FallbackPath, FallbackPolicy};
pub use notifier::{EventNotifier, EventSink, GroupEvent, LogSink, RecordingSink};
pub use poller::{ConvergencePoller, ConvergenceResult, CoreOutcome, PollConfig};
pub use registry::CoreRegistry;
pub use scenario::{Scenario, ScenarioOutcome};
pub use sim::{SimOp, SimTarget};
pub use transport::{CoreAccess, TriggerFabric};
