//! Access traits for the debug transport
//!
//! The run-control layer never touches registers itself. Individual core
//! and cross-trigger accesses go through these two traits, implemented by
//! whatever debug adapter backs the session (or by [`crate::sim::SimTarget`]).
//! Every call is a synchronous round trip.

use crate::cti::{Channel, CtiBinding, GateState};
use crate::domain::{RunState, StopReason};
use crate::error::TransportError;

/// Per-core debug accesses
pub trait CoreAccess: Send + Sync {
    /// Examine the core and report its current state
    fn examine(&self, core: &str) -> Result<RunState, TransportError>;

    /// Sample the core's run state
    fn read_state(&self, core: &str) -> Result<RunState, TransportError>;

    /// Why a halted core stopped
    fn stop_reason(&self, _core: &str) -> Result<StopReason, TransportError> {
        Ok(StopReason::AsyncHalt)
    }

    /// Request a halt through the core's own debug interface
    fn halt(&self, core: &str) -> Result<(), TransportError>;

    /// Request a restart through the core's own debug interface
    fn resume(&self, core: &str) -> Result<(), TransportError>;

    /// Write back breakpoints and watchpoints from the halted snapshot
    fn restore_debug_state(&self, core: &str) -> Result<(), TransportError>;
}

/// Cross-trigger interface accesses
pub trait TriggerFabric: Send + Sync {
    /// Gate or ungate one channel of a CTI
    fn set_gate(&self, cti: &CtiBinding, channel: Channel, state: GateState) -> Result<(), TransportError>;

    /// Momentarily assert a channel, broadcasting one trigger event
    fn pulse(&self, cti: &CtiBinding, channel: Channel) -> Result<(), TransportError>;

    /// Clear latched trigger events not yet consumed by the core
    fn acknowledge(&self, cti: &CtiBinding) -> Result<(), TransportError>;
}
