//! Per-core run-control record

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::cluster::ClusterId;
use super::state::RunState;
use crate::cti::ChannelController;

/// Core identifier (target name as configured, e.g. `r5.cpu0`)
pub type CoreId = String;

/// Run-control state for one core
#[derive(Debug, Clone)]
pub struct Core {
    pub id: CoreId,
    /// Set once the core has been successfully examined
    pub examined: bool,
    pub run_state: RunState,
    pub cluster: Option<ClusterId>,
    /// Absent when the core cannot join cross-triggered operations
    pub channel: Option<Arc<ChannelController>>,
    /// The current halt has been reported to the host in a group stop
    pub stop_reported: bool,
}

impl Core {
    pub fn new(id: impl Into<CoreId>) -> Self {
        Self {
            id: id.into(),
            examined: false,
            run_state: RunState::Unknown,
            cluster: None,
            channel: None,
            stop_reported: false,
        }
    }

    pub fn has_binding(&self) -> bool {
        self.channel.is_some()
    }

    /// Whether this core takes part in group operations right now
    pub fn is_eligible(&self) -> bool {
        self.examined && self.run_state.can_participate()
    }
}

/// Answer to a per-core status query from the debug host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreStatus {
    pub core: CoreId,
    #[serde(rename = "run-state")]
    pub run_state: RunState,
    pub examined: bool,
    pub cluster: Option<ClusterId>,
    /// Designated primary of the most recent group stop of its cluster
    #[serde(rename = "is-primary")]
    pub is_primary: bool,
}
