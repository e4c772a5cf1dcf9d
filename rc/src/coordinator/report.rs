//! Result of a group operation

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{ClusterId, CoreId};
use crate::error::{Result, RunControlError};
use crate::notifier::GroupEvent;
use crate::poller::ConvergenceResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupOp {
    Halt,
    Resume,
}

impl std::fmt::Display for GroupOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Halt => write!(f, "halt"),
            Self::Resume => write!(f, "resume"),
        }
    }
}

/// How the operation was carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationPath {
    /// One pulse on the trigger fabric
    CrossTriggered,
    /// Per-core requests without cross-triggering
    Sequential,
    /// Every participant was already in the target state
    AlreadyAtTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationOutcome {
    Converged,
    /// Partial success; see [`OperationReport::timed_out`]
    TimedOut,
    Cancelled,
}

/// Everything a caller needs to know about a finished group operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationReport {
    #[serde(rename = "op-id")]
    pub op_id: Uuid,
    pub cluster: ClusterId,
    pub op: GroupOp,
    pub path: OperationPath,
    pub outcome: OperationOutcome,
    pub participants: Vec<CoreId>,
    pub skipped: Vec<CoreId>,
    /// Core that issued the pulse (or the first request on the sequential path)
    pub initiator: Option<CoreId>,
    pub convergence: ConvergenceResult,
    /// The single visible event, if one was emitted
    pub event: Option<GroupEvent>,
}

impl OperationReport {
    pub fn is_success(&self) -> bool {
        self.outcome == OperationOutcome::Converged
    }

    /// Participants that did not reach the target state
    pub fn timed_out(&self) -> &[CoreId] {
        &self.convergence.timed_out
    }

    /// Turn partial success into an error for callers that need all-or-nothing
    pub fn into_result(self) -> Result<Self> {
        match self.outcome {
            OperationOutcome::Converged => Ok(self),
            OperationOutcome::TimedOut => Err(RunControlError::ConvergenceTimeout {
                cluster: self.cluster,
                cores: self.convergence.timed_out.clone(),
                elapsed: self.convergence.elapsed(),
            }),
            OperationOutcome::Cancelled => Err(RunControlError::Cancelled { cluster: self.cluster }),
        }
    }

    pub(crate) fn outcome_of(result: &ConvergenceResult) -> OperationOutcome {
        if result.cancelled {
            OperationOutcome::Cancelled
        } else if result.overall_success() {
            OperationOutcome::Converged
        } else {
            OperationOutcome::TimedOut
        }
    }
}
