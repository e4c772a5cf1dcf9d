//! Run states and stop reasons

use serde::{Deserialize, Serialize};

/// Observed execution state of a core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Unknown,
    Running,
    Halted,
    Reset,
    Unavailable,
}

impl RunState {
    /// Whether a core in this state can take part in a group halt or resume
    ///
    /// Cores held in reset or unreachable on the debug bus cannot process
    /// trigger events and are left out of coordinated operations.
    pub fn can_participate(&self) -> bool {
        matches!(self, Self::Unknown | Self::Running | Self::Halted)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Running => write!(f, "running"),
            Self::Halted => write!(f, "halted"),
            Self::Reset => write!(f, "reset"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Why a group stop was reported to the debug host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    /// The host explicitly requested a halt
    HaltRequest,
    /// A core hit a breakpoint or watchpoint on its own
    Breakpoint,
    /// A core halted outside any coordinated operation for another reason
    AsyncHalt,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HaltRequest => write!(f, "halt-request"),
            Self::Breakpoint => write!(f, "breakpoint"),
            Self::AsyncHalt => write!(f, "async-halt"),
        }
    }
}
