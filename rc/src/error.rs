//! Error types for run-control operations

use std::time::Duration;
use thiserror::Error;

/// Shared result type for the library
pub type Result<T> = std::result::Result<T, RunControlError>;

/// A register or channel access that did not complete
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Transport {op} on {target} failed: {message}")]
pub struct TransportError {
    /// Core or CTI the access was addressed to
    pub target: String,
    /// Operation name (read-state, gate, pulse, ...)
    pub op: &'static str,
    pub message: String,
    /// Whether repeating the same access may succeed
    pub transient: bool,
}

impl TransportError {
    /// A failure that is not expected to clear on retry
    pub fn fatal(target: impl Into<String>, op: &'static str, message: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            op,
            message: message.into(),
            transient: false,
        }
    }

    /// A failure that may clear on retry (bus busy, sticky error, ...)
    pub fn transient(target: impl Into<String>, op: &'static str, message: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            op,
            message: message.into(),
            transient: true,
        }
    }

    /// Check if the access may be retried
    pub fn is_transient(&self) -> bool {
        self.transient
    }
}

/// Errors surfaced by the run-control layer
#[derive(Debug, Error)]
pub enum RunControlError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Cluster {cluster} cannot use cross-triggering: no CTI binding for {}", .cores.join(", "))]
    MissingBinding { cluster: String, cores: Vec<String> },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Cluster {cluster} did not converge within {elapsed:?}: {}", .cores.join(", "))]
    ConvergenceTimeout {
        cluster: String,
        cores: Vec<String>,
        elapsed: Duration,
    },

    #[error("Protocol violation on {core}: {detail}")]
    ProtocolViolation { core: String, detail: String },

    #[error("Cluster {cluster} already has an operation in flight")]
    ClusterBusy { cluster: String },

    #[error("Operation on cluster {cluster} was cancelled")]
    Cancelled { cluster: String },

    #[error("Unknown core: {0}")]
    UnknownCore(String),

    #[error("Unknown cluster: {0}")]
    UnknownCluster(String),
}

impl RunControlError {
    /// Check if this error comes from configuration rather than hardware
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::Config(_) | Self::MissingBinding { .. })
    }

    /// Cores named by this error, if any
    pub fn cores(&self) -> Vec<String> {
        match self {
            Self::MissingBinding { cores, .. } | Self::ConvergenceTimeout { cores, .. } => cores.clone(),
            Self::ProtocolViolation { core, .. } | Self::UnknownCore(core) => vec![core.clone()],
            Self::Transport(e) => vec![e.target.clone()],
            _ => Vec::new(),
        }
    }
}
