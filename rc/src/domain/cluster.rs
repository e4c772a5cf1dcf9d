//! Cluster definition and primary-core selection

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::cpu::CoreId;
use crate::cti::ChannelRoles;

/// Cluster identifier
pub type ClusterId = String;

/// Default time a group operation may take to converge
pub const DEFAULT_CONVERGENCE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Which participant's state change is surfaced to the debug host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PrimaryPolicy {
    /// The core the request named, else the first eligible participant
    #[default]
    Requested,
    /// Always the first eligible participant in member order
    FirstEligible,
}

impl PrimaryPolicy {
    /// Pick the primary among `eligible` (in member order)
    pub fn select<'a>(&self, requested: Option<&'a CoreId>, eligible: &'a [CoreId]) -> Option<&'a CoreId> {
        debug!(policy = ?self, ?requested, eligible = eligible.len(), "PrimaryPolicy::select: called");
        match (self, requested) {
            (Self::Requested, Some(core)) if eligible.contains(core) => Some(core),
            _ => eligible.first(),
        }
    }
}

/// A set of cores managed together for synchronized halt/resume
#[derive(Debug, Clone)]
pub struct Cluster {
    pub id: ClusterId,
    /// Members in configuration order
    pub members: Vec<CoreId>,
    pub convergence_timeout: Duration,
    pub primary_policy: PrimaryPolicy,
    /// Channel carrying halt and restart triggers for this cluster
    pub channels: ChannelRoles,
    /// Primary of the most recent group stop
    pub last_stop_primary: Option<CoreId>,
}

impl Cluster {
    pub fn new(id: impl Into<ClusterId>, members: Vec<CoreId>) -> Self {
        Self {
            id: id.into(),
            members,
            convergence_timeout: DEFAULT_CONVERGENCE_TIMEOUT,
            primary_policy: PrimaryPolicy::default(),
            channels: ChannelRoles::default(),
            last_stop_primary: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.convergence_timeout = timeout;
        self
    }

    pub fn with_policy(mut self, policy: PrimaryPolicy) -> Self {
        self.primary_policy = policy;
        self
    }

    pub fn with_channels(mut self, channels: ChannelRoles) -> Self {
        self.channels = channels;
        self
    }

    pub fn contains(&self, core: &str) -> bool {
        self.members.iter().any(|m| m == core)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cores(names: &[&str]) -> Vec<CoreId> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_default_cluster() {
        let cluster = Cluster::new("r5", cores(&["r5.cpu0", "r5.cpu1"]));
        assert_eq!(cluster.convergence_timeout, Duration::from_millis(1000));
        assert_eq!(cluster.primary_policy, PrimaryPolicy::Requested);
        assert!(cluster.contains("r5.cpu1"));
        assert!(!cluster.contains("a53.cpu0"));
    }

    #[test]
    fn test_requested_policy_prefers_requested_core() {
        let eligible = cores(&["r5.cpu0", "r5.cpu1"]);
        let requested = "r5.cpu1".to_string();
        let primary = PrimaryPolicy::Requested.select(Some(&requested), &eligible);
        assert_eq!(primary.map(String::as_str), Some("r5.cpu1"));
    }

    #[test]
    fn test_requested_policy_falls_back_to_first_eligible() {
        let eligible = cores(&["r5.cpu1"]);
        let requested = "r5.cpu0".to_string();
        let primary = PrimaryPolicy::Requested.select(Some(&requested), &eligible);
        assert_eq!(primary.map(String::as_str), Some("r5.cpu1"));

        let primary = PrimaryPolicy::Requested.select(None, &eligible);
        assert_eq!(primary.map(String::as_str), Some("r5.cpu1"));
    }

    #[test]
    fn test_first_eligible_ignores_request() {
        let eligible = cores(&["r5.cpu0", "r5.cpu1"]);
        let requested = "r5.cpu1".to_string();
        let primary = PrimaryPolicy::FirstEligible.select(Some(&requested), &eligible);
        assert_eq!(primary.map(String::as_str), Some("r5.cpu0"));
    }

    #[test]
    fn test_select_with_no_eligible() {
        assert!(PrimaryPolicy::Requested.select(None, &[]).is_none());
    }
}
