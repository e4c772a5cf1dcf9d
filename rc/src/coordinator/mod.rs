//! Cross-triggered group halt and resume
//!
//! Both coordinators follow the same shape: prepare every participant's
//! gating, issue exactly one pulse from the initiator, then wait for the
//! cluster to converge and hand the result to the notifier.
//!
//! - [`HaltCoordinator`] - Preparing, Pulsed, Converging on the halt channel
//! - [`ResumeCoordinator`] - breakpoint restoration first, then the same on
//!   the restart channel

mod halt;
mod report;
mod resume;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::cti::ChannelController;
use crate::domain::{Cluster, Core, CoreId, RunState};
use crate::error::{Result, RunControlError};
use crate::registry::CoreRegistry;

pub use halt::{HaltCoordinator, HaltPhase, RepeatHaltPolicy};
pub(crate) use halt::repeat_halt_report;
pub(crate) use resume::noop_resume_report;
pub use report::{GroupOp, OperationOutcome, OperationPath, OperationReport};
pub use resume::{ResumeCoordinator, ResumePhase};

/// Cores taking part in one group operation
#[derive(Debug, Clone)]
pub struct Participants {
    /// Eligible members in member order
    pub cores: Vec<Core>,
    /// Members left out (unexamined, unavailable or in reset)
    pub skipped: Vec<CoreId>,
    /// Channel controllers still bound to skipped members
    pub stale_channels: Vec<Arc<ChannelController>>,
}

impl Participants {
    /// Split a cluster's members into participants and skipped cores
    pub fn select(registry: &CoreRegistry, cluster: &Cluster) -> Result<Self> {
        let (cores, skipped): (Vec<Core>, Vec<Core>) = registry
            .members(&cluster.id)?
            .into_iter()
            .partition(Core::is_eligible);
        let stale_channels = skipped.iter().filter_map(|c| c.channel.clone()).collect();
        let skipped: Vec<CoreId> = skipped.into_iter().map(|c| c.id).collect();
        debug!(cluster = %cluster.id, participants = cores.len(), ?skipped, "Participants::select: called");
        Ok(Self {
            cores,
            skipped,
            stale_channels,
        })
    }

    /// Gate both role channels of every skipped member that still has a binding
    ///
    /// A skipped core left halt- or restart-ready would follow the group's
    /// pulse. Failures are logged and do not abort the operation.
    pub fn isolate_skipped(&self) {
        for channel in &self.stale_channels {
            if let Err(e) = channel.isolate() {
                warn!(core = %channel.core(), error = %e, "Failed to isolate skipped core from the trigger fabric");
            }
        }
    }

    pub fn ids(&self) -> Vec<CoreId> {
        self.cores.iter().map(|c| c.id.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.cores.is_empty()
    }

    /// Participants with no channel binding
    pub fn unbound(&self) -> Vec<CoreId> {
        self.cores
            .iter()
            .filter(|c| !c.has_binding())
            .map(|c| c.id.clone())
            .collect()
    }

    /// Whether every participant is already in `state`
    pub fn all_in(&self, state: RunState) -> bool {
        self.cores.iter().all(|c| c.run_state == state)
    }

    /// The requested core if it participates, else the first participant
    pub fn initiator(&self, requested: Option<&CoreId>) -> Option<&Core> {
        requested
            .and_then(|r| self.cores.iter().find(|c| &c.id == r))
            .or_else(|| self.cores.first())
    }

    /// Channel controllers of every participant, or the unbound cores
    pub fn channels(&self, cluster: &str) -> Result<Vec<Arc<ChannelController>>> {
        let unbound = self.unbound();
        if !unbound.is_empty() {
            return Err(RunControlError::MissingBinding {
                cluster: cluster.to_string(),
                cores: unbound,
            });
        }
        Ok(self.cores.iter().filter_map(|c| c.channel.clone()).collect())
    }
}

/// Inputs shared by one coordinated operation
pub struct OperationContext<'a> {
    pub op_id: Uuid,
    pub registry: &'a CoreRegistry,
    pub cluster: &'a Cluster,
    pub participants: &'a Participants,
    /// Core the request named, if any
    pub requested: Option<&'a CoreId>,
    /// Set to abort convergence polling
    pub cancel: &'a AtomicBool,
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::cti::{Channel, GateState};

    fn registry() -> (CoreRegistry, Cluster) {
        let registry = CoreRegistry::new();
        for core in ["cpu0", "cpu1", "cpu2"] {
            registry.register_core(core).unwrap();
        }
        let cluster = Cluster::new("c", vec!["cpu0".into(), "cpu1".into(), "cpu2".into()]);
        registry.register_cluster(cluster.clone()).unwrap();
        (registry, cluster)
    }

    #[test]
    fn test_select_skips_unexamined_and_reset() {
        let (registry, cluster) = registry();
        registry.mark_examined("cpu0", RunState::Running).unwrap();
        registry.mark_examined("cpu2", RunState::Reset).unwrap();

        let participants = Participants::select(&registry, &cluster).unwrap();
        assert_eq!(participants.ids(), vec!["cpu0".to_string()]);
        assert_eq!(participants.skipped, vec!["cpu1".to_string(), "cpu2".to_string()]);
    }

    #[test]
    fn test_initiator_selection() {
        let (registry, cluster) = registry();
        for core in ["cpu0", "cpu1", "cpu2"] {
            registry.mark_examined(core, RunState::Running).unwrap();
        }
        let participants = Participants::select(&registry, &cluster).unwrap();

        let requested = "cpu2".to_string();
        assert_eq!(participants.initiator(Some(&requested)).unwrap().id, "cpu2");

        let outsider = "cpu9".to_string();
        assert_eq!(participants.initiator(Some(&outsider)).unwrap().id, "cpu0");
        assert_eq!(participants.initiator(None).unwrap().id, "cpu0");
    }

    #[test]
    fn test_skipped_bound_core_is_isolated() {
        let bench = testing::Bench::new(3, &[]);
        bench.registry.set_state("cpu2", RunState::Reset).unwrap();
        let cti2 = bench.registry.core("cpu2").unwrap().channel.unwrap();
        cti2.prepare_for_restart().unwrap();

        let participants = bench.participants();
        assert_eq!(participants.skipped, vec!["cpu2".to_string()]);
        assert_eq!(participants.stale_channels.len(), 1);

        participants.isolate_skipped();
        assert!(!cti2.is_restart_ready());
        assert_eq!(cti2.gate_state(Channel(0)), GateState::Gated);
        assert_eq!(cti2.gate_state(Channel(1)), GateState::Gated);
    }

    #[test]
    fn test_channels_reports_unbound() {
        let (registry, cluster) = registry();
        registry.mark_examined("cpu0", RunState::Running).unwrap();
        registry.mark_examined("cpu1", RunState::Running).unwrap();
        let participants = Participants::select(&registry, &cluster).unwrap();

        match participants.channels("c") {
            Err(RunControlError::MissingBinding { cores, .. }) => {
                assert_eq!(cores, vec!["cpu0".to_string(), "cpu1".to_string()]);
            }
            other => panic!("unexpected: {:?}", other.map(|c| c.len())),
        }
    }
}
