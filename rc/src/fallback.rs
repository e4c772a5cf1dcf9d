//! Sequential per-core halt/resume for clusters without full CTI coverage
//!
//! When a participant has no channel binding the cluster cannot be stopped
//! with one pulse. Depending on [`FallbackPolicy`] the controller either
//! refuses the request or drives each core through its own debug interface,
//! one after the other. Cores then stop at visibly different instants, but
//! the debug host still sees a single group event. The sequential path never
//! touches the trigger fabric.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::coordinator::{
    GroupOp, OperationContext, OperationPath, OperationReport, RepeatHaltPolicy, noop_resume_report,
    repeat_halt_report,
};
use crate::domain::{CoreId, RunState, StopReason};
use crate::error::{Result, RunControlError};
use crate::notifier::EventNotifier;
use crate::poller::ConvergencePoller;
use crate::transport::CoreAccess;

/// What to do when a cluster member lacks a CTI binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackPolicy {
    /// Refuse the operation, naming the unbound cores
    #[default]
    FailFast,
    /// Halt/resume each core in turn without cross-triggering
    Sequential,
}

impl std::fmt::Display for FallbackPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FailFast => write!(f, "fail-fast"),
            Self::Sequential => write!(f, "sequential"),
        }
    }
}

/// Legacy per-core run control
pub struct FallbackPath {
    access: Arc<dyn CoreAccess>,
    poller: Arc<ConvergencePoller>,
    notifier: Arc<EventNotifier>,
    repeat_halt: RepeatHaltPolicy,
}

impl FallbackPath {
    pub fn new(
        access: Arc<dyn CoreAccess>,
        poller: Arc<ConvergencePoller>,
        notifier: Arc<EventNotifier>,
        repeat_halt: RepeatHaltPolicy,
    ) -> Self {
        Self {
            access,
            poller,
            notifier,
            repeat_halt,
        }
    }

    /// Participants with the initiator first, then member order
    fn request_order(ctx: &OperationContext<'_>) -> Result<(CoreId, Vec<CoreId>)> {
        let initiator = ctx
            .participants
            .initiator(ctx.requested)
            .map(|c| c.id.clone())
            .ok_or_else(|| RunControlError::Config(format!("cluster {} has no participants", ctx.cluster.id)))?;
        let mut order = vec![initiator.clone()];
        order.extend(ctx.participants.ids().into_iter().filter(|c| *c != initiator));
        Ok((initiator, order))
    }

    /// Halt each participant in turn, then wait for all of them
    pub fn halt(&self, ctx: &OperationContext<'_>, reason: StopReason) -> Result<OperationReport> {
        debug!(op_id = %ctx.op_id, cluster = %ctx.cluster.id, %reason, "FallbackPath::halt: called");
        if ctx.participants.all_in(RunState::Halted) {
            return repeat_halt_report(ctx, &self.notifier, self.repeat_halt);
        }

        let (initiator, order) = Self::request_order(ctx)?;
        for core in &order {
            if ctx.registry.state(core) == Some(RunState::Halted) {
                debug!(%core, "FallbackPath::halt: already halted, skipping request");
                continue;
            }
            info!(op_id = %ctx.op_id, %core, "Sequential halt request");
            self.access.halt(core)?;
        }

        let participants = ctx.participants.ids();
        let convergence = self.poller.wait_for(
            ctx.registry,
            &participants,
            RunState::Halted,
            ctx.cluster.convergence_timeout,
            ctx.cancel,
        );
        for outcome in convergence.outcomes.iter().filter(|o| !o.reached_target) {
            ctx.registry.set_state(&outcome.core, outcome.final_state)?;
        }
        let event = self
            .notifier
            .on_group_halt_converged(ctx.registry, ctx.cluster, &convergence, ctx.requested, reason)?;

        Ok(OperationReport {
            op_id: ctx.op_id,
            cluster: ctx.cluster.id.clone(),
            op: GroupOp::Halt,
            path: OperationPath::Sequential,
            outcome: OperationReport::outcome_of(&convergence),
            participants,
            skipped: ctx.participants.skipped.clone(),
            initiator: Some(initiator),
            convergence,
            event,
        })
    }

    /// Restore every participant's debug state, then resume each in turn
    pub fn resume(&self, ctx: &OperationContext<'_>) -> Result<OperationReport> {
        debug!(op_id = %ctx.op_id, cluster = %ctx.cluster.id, "FallbackPath::resume: called");
        if ctx.participants.all_in(RunState::Running) {
            return Ok(noop_resume_report(ctx));
        }

        let (initiator, order) = Self::request_order(ctx)?;
        for core in &order {
            self.access.restore_debug_state(core)?;
        }
        for core in &order {
            if ctx.registry.state(core) == Some(RunState::Running) {
                continue;
            }
            info!(op_id = %ctx.op_id, %core, "Sequential resume request");
            self.access.resume(core)?;
        }

        let participants = ctx.participants.ids();
        let convergence = self.poller.wait_for(
            ctx.registry,
            &participants,
            RunState::Running,
            ctx.cluster.convergence_timeout,
            ctx.cancel,
        );
        for outcome in convergence.outcomes.iter().filter(|o| !o.reached_target) {
            ctx.registry.set_state(&outcome.core, outcome.final_state)?;
        }
        let event = self
            .notifier
            .on_group_resume_converged(ctx.registry, ctx.cluster, &convergence, ctx.requested)?;

        Ok(OperationReport {
            op_id: ctx.op_id,
            cluster: ctx.cluster.id.clone(),
            op: GroupOp::Resume,
            path: OperationPath::Sequential,
            outcome: OperationReport::outcome_of(&convergence),
            participants,
            skipped: ctx.participants.skipped.clone(),
            initiator: Some(initiator),
            convergence,
            event,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::OperationOutcome;
    use crate::coordinator::testing::Bench;
    use crate::sim::SimOp;

    fn fallback(bench: &Bench) -> FallbackPath {
        FallbackPath::new(
            bench.sim.clone(),
            bench.poller.clone(),
            bench.notifier.clone(),
            RepeatHaltPolicy::Emit,
        )
    }

    #[test]
    fn test_sequential_halt_requested_core_first() {
        let bench = Bench::new(3, &[0]);
        let participants = bench.participants();
        let requested = "cpu2".to_string();

        let report = fallback(&bench)
            .halt(&bench.context(&participants, Some(&requested)), StopReason::HaltRequest)
            .unwrap();

        assert_eq!(report.path, OperationPath::Sequential);
        assert_eq!(report.outcome, OperationOutcome::Converged);
        let halts: Vec<SimOp> = bench.sim.ops();
        assert_eq!(
            halts,
            vec![
                SimOp::Halt { core: "cpu2".into() },
                SimOp::Halt { core: "cpu0".into() },
                SimOp::Halt { core: "cpu1".into() },
            ]
        );
        let stops = bench.sink.stops();
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].primary(), "cpu2");
    }

    #[test]
    fn test_sequential_resume_never_touches_fabric() {
        let bench = Bench::new(2, &[1]);
        for core in ["cpu0", "cpu1"] {
            bench.registry.set_state(core, RunState::Halted).unwrap();
            bench.sim.set_state(core, RunState::Halted);
        }
        let participants = bench.participants();

        let report = fallback(&bench).resume(&bench.context(&participants, None)).unwrap();

        assert!(report.is_success());
        assert!(bench.sim.fabric_ops().is_empty());
        let ops = bench.sim.ops();
        let last_restore = ops.iter().rposition(|op| matches!(op, SimOp::Restore { .. })).unwrap();
        let first_resume = ops.iter().position(|op| matches!(op, SimOp::Resume { .. })).unwrap();
        assert!(last_restore < first_resume);
        assert_eq!(bench.sink.runs().len(), 1);
    }

    #[test]
    fn test_sequential_timeout_names_stuck_core() {
        let bench = Bench::new(2, &[1]);
        bench.sim.set_stuck("cpu1", true);
        let participants = bench.participants();

        let report = fallback(&bench)
            .halt(&bench.context(&participants, None), StopReason::HaltRequest)
            .unwrap();

        assert_eq!(report.outcome, OperationOutcome::TimedOut);
        assert_eq!(report.timed_out(), ["cpu1".to_string()]);
        assert_eq!(bench.sink.stops().len(), 1);
    }

    #[test]
    fn test_sequential_repeat_halt_uses_policy() {
        let bench = Bench::new(2, &[1]);
        for core in ["cpu0", "cpu1"] {
            bench.registry.set_state(core, RunState::Halted).unwrap();
        }
        let participants = bench.participants();
        let path = FallbackPath::new(
            bench.sim.clone(),
            bench.poller.clone(),
            bench.notifier.clone(),
            RepeatHaltPolicy::Suppress,
        );

        let report = path
            .halt(&bench.context(&participants, None), StopReason::HaltRequest)
            .unwrap();

        assert_eq!(report.path, OperationPath::AlreadyAtTarget);
        assert!(bench.sim.ops().is_empty());
        assert!(bench.sink.events().is_empty());
    }

    #[test]
    fn test_policy_serde() {
        let policy: FallbackPolicy = serde_yaml::from_str("sequential").unwrap();
        assert_eq!(policy, FallbackPolicy::Sequential);
        assert_eq!(FallbackPolicy::default(), FallbackPolicy::FailFast);
        assert_eq!(FallbackPolicy::FailFast.to_string(), "fail-fast");
    }
}
