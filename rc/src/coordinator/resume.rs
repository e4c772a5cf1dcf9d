//! Group resume over the restart trigger channel

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::OperationContext;
use super::report::{GroupOp, OperationPath, OperationReport};
use crate::domain::RunState;
use crate::error::{Result, RunControlError};
use crate::notifier::EventNotifier;
use crate::poller::{ConvergencePoller, ConvergenceResult};
use crate::transport::CoreAccess;

/// Resume state machine phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePhase {
    Idle,
    RestoringBreakpoints,
    Preparing,
    Pulsed,
    Converging,
    Converged,
    TimedOut,
}

/// Report for a resume request on a cluster whose participants all run
pub(crate) fn noop_resume_report(ctx: &OperationContext<'_>) -> OperationReport {
    info!(op_id = %ctx.op_id, cluster = %ctx.cluster.id, "Cluster already running, nothing to resume");
    let participants = ctx.participants.ids();
    let convergence = ConvergenceResult::immediate(RunState::Running, &participants);
    OperationReport {
        op_id: ctx.op_id,
        cluster: ctx.cluster.id.clone(),
        op: GroupOp::Resume,
        path: OperationPath::AlreadyAtTarget,
        outcome: OperationReport::outcome_of(&convergence),
        participants,
        skipped: ctx.participants.skipped.clone(),
        initiator: None,
        convergence,
        event: None,
    }
}

/// Runs a cross-triggered group resume
pub struct ResumeCoordinator {
    access: Arc<dyn CoreAccess>,
    poller: Arc<ConvergencePoller>,
    notifier: Arc<EventNotifier>,
}

impl ResumeCoordinator {
    pub fn new(access: Arc<dyn CoreAccess>, poller: Arc<ConvergencePoller>, notifier: Arc<EventNotifier>) -> Self {
        Self {
            access,
            poller,
            notifier,
        }
    }

    fn enter(ctx: &OperationContext<'_>, phase: &mut ResumePhase, next: ResumePhase) {
        debug!(op_id = %ctx.op_id, cluster = %ctx.cluster.id, from = ?phase, to = ?next, "Resume phase");
        *phase = next;
    }

    /// Resume every participant with a single pulse from the initiator
    ///
    /// Breakpoints and watchpoints of every participant are restored before
    /// any gate is touched; a failed restoration aborts without a pulse.
    pub fn run(&self, ctx: &OperationContext<'_>) -> Result<OperationReport> {
        debug!(op_id = %ctx.op_id, cluster = %ctx.cluster.id, requested = ?ctx.requested, "ResumeCoordinator::run: called");
        let mut phase = ResumePhase::Idle;
        let participants = ctx.participants.ids();

        if ctx.participants.all_in(RunState::Running) {
            return Ok(noop_resume_report(ctx));
        }

        let channels = ctx.participants.channels(&ctx.cluster.id)?;
        let initiator = ctx
            .participants
            .initiator(ctx.requested)
            .ok_or_else(|| RunControlError::Config(format!("cluster {} has no participants", ctx.cluster.id)))?;
        let initiator_channel = initiator.channel.clone().ok_or_else(|| RunControlError::MissingBinding {
            cluster: ctx.cluster.id.clone(),
            cores: vec![initiator.id.clone()],
        })?;
        let restart_channel = ctx.cluster.channels.restart;

        Self::enter(ctx, &mut phase, ResumePhase::RestoringBreakpoints);
        for core in &participants {
            self.access.restore_debug_state(core)?;
        }

        Self::enter(ctx, &mut phase, ResumePhase::Preparing);
        ctx.participants.isolate_skipped();
        for channel in &channels {
            channel.prepare_for_restart()?;
            channel.acknowledge_stale_events()?;
        }

        Self::enter(ctx, &mut phase, ResumePhase::Pulsed);
        initiator_channel.pulse(restart_channel)?;

        Self::enter(ctx, &mut phase, ResumePhase::Converging);
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

        if convergence.overall_success() {
            Self::enter(ctx, &mut phase, ResumePhase::Converged);
        } else {
            warn!(
                op_id = %ctx.op_id,
                cluster = %ctx.cluster.id,
                timed_out = ?convergence.timed_out,
                elapsed_ms = convergence.elapsed_ms,
                "Group resume incomplete, gating left restart-ready"
            );
            Self::enter(ctx, &mut phase, ResumePhase::TimedOut);
        }

        Ok(OperationReport {
            op_id: ctx.op_id,
            cluster: ctx.cluster.id.clone(),
            op: GroupOp::Resume,
            path: OperationPath::CrossTriggered,
            outcome: OperationReport::outcome_of(&convergence),
            participants,
            skipped: ctx.participants.skipped.clone(),
            initiator: Some(initiator.id.clone()),
            convergence,
            event,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::coordinator::testing::Bench;
    use crate::coordinator::{HaltCoordinator, OperationOutcome, RepeatHaltPolicy};
    use crate::domain::StopReason;
    use crate::sim::SimOp;

    fn halted_bench(n: usize) -> Bench {
        let bench = Bench::new(n, &[]);
        let participants = bench.participants();
        HaltCoordinator::new(bench.poller.clone(), bench.notifier.clone(), RepeatHaltPolicy::Emit)
            .run(&bench.context(&participants, None), StopReason::HaltRequest)
            .unwrap();
        bench.sim.clear_ops();
        bench.sink.clear();
        bench
    }

    fn coordinator(bench: &Bench) -> ResumeCoordinator {
        ResumeCoordinator::new(bench.sim.clone(), bench.poller.clone(), bench.notifier.clone())
    }

    #[test]
    fn test_restore_before_any_gate_write() {
        let bench = halted_bench(3);
        bench.sim.set_restore_delay(Duration::from_millis(5));
        let participants = bench.participants();

        let report = coordinator(&bench).run(&bench.context(&participants, None)).unwrap();

        assert_eq!(report.outcome, OperationOutcome::Converged);
        let ops = bench.sim.ops();
        assert!(ops[..3].iter().all(|op| matches!(op, SimOp::Restore { .. })));
        assert!(ops[3..].iter().all(SimOp::is_fabric));
        assert_eq!(bench.sim.pulses().len(), 1);
        assert_eq!(bench.sink.runs().len(), 1);
        assert!(bench.sink.stops().is_empty());
    }

    #[test]
    fn test_acknowledge_precedes_pulse() {
        let bench = halted_bench(2);
        let participants = bench.participants();

        coordinator(&bench).run(&bench.context(&participants, None)).unwrap();

        let ops = bench.sim.ops();
        let pulse = ops.iter().position(|op| matches!(op, SimOp::Pulse { .. })).unwrap();
        let acks = ops[..pulse]
            .iter()
            .filter(|op| matches!(op, SimOp::Acknowledge { .. }))
            .count();
        assert_eq!(acks, 2);
        for core in ["cpu0", "cpu1"] {
            assert_eq!(bench.registry.state(core), Some(RunState::Running));
            assert!(!bench.registry.core(core).unwrap().stop_reported);
            assert!(bench.registry.core(core).unwrap().channel.unwrap().is_restart_ready());
        }
    }

    #[test]
    fn test_failed_restore_aborts_without_pulse() {
        let bench = halted_bench(2);
        bench.sim.fail_restore("cpu1");
        let participants = bench.participants();

        let err = coordinator(&bench).run(&bench.context(&participants, None)).unwrap_err();

        assert!(matches!(err, RunControlError::Transport(_)));
        assert!(bench.sim.fabric_ops().is_empty());
        assert!(bench.sink.events().is_empty());
    }

    #[test]
    fn test_resume_of_running_cluster_is_noop() {
        let bench = Bench::new(2, &[]);
        let participants = bench.participants();

        let report = coordinator(&bench).run(&bench.context(&participants, None)).unwrap();

        assert_eq!(report.path, OperationPath::AlreadyAtTarget);
        assert!(report.event.is_none());
        assert!(bench.sim.ops().is_empty());
    }
}
