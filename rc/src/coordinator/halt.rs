//! Group halt over the halt trigger channel

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::OperationContext;
use super::report::{GroupOp, OperationPath, OperationReport};
use crate::domain::{RunState, StopReason};
use crate::error::{Result, RunControlError};
use crate::notifier::EventNotifier;
use crate::poller::{ConvergencePoller, ConvergenceResult};

/// What a halt on an already fully halted cluster reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RepeatHaltPolicy {
    /// Emit one group stop so the host's halt request gets its answer
    #[default]
    Emit,
    /// Treat the request as a silent no-op
    Suppress,
}

/// Halt state machine phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltPhase {
    Idle,
    Preparing,
    Pulsed,
    Converging,
    Converged,
    TimedOut,
}

/// Report for a halt request on a cluster whose participants are all halted
///
/// No hardware is touched. Whether the host still gets a group stop is
/// decided by `policy`.
pub(crate) fn repeat_halt_report(
    ctx: &OperationContext<'_>,
    notifier: &EventNotifier,
    policy: RepeatHaltPolicy,
) -> Result<OperationReport> {
    info!(op_id = %ctx.op_id, cluster = %ctx.cluster.id, ?policy, "Cluster already halted, no pulse issued");
    let participants = ctx.participants.ids();
    let convergence = ConvergenceResult::immediate(RunState::Halted, &participants);
    let event = match policy {
        RepeatHaltPolicy::Emit => notifier.on_repeat_halt(ctx.registry, ctx.cluster, &participants, ctx.requested)?,
        RepeatHaltPolicy::Suppress => {
            notifier.mark_stop_reported(ctx.registry, &participants)?;
            None
        }
    };
    Ok(OperationReport {
        op_id: ctx.op_id,
        cluster: ctx.cluster.id.clone(),
        op: GroupOp::Halt,
        path: OperationPath::AlreadyAtTarget,
        outcome: OperationReport::outcome_of(&convergence),
        participants,
        skipped: ctx.participants.skipped.clone(),
        initiator: None,
        convergence,
        event,
    })
}

/// Runs a cross-triggered group halt
pub struct HaltCoordinator {
    poller: Arc<ConvergencePoller>,
    notifier: Arc<EventNotifier>,
    repeat_halt: RepeatHaltPolicy,
}

impl HaltCoordinator {
    pub fn new(poller: Arc<ConvergencePoller>, notifier: Arc<EventNotifier>, repeat_halt: RepeatHaltPolicy) -> Self {
        Self {
            poller,
            notifier,
            repeat_halt,
        }
    }

    fn enter(ctx: &OperationContext<'_>, phase: &mut HaltPhase, next: HaltPhase) {
        debug!(op_id = %ctx.op_id, cluster = %ctx.cluster.id, from = ?phase, to = ?next, "Halt phase");
        *phase = next;
    }

    /// Halt every participant with a single pulse from the initiator
    ///
    /// A transport failure while preparing or pulsing aborts the operation
    /// with gating left as last applied. A convergence timeout is not an
    /// error: the report lists the cores that did not halt, and gating stays
    /// halt-ready so a retry needs no preparation.
    pub fn run(&self, ctx: &OperationContext<'_>, reason: StopReason) -> Result<OperationReport> {
        debug!(op_id = %ctx.op_id, cluster = %ctx.cluster.id, requested = ?ctx.requested, %reason, "HaltCoordinator::run: called");
        let mut phase = HaltPhase::Idle;
        let participants = ctx.participants.ids();

        if ctx.participants.all_in(RunState::Halted) {
            return repeat_halt_report(ctx, &self.notifier, self.repeat_halt);
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
        let halt_channel = ctx.cluster.channels.halt;

        Self::enter(ctx, &mut phase, HaltPhase::Preparing);
        ctx.participants.isolate_skipped();
        for channel in &channels {
            channel.prepare_for_halt()?;
        }

        Self::enter(ctx, &mut phase, HaltPhase::Pulsed);
        initiator_channel.pulse(halt_channel)?;

        Self::enter(ctx, &mut phase, HaltPhase::Converging);
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

        if convergence.overall_success() {
            Self::enter(ctx, &mut phase, HaltPhase::Converged);
        } else {
            warn!(
                op_id = %ctx.op_id,
                cluster = %ctx.cluster.id,
                timed_out = ?convergence.timed_out,
                elapsed_ms = convergence.elapsed_ms,
                "Group halt incomplete, gating left halt-ready"
            );
            Self::enter(ctx, &mut phase, HaltPhase::TimedOut);
        }

        Ok(OperationReport {
            op_id: ctx.op_id,
            cluster: ctx.cluster.id.clone(),
            op: GroupOp::Halt,
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
