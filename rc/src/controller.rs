//! Session entry point for coordinated run control
//!
//! `SmpController` owns the [`CoreRegistry`] and one lock per cluster. A halt
//! or resume request is resolved to its cluster, the cluster's participants
//! are selected, and the request is routed either to the cross-triggered
//! coordinators or to the [`FallbackPath`] depending on CTI coverage and the
//! configured [`FallbackPolicy`]. The cluster lock is held from selection
//! until the operation reaches a terminal state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::coordinator::{
    GroupOp, HaltCoordinator, OperationContext, OperationPath, OperationReport, Participants, ResumeCoordinator,
};
use crate::cti::{ChannelController, CtiBinding};
use crate::domain::{Cluster, ClusterId, CoreId, CoreStatus, PrimaryPolicy, RunState, StopReason};
use crate::error::{Result, RunControlError};
use crate::fallback::{FallbackPath, FallbackPolicy};
use crate::notifier::{EventNotifier, EventSink};
use crate::poller::{ConvergencePoller, ConvergenceResult};
use crate::registry::CoreRegistry;
use crate::transport::{CoreAccess, TriggerFabric};

/// What a halt or resume request addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// One core; its whole cluster follows and the core is the requested primary
    Core(CoreId),
    /// A whole cluster
    Cluster(ClusterId),
}

impl Target {
    pub fn core(id: impl Into<CoreId>) -> Self {
        Self::Core(id.into())
    }

    pub fn cluster(id: impl Into<ClusterId>) -> Self {
        Self::Cluster(id.into())
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Core(id) => write!(f, "core {}", id),
            Self::Cluster(id) => write!(f, "cluster {}", id),
        }
    }
}

/// Per-cluster operation lock and cancel flag
#[derive(Debug, Default)]
struct ClusterSlot {
    lock: Mutex<()>,
    cancel: AtomicBool,
}

enum Route {
    CrossTriggered,
    Sequential,
}

/// Top-level run-control coordinator for a debug session
pub struct SmpController {
    registry: CoreRegistry,
    slots: HashMap<ClusterId, ClusterSlot>,
    bindings: HashMap<CoreId, CtiBinding>,
    access: Arc<dyn CoreAccess>,
    fabric: Arc<dyn TriggerFabric>,
    notifier: Arc<EventNotifier>,
    halt: HaltCoordinator,
    resume: ResumeCoordinator,
    fallback: FallbackPath,
    fallback_policy: FallbackPolicy,
}

impl SmpController {
    /// Build a controller for every core and cluster in `config`
    ///
    /// Cores start unexamined; call [`SmpController::examine_all`] before
    /// issuing group operations.
    pub fn new(
        config: &Config,
        access: Arc<dyn CoreAccess>,
        fabric: Arc<dyn TriggerFabric>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        debug!(cores = config.cores.len(), clusters = config.clusters.len(), "SmpController::new: called");
        config.validate()?;

        let registry = CoreRegistry::new();
        let mut bindings = HashMap::new();
        for core in &config.cores {
            registry.register_core(core.name.clone())?;
            if let Some(binding) = core.binding() {
                bindings.insert(core.name.clone(), binding);
            }
        }
        let mut slots = HashMap::new();
        for cluster in &config.clusters {
            registry.register_cluster(cluster.to_cluster())?;
            slots.insert(cluster.name.clone(), ClusterSlot::default());
        }

        let poller = Arc::new(ConvergencePoller::new(access.clone(), config.poll.clone()));
        let notifier = Arc::new(EventNotifier::new(sink));

        Ok(Self {
            registry,
            slots,
            bindings,
            halt: HaltCoordinator::new(poller.clone(), notifier.clone(), config.repeat_halt),
            resume: ResumeCoordinator::new(access.clone(), poller.clone(), notifier.clone()),
            fallback: FallbackPath::new(access.clone(), poller, notifier.clone(), config.repeat_halt),
            access,
            fabric,
            notifier,
            fallback_policy: config.fallback_policy,
        })
    }

    pub fn registry(&self) -> &CoreRegistry {
        &self.registry
    }

    pub fn fallback_policy(&self) -> FallbackPolicy {
        self.fallback_policy
    }

    /// Examine one core, record its state and establish its channel binding
    ///
    /// A core that cannot be examined is marked Unavailable and left out of
    /// group operations until a later examination succeeds.
    pub fn examine(&self, core: &str) -> Result<RunState> {
        debug!(%core, "SmpController::examine: called");
        if self.registry.core(core).is_none() {
            return Err(RunControlError::UnknownCore(core.to_string()));
        }

        let state = match self.access.examine(core) {
            Ok(state) => state,
            Err(e) => {
                warn!(%core, error = %e, "Core examination failed, marking unavailable");
                self.registry.mark_unavailable(core)?;
                return Err(e.into());
            }
        };
        self.registry.mark_examined(core, state)?;

        let already_bound = self.registry.core(core).is_some_and(|c| c.has_binding());
        match self.bindings.get(core) {
            Some(binding) if !already_bound => {
                let roles = self
                    .registry
                    .cluster_of(core)
                    .and_then(|id| self.registry.cluster(&id))
                    .map(|c| c.channels)
                    .unwrap_or_default();
                let controller = ChannelController::new(core, binding.clone(), roles, self.fabric.clone());
                self.registry.bind_channel(core, Arc::new(controller))?;
                info!(%core, cti = %binding.name, halt = %roles.halt, restart = %roles.restart, "CTI binding established");
            }
            Some(_) => {}
            None => debug!(%core, "SmpController::examine: no CTI configured"),
        }
        Ok(state)
    }

    /// Examine every registered core; failures are reported per core
    pub fn examine_all(&self) -> Vec<(CoreId, Result<RunState>)> {
        debug!("SmpController::examine_all: called");
        self.registry
            .core_ids()
            .into_iter()
            .map(|core| {
                let result = self.examine(&core);
                (core, result)
            })
            .collect()
    }

    pub fn status(&self, core: &str) -> Result<CoreStatus> {
        self.registry.status(core)
    }

    /// Request abort of the operation in flight on `cluster`
    ///
    /// The poller observes the request between rounds; the operation then
    /// ends with outcome Cancelled and gating as prepared.
    pub fn cancel(&self, cluster: &str) -> Result<()> {
        info!(%cluster, "Cancel requested");
        self.slot(cluster)?.cancel.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn halt(&self, target: &Target) -> Result<OperationReport> {
        debug!(%target, "SmpController::halt: called");
        let (cluster, requested) = self.resolve(target)?;
        let slot = self.slot(&cluster)?;
        let _guard = Self::acquire(slot, &cluster)?;
        slot.cancel.store(false, Ordering::SeqCst);
        let cluster = self.snapshot(&cluster)?;
        self.halt_locked(&cluster, requested.as_ref(), StopReason::HaltRequest, &slot.cancel)
    }

    pub fn resume(&self, target: &Target) -> Result<OperationReport> {
        debug!(%target, "SmpController::resume: called");
        let (cluster, requested) = self.resolve(target)?;
        let slot = self.slot(&cluster)?;
        let _guard = Self::acquire(slot, &cluster)?;
        slot.cancel.store(false, Ordering::SeqCst);
        let cluster = self.snapshot(&cluster)?;
        self.resume_locked(&cluster, requested.as_ref(), &slot.cancel)
    }

    pub fn halt_core(&self, core: &str) -> Result<OperationReport> {
        self.halt(&Target::core(core))
    }

    pub fn halt_cluster(&self, cluster: &str) -> Result<OperationReport> {
        self.halt(&Target::cluster(cluster))
    }

    pub fn resume_core(&self, core: &str) -> Result<OperationReport> {
        self.resume(&Target::core(core))
    }

    pub fn resume_cluster(&self, cluster: &str) -> Result<OperationReport> {
        self.resume(&Target::cluster(cluster))
    }

    /// Look for cores that halted outside any coordinated operation
    ///
    /// Clusters with an operation in flight are skipped. A participant
    /// found Halted without a visible event halts the rest of its cluster,
    /// and the group stop is attributed to it with the reason reported by
    /// the transport.
    pub fn poll(&self) -> Result<Vec<OperationReport>> {
        debug!("SmpController::poll: called");
        let mut reports = Vec::new();
        for id in self.registry.cluster_ids() {
            let slot = self.slot(&id)?;
            let _guard = match slot.lock.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(e)) => e.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    debug!(cluster = %id, "SmpController::poll: operation in flight, skipping");
                    continue;
                }
            };
            slot.cancel.store(false, Ordering::SeqCst);

            let Some(stopped) = self.detect_async_halt(&id)? else {
                continue;
            };
            let reason = match self.access.stop_reason(&stopped)? {
                StopReason::Breakpoint => StopReason::Breakpoint,
                _ => StopReason::AsyncHalt,
            };
            info!(cluster = %id, core = %stopped, %reason, "Asynchronous halt detected");

            let mut cluster = self.snapshot(&id)?;
            // The core that stopped on its own is always the primary
            cluster.primary_policy = PrimaryPolicy::Requested;
            reports.push(self.async_halt_locked(&cluster, &stopped, reason, &slot.cancel)?);
        }
        Ok(reports)
    }

    /// Sample the cluster's participants; returns the first one halted without a visible event
    fn detect_async_halt(&self, cluster: &str) -> Result<Option<CoreId>> {
        let mut stopped = None;
        for core in self.registry.members(cluster)? {
            if !core.is_eligible() {
                continue;
            }
            let state = match self.access.read_state(&core.id) {
                Ok(state) => state,
                Err(e) => {
                    warn!(core = %core.id, error = %e, "Run-state sample failed");
                    continue;
                }
            };
            self.registry.set_state(&core.id, state)?;
            if state == RunState::Running {
                self.registry.set_stop_reported(&core.id, false)?;
            }
            if state == RunState::Halted && !core.stop_reported && stopped.is_none() {
                stopped = Some(core.id.clone());
            }
        }
        Ok(stopped)
    }

    fn async_halt_locked(
        &self,
        cluster: &Cluster,
        stopped: &CoreId,
        reason: StopReason,
        cancel: &AtomicBool,
    ) -> Result<OperationReport> {
        let participants = Participants::select(&self.registry, cluster)?;
        if !participants.all_in(RunState::Halted) {
            return self.halt_locked(cluster, Some(stopped), reason, cancel);
        }

        // Every participant already stopped; only the visible event is owed
        let op_id = Uuid::now_v7();
        let ids = participants.ids();
        let convergence = ConvergenceResult::immediate(RunState::Halted, &ids);
        let event = self
            .notifier
            .on_group_halt_converged(&self.registry, cluster, &convergence, Some(stopped), reason)?;
        Ok(OperationReport {
            op_id,
            cluster: cluster.id.clone(),
            op: GroupOp::Halt,
            path: OperationPath::AlreadyAtTarget,
            outcome: OperationReport::outcome_of(&convergence),
            participants: ids,
            skipped: participants.skipped,
            initiator: Some(stopped.clone()),
            convergence,
            event,
        })
    }

    fn halt_locked(
        &self,
        cluster: &Cluster,
        requested: Option<&CoreId>,
        reason: StopReason,
        cancel: &AtomicBool,
    ) -> Result<OperationReport> {
        let participants = self.participants(cluster)?;
        let ctx = self.context(cluster, &participants, requested, GroupOp::Halt, cancel);
        match self.route(cluster, &participants)? {
            Route::CrossTriggered => self.halt.run(&ctx, reason),
            Route::Sequential => self.fallback.halt(&ctx, reason),
        }
    }

    fn resume_locked(
        &self,
        cluster: &Cluster,
        requested: Option<&CoreId>,
        cancel: &AtomicBool,
    ) -> Result<OperationReport> {
        let participants = self.participants(cluster)?;
        let ctx = self.context(cluster, &participants, requested, GroupOp::Resume, cancel);
        match self.route(cluster, &participants)? {
            Route::CrossTriggered => self.resume.run(&ctx),
            Route::Sequential => self.fallback.resume(&ctx),
        }
    }

    fn participants(&self, cluster: &Cluster) -> Result<Participants> {
        let participants = Participants::select(&self.registry, cluster)?;
        if participants.is_empty() {
            return Err(RunControlError::Config(format!(
                "cluster {} has no examined cores to operate on",
                cluster.id
            )));
        }
        Ok(participants)
    }

    fn context<'a>(
        &'a self,
        cluster: &'a Cluster,
        participants: &'a Participants,
        requested: Option<&'a CoreId>,
        op: GroupOp,
        cancel: &'a AtomicBool,
    ) -> OperationContext<'a> {
        let op_id = Uuid::now_v7();
        info!(
            %op_id,
            cluster = %cluster.id,
            %op,
            ?requested,
            participants = ?participants.ids(),
            skipped = ?participants.skipped,
            "Group operation started"
        );
        OperationContext {
            op_id,
            registry: &self.registry,
            cluster,
            participants,
            requested,
            cancel,
        }
    }

    /// Pick the cross-triggered or sequential path before any hardware access
    fn route(&self, cluster: &Cluster, participants: &Participants) -> Result<Route> {
        let unbound = participants.unbound();
        if unbound.is_empty() {
            return Ok(Route::CrossTriggered);
        }
        match self.fallback_policy {
            FallbackPolicy::FailFast => {
                warn!(cluster = %cluster.id, unbound = ?unbound, "Refusing group operation without full CTI coverage");
                Err(RunControlError::MissingBinding {
                    cluster: cluster.id.clone(),
                    cores: unbound,
                })
            }
            FallbackPolicy::Sequential => {
                let reason = format!("no CTI binding for {}", unbound.join(", "));
                warn!(cluster = %cluster.id, %reason, "Fallback activated");
                Ok(Route::Sequential)
            }
        }
    }

    fn resolve(&self, target: &Target) -> Result<(ClusterId, Option<CoreId>)> {
        match target {
            Target::Core(core) => {
                if self.registry.core(core).is_none() {
                    return Err(RunControlError::UnknownCore(core.clone()));
                }
                let cluster = self
                    .registry
                    .cluster_of(core)
                    .ok_or_else(|| RunControlError::Config(format!("core {} does not belong to a cluster", core)))?;
                Ok((cluster, Some(core.clone())))
            }
            Target::Cluster(cluster) => {
                if self.registry.cluster(cluster).is_none() {
                    return Err(RunControlError::UnknownCluster(cluster.clone()));
                }
                Ok((cluster.clone(), None))
            }
        }
    }

    fn slot(&self, cluster: &str) -> Result<&ClusterSlot> {
        self.slots
            .get(cluster)
            .ok_or_else(|| RunControlError::UnknownCluster(cluster.to_string()))
    }

    fn snapshot(&self, cluster: &str) -> Result<Cluster> {
        self.registry
            .cluster(cluster)
            .ok_or_else(|| RunControlError::UnknownCluster(cluster.to_string()))
    }

    fn acquire<'a>(slot: &'a ClusterSlot, cluster: &str) -> Result<MutexGuard<'a, ()>> {
        match slot.lock.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(e)) => Ok(e.into_inner()),
            Err(TryLockError::WouldBlock) => {
                warn!(%cluster, "Rejecting request, cluster busy");
                Err(RunControlError::ClusterBusy {
                    cluster: cluster.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::RecordingSink;
    use crate::sim::SimTarget;

    fn setup(config: Config) -> (Arc<SimTarget>, Arc<RecordingSink>, SmpController) {
        let sim = Arc::new(SimTarget::from_config(&config));
        let sink = Arc::new(RecordingSink::new());
        let controller = SmpController::new(&config, sim.clone(), sim.clone(), sink.clone()).unwrap();
        (sim, sink, controller)
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = Config::default();
        config.clusters[0].members.push("ghost".to_string());
        let sim = Arc::new(SimTarget::new());
        let result = SmpController::new(&config, sim.clone(), sim, Arc::new(RecordingSink::new()));
        assert!(result.is_err_and(|e| e.is_config_error()));
    }

    #[test]
    fn test_examine_binds_channel() {
        let (_, _, controller) = setup(Config::default());
        assert_eq!(controller.examine("r5.cpu0").unwrap(), RunState::Running);

        let core = controller.registry().core("r5.cpu0").unwrap();
        assert!(core.examined);
        assert!(core.has_binding());
        assert!(controller.examine("nope").is_err());
    }

    #[test]
    fn test_failed_examine_marks_unavailable() {
        let (sim, _, controller) = setup(Config::default());
        sim.fail_examine("r5.cpu1");

        let results = controller.examine_all();
        assert!(results[0].1.is_ok());
        assert!(results[1].1.is_err());
        assert_eq!(controller.status("r5.cpu1").unwrap().run_state, RunState::Unavailable);
    }

    #[test]
    fn test_resolve_targets() {
        let (_, _, controller) = setup(Config::default());
        assert_eq!(
            controller.resolve(&Target::core("r5.cpu1")).unwrap(),
            ("r5".to_string(), Some("r5.cpu1".to_string()))
        );
        assert_eq!(controller.resolve(&Target::cluster("r5")).unwrap(), ("r5".to_string(), None));
        assert!(matches!(
            controller.resolve(&Target::cluster("a53")),
            Err(RunControlError::UnknownCluster(_))
        ));
    }

    #[test]
    fn test_busy_cluster_rejected() {
        let (_, _, controller) = setup(Config::default());
        controller.examine_all();

        let _held = controller.slots["r5"].lock.lock().unwrap();
        assert!(matches!(
            controller.halt_cluster("r5"),
            Err(RunControlError::ClusterBusy { .. })
        ));
        // poll leaves a busy cluster alone
        assert!(controller.poll().unwrap().is_empty());
    }

    #[test]
    fn test_no_participants_is_config_error() {
        let (_, _, controller) = setup(Config::default());
        let err = controller.halt_cluster("r5").unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("r5"));
    }

    #[test]
    fn test_cancel_unknown_cluster() {
        let (_, _, controller) = setup(Config::default());
        assert!(controller.cancel("r5").is_ok());
        assert!(controller.cancel("a53").is_err());
    }
}
