//! Group stop/run notification
//!
//! A coordinated operation changes the state of every participant, but the
//! debug host must see exactly one event per group transition. The
//! [`EventNotifier`] records every participant's new state in the registry
//! and emits a single [`GroupEvent`] through the [`EventSink`] attributed to
//! the cluster's primary core.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::{Cluster, ClusterId, CoreId, RunState, StopReason};
use crate::error::Result;
use crate::poller::ConvergenceResult;
use crate::registry::CoreRegistry;

/// The externally visible run-control events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum GroupEvent {
    /// The cluster stopped
    GroupStop {
        cluster: ClusterId,
        primary: CoreId,
        reason: StopReason,
        at: DateTime<Utc>,
    },
    /// The cluster is running again
    GroupRun {
        cluster: ClusterId,
        primary: CoreId,
        at: DateTime<Utc>,
    },
}

impl GroupEvent {
    pub fn cluster(&self) -> &str {
        match self {
            Self::GroupStop { cluster, .. } | Self::GroupRun { cluster, .. } => cluster,
        }
    }

    pub fn primary(&self) -> &str {
        match self {
            Self::GroupStop { primary, .. } | Self::GroupRun { primary, .. } => primary,
        }
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, Self::GroupStop { .. })
    }

    /// Event type name for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::GroupStop { .. } => "group-stop",
            Self::GroupRun { .. } => "group-run",
        }
    }
}

/// Receiver of group events, implemented by the debug-host protocol layer
pub trait EventSink: Send + Sync {
    fn emit(&self, event: GroupEvent);
}

/// Sink that keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<GroupEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<GroupEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn stops(&self) -> Vec<GroupEvent> {
        self.events().into_iter().filter(GroupEvent::is_stop).collect()
    }

    pub fn runs(&self) -> Vec<GroupEvent> {
        self.events().into_iter().filter(|e| !e.is_stop()).collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: GroupEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }
}

/// Sink that only logs events
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: GroupEvent) {
        info!(
            event_type = event.event_type(),
            cluster = event.cluster(),
            primary = event.primary(),
            "Group event"
        );
    }
}

/// Decides which single event a group operation produces
pub struct EventNotifier {
    sink: Arc<dyn EventSink>,
}

impl EventNotifier {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    fn choose_primary(cluster: &Cluster, requested: Option<&CoreId>, converged: &[CoreId]) -> Option<CoreId> {
        cluster.primary_policy.select(requested, converged).cloned()
    }

    /// Record a (possibly partial) group halt and emit one group stop
    ///
    /// Every converged core is marked Halted with its halt folded into the
    /// visible event. Returns the emitted event, or `None` when no core
    /// converged.
    pub fn on_group_halt_converged(
        &self,
        registry: &CoreRegistry,
        cluster: &Cluster,
        result: &ConvergenceResult,
        requested: Option<&CoreId>,
        reason: StopReason,
    ) -> Result<Option<GroupEvent>> {
        debug!(cluster = %cluster.id, ?requested, %reason, "EventNotifier::on_group_halt_converged: called");
        let converged: Vec<CoreId> = result.converged().cloned().collect();
        for core in &converged {
            registry.set_state(core, RunState::Halted)?;
            registry.set_stop_reported(core, true)?;
        }

        let Some(primary) = Self::choose_primary(cluster, requested, &converged) else {
            debug!(cluster = %cluster.id, "EventNotifier::on_group_halt_converged: nothing converged, no event");
            return Ok(None);
        };
        Ok(Some(self.emit_stop(registry, cluster, primary, reason)?))
    }

    /// Record that a fully halted cluster's stop is owed no further event
    ///
    /// Used when a repeat halt is answered silently; a later poll must not
    /// report the same stop as asynchronous.
    pub fn mark_stop_reported(&self, registry: &CoreRegistry, participants: &[CoreId]) -> Result<()> {
        for core in participants {
            registry.set_stop_reported(core, true)?;
        }
        Ok(())
    }

    /// Emit one group stop for a cluster already fully halted
    pub fn on_repeat_halt(
        &self,
        registry: &CoreRegistry,
        cluster: &Cluster,
        participants: &[CoreId],
        requested: Option<&CoreId>,
    ) -> Result<Option<GroupEvent>> {
        debug!(cluster = %cluster.id, ?requested, "EventNotifier::on_repeat_halt: called");
        self.mark_stop_reported(registry, participants)?;
        match Self::choose_primary(cluster, requested, participants) {
            Some(primary) => Ok(Some(self.emit_stop(registry, cluster, primary, StopReason::HaltRequest)?)),
            None => Ok(None),
        }
    }

    fn emit_stop(
        &self,
        registry: &CoreRegistry,
        cluster: &Cluster,
        primary: CoreId,
        reason: StopReason,
    ) -> Result<GroupEvent> {
        registry.set_last_stop_primary(&cluster.id, &primary)?;
        let event = GroupEvent::GroupStop {
            cluster: cluster.id.clone(),
            primary,
            reason,
            at: Utc::now(),
        };
        info!(cluster = %cluster.id, primary = event.primary(), %reason, "Group stop");
        self.sink.emit(event.clone());
        Ok(event)
    }

    /// Record a group resume and emit one group run if every participant runs
    ///
    /// Converged cores are marked Running and their stop-reported flags
    /// cleared. A partial resume emits nothing: the host keeps seeing the
    /// cluster stopped, and cores still halted stay reported. Never emits a
    /// stop event.
    pub fn on_group_resume_converged(
        &self,
        registry: &CoreRegistry,
        cluster: &Cluster,
        result: &ConvergenceResult,
        requested: Option<&CoreId>,
    ) -> Result<Option<GroupEvent>> {
        debug!(cluster = %cluster.id, ?requested, "EventNotifier::on_group_resume_converged: called");
        let converged: Vec<CoreId> = result.converged().cloned().collect();
        for core in &converged {
            registry.set_state(core, RunState::Running)?;
            registry.set_stop_reported(core, false)?;
        }

        if !result.overall_success() {
            debug!(
                cluster = %cluster.id,
                timed_out = ?result.timed_out,
                "EventNotifier::on_group_resume_converged: incomplete, no event"
            );
            return Ok(None);
        }
        let Some(primary) = Self::choose_primary(cluster, requested, &converged) else {
            debug!(cluster = %cluster.id, "EventNotifier::on_group_resume_converged: nothing converged, no event");
            return Ok(None);
        };
        let event = GroupEvent::GroupRun {
            cluster: cluster.id.clone(),
            primary,
            at: Utc::now(),
        };
        info!(cluster = %cluster.id, primary = event.primary(), "Group run");
        self.sink.emit(event.clone());
        Ok(Some(event))
    }
}
