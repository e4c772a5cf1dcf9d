//! In-process model of a core cluster and its cross-trigger fabric
//!
//! `SimTarget` implements both transport traits so the coordinators can be
//! driven without a debug probe. It models what the run-control layer can
//! observe: per-core run state, per-channel gates on each CTI (gated out of
//! reset), the halt event latch, and trigger domains.
//!
//! # Trigger model
//!
//! 1. `pulse` on a channel reaches every CTI in the pulser's trigger domain
//!    that has the channel ungated, the pulser included.
//! 2. An event on a CTI's halt channel requests a halt of its core and sets
//!    the halt latch until acknowledged.
//! 3. An event on the restart channel requests a restart. If the halt latch
//!    is still set the core re-halts at once and stays Halted.
//!
//! State changes become visible after the core's latency, counted in
//! `read_state` samples. Every access is appended to an ordered [`SimOp`]
//! log for ordering assertions.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::Config;
use crate::cti::{CTI_CHANNEL_COUNT, Channel, ChannelRoles, CtiBinding, GateState};
use crate::domain::{CoreId, RunState, StopReason};
use crate::error::TransportError;
use crate::transport::{CoreAccess, TriggerFabric};

/// One access observed by the simulated target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimOp {
    Gate { cti: String, channel: Channel },
    Ungate { cti: String, channel: Channel },
    Pulse { cti: String, channel: Channel },
    Acknowledge { cti: String },
    Halt { core: CoreId },
    Resume { core: CoreId },
    Restore { core: CoreId },
}

impl SimOp {
    /// Whether the access went to the trigger fabric
    pub fn is_fabric(&self) -> bool {
        matches!(
            self,
            Self::Gate { .. } | Self::Ungate { .. } | Self::Pulse { .. } | Self::Acknowledge { .. }
        )
    }
}

#[derive(Debug)]
struct SimCore {
    state: RunState,
    stop_reason: StopReason,
    /// Pending transition and the samples left before it shows
    pending: Option<(RunState, u32)>,
    latency: u32,
    stuck: bool,
    examine_fails: bool,
    transient_reads: u32,
}

#[derive(Debug)]
struct SimCti {
    core: CoreId,
    domain: u8,
    roles: ChannelRoles,
    gates: [GateState; CTI_CHANNEL_COUNT as usize],
    halt_latched: bool,
}

#[derive(Debug, Default)]
struct SimState {
    cores: HashMap<CoreId, SimCore>,
    order: Vec<CoreId>,
    ctis: HashMap<String, SimCti>,
    failing_pulse: bool,
    failing_gates: HashSet<String>,
    failing_restores: HashSet<CoreId>,
    restore_delay: Duration,
    ops: Vec<SimOp>,
}

impl SimState {
    fn core_mut(&mut self, core: &str, op: &'static str) -> Result<&mut SimCore, TransportError> {
        self.cores
            .get_mut(core)
            .ok_or_else(|| TransportError::fatal(core, op, "no such core"))
    }

    /// Start a transition, visible after the core's latency
    fn schedule(&mut self, core: &str, target: RunState, reason: StopReason) {
        let Some(sim) = self.cores.get_mut(core) else {
            return;
        };
        if sim.stuck || sim.state == RunState::Reset {
            debug!(%core, %target, "SimTarget: core ignores request");
            return;
        }
        if sim.latency == 0 {
            sim.state = target;
            sim.pending = None;
        } else {
            sim.pending = Some((target, sim.latency));
        }
        if target == RunState::Halted {
            sim.stop_reason = reason;
        }
    }

    fn deliver(&mut self, cti: &str, channel: Channel) {
        let Some(sim_cti) = self.ctis.get_mut(cti) else {
            return;
        };
        let core = sim_cti.core.clone();
        if channel == sim_cti.roles.halt {
            sim_cti.halt_latched = true;
            debug!(%cti, %core, "SimTarget: halt event delivered");
            self.schedule(&core, RunState::Halted, StopReason::HaltRequest);
        } else if channel == sim_cti.roles.restart {
            if sim_cti.halt_latched {
                info!(%cti, %core, "SimTarget: stale halt latch, core re-halts on restart");
                return;
            }
            debug!(%cti, %core, "SimTarget: restart event delivered");
            self.schedule(&core, RunState::Running, StopReason::HaltRequest);
        }
    }
}

/// Simulated multi-core target with a cross-trigger fabric
#[derive(Debug, Default)]
pub struct SimTarget {
    state: Mutex<SimState>,
}

impl SimTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a target with every configured core running and its CTI in reset state
    pub fn from_config(config: &Config) -> Self {
        let sim = Self::new();
        for core in &config.cores {
            let roles = config
                .clusters
                .iter()
                .find(|c| c.members.contains(&core.name))
                .map(|c| c.channels)
                .unwrap_or_default();
            sim.add_core_with_roles(&core.name, core.binding(), roles);
        }
        sim
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a running core, optionally wired to a CTI with the default channel roles
    pub fn add_core(&self, name: &str, cti: Option<CtiBinding>) {
        self.add_core_with_roles(name, cti, ChannelRoles::default());
    }

    pub fn add_core_with_roles(&self, name: &str, cti: Option<CtiBinding>, roles: ChannelRoles) {
        debug!(core = %name, cti = ?cti.as_ref().map(|c| &c.name), "SimTarget::add_core: called");
        let mut state = self.lock();
        if let Some(binding) = &cti {
            state.ctis.insert(
                binding.name.clone(),
                SimCti {
                    core: name.to_string(),
                    domain: binding.domain,
                    roles,
                    gates: [GateState::Gated; CTI_CHANNEL_COUNT as usize],
                    halt_latched: false,
                },
            );
        }
        state.order.push(name.to_string());
        state.cores.insert(
            name.to_string(),
            SimCore {
                state: RunState::Running,
                stop_reason: StopReason::HaltRequest,
                pending: None,
                latency: 0,
                stuck: false,
                examine_fails: false,
                transient_reads: 0,
            },
        );
    }

    /// Samples before a requested transition becomes visible
    pub fn set_latency(&self, core: &str, polls: u32) {
        if let Some(sim) = self.lock().cores.get_mut(core) {
            sim.latency = polls;
        }
    }

    /// A stuck core never changes state on request
    pub fn set_stuck(&self, core: &str, stuck: bool) {
        if let Some(sim) = self.lock().cores.get_mut(core) {
            sim.stuck = stuck;
        }
    }

    pub fn fail_examine(&self, core: &str) {
        if let Some(sim) = self.lock().cores.get_mut(core) {
            sim.examine_fails = true;
        }
    }

    /// The next `count` state reads of `core` fail transiently
    pub fn fail_reads(&self, core: &str, count: u32) {
        if let Some(sim) = self.lock().cores.get_mut(core) {
            sim.transient_reads = count;
        }
    }

    pub fn fail_pulse(&self, failing: bool) {
        self.lock().failing_pulse = failing;
    }

    pub fn fail_gate(&self, cti: &str) {
        self.lock().failing_gates.insert(cti.to_string());
    }

    pub fn fail_restore(&self, core: &str) {
        self.lock().failing_restores.insert(core.to_string());
    }

    pub fn set_restore_delay(&self, delay: Duration) {
        self.lock().restore_delay = delay;
    }

    /// Force a core's state outside any request
    pub fn set_state(&self, core: &str, run_state: RunState) {
        if let Some(sim) = self.lock().cores.get_mut(core) {
            sim.state = run_state;
            sim.pending = None;
        }
    }

    /// The core stops on a breakpoint on its own
    pub fn hit_breakpoint(&self, core: &str) {
        info!(%core, "SimTarget: breakpoint hit");
        if let Some(sim) = self.lock().cores.get_mut(core) {
            sim.state = RunState::Halted;
            sim.stop_reason = StopReason::Breakpoint;
            sim.pending = None;
        }
    }

    /// Current state without counting as a sample
    pub fn state(&self, core: &str) -> Option<RunState> {
        self.lock().cores.get(core).map(|c| c.state)
    }

    pub fn gate(&self, cti: &str, channel: Channel) -> Option<GateState> {
        self.lock()
            .ctis
            .get(cti)
            .and_then(|c| c.gates.get(channel.index()).copied())
    }

    pub fn is_halt_latched(&self, cti: &str) -> bool {
        self.lock().ctis.get(cti).is_some_and(|c| c.halt_latched)
    }

    pub fn core_ids(&self) -> Vec<CoreId> {
        self.lock().order.clone()
    }

    pub fn ops(&self) -> Vec<SimOp> {
        self.lock().ops.clone()
    }

    /// Fabric accesses only
    pub fn fabric_ops(&self) -> Vec<SimOp> {
        self.lock().ops.iter().filter(|op| op.is_fabric()).cloned().collect()
    }

    pub fn pulses(&self) -> Vec<SimOp> {
        self.lock()
            .ops
            .iter()
            .filter(|op| matches!(op, SimOp::Pulse { .. }))
            .cloned()
            .collect()
    }

    pub fn clear_ops(&self) {
        self.lock().ops.clear();
    }
}

impl CoreAccess for SimTarget {
    fn examine(&self, core: &str) -> Result<RunState, TransportError> {
        let mut state = self.lock();
        let sim = state.core_mut(core, "examine")?;
        if sim.examine_fails {
            return Err(TransportError::fatal(core, "examine", "debug port did not respond"));
        }
        Ok(sim.state)
    }

    fn read_state(&self, core: &str) -> Result<RunState, TransportError> {
        let mut state = self.lock();
        let sim = state.core_mut(core, "read-state")?;
        if sim.transient_reads > 0 {
            sim.transient_reads -= 1;
            return Err(TransportError::transient(core, "read-state", "access port busy"));
        }
        if let Some((target, left)) = sim.pending {
            if left <= 1 {
                sim.state = target;
                sim.pending = None;
            } else {
                sim.pending = Some((target, left - 1));
            }
        }
        Ok(sim.state)
    }

    fn stop_reason(&self, core: &str) -> Result<StopReason, TransportError> {
        let mut state = self.lock();
        Ok(state.core_mut(core, "stop-reason")?.stop_reason)
    }

    fn halt(&self, core: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.core_mut(core, "halt")?;
        state.ops.push(SimOp::Halt { core: core.to_string() });
        state.schedule(core, RunState::Halted, StopReason::HaltRequest);
        Ok(())
    }

    fn resume(&self, core: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.core_mut(core, "resume")?;
        state.ops.push(SimOp::Resume { core: core.to_string() });
        state.schedule(core, RunState::Running, StopReason::HaltRequest);
        Ok(())
    }

    fn restore_debug_state(&self, core: &str) -> Result<(), TransportError> {
        let delay = {
            let mut state = self.lock();
            state.core_mut(core, "restore")?;
            if state.failing_restores.contains(core) {
                return Err(TransportError::fatal(core, "restore", "breakpoint write rejected"));
            }
            state.restore_delay
        };
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        self.lock().ops.push(SimOp::Restore { core: core.to_string() });
        Ok(())
    }
}

impl TriggerFabric for SimTarget {
    fn set_gate(&self, cti: &CtiBinding, channel: Channel, gate: GateState) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.failing_gates.contains(&cti.name) {
            return Err(TransportError::fatal(&cti.name, "gate", "CTIGATE write failed"));
        }
        let sim_cti = state
            .ctis
            .get_mut(&cti.name)
            .ok_or_else(|| TransportError::fatal(&cti.name, "gate", "no such CTI"))?;
        let slot = sim_cti
            .gates
            .get_mut(channel.index())
            .ok_or_else(|| TransportError::fatal(&cti.name, "gate", format!("{} out of range", channel)))?;
        *slot = gate;
        let op = match gate {
            GateState::Ungated => SimOp::Ungate {
                cti: cti.name.clone(),
                channel,
            },
            _ => SimOp::Gate {
                cti: cti.name.clone(),
                channel,
            },
        };
        state.ops.push(op);
        Ok(())
    }

    fn pulse(&self, cti: &CtiBinding, channel: Channel) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.failing_pulse {
            return Err(TransportError::fatal(&cti.name, "pulse", "APPPULSE write failed"));
        }
        let domain = state
            .ctis
            .get(&cti.name)
            .map(|c| c.domain)
            .ok_or_else(|| TransportError::fatal(&cti.name, "pulse", "no such CTI"))?;
        state.ops.push(SimOp::Pulse {
            cti: cti.name.clone(),
            channel,
        });

        let mut receivers: Vec<String> = state
            .ctis
            .iter()
            .filter(|(_, c)| c.domain == domain && c.gates.get(channel.index()) == Some(&GateState::Ungated))
            .map(|(name, _)| name.clone())
            .collect();
        receivers.sort();
        debug!(cti = %cti.name, %channel, ?receivers, "SimTarget::pulse: broadcasting");
        for receiver in receivers {
            state.deliver(&receiver, channel);
        }
        Ok(())
    }

    fn acknowledge(&self, cti: &CtiBinding) -> Result<(), TransportError> {
        let mut state = self.lock();
        let sim_cti = state
            .ctis
            .get_mut(&cti.name)
            .ok_or_else(|| TransportError::fatal(&cti.name, "acknowledge", "no such CTI"))?;
        sim_cti.halt_latched = false;
        state.ops.push(SimOp::Acknowledge { cti: cti.name.clone() });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cti(name: &str) -> CtiBinding {
        CtiBinding::new(name, 0x8000_8000)
    }

    fn two_cores() -> SimTarget {
        let sim = SimTarget::new();
        sim.add_core("r5.cpu0", Some(cti("r5.cti0")));
        sim.add_core("r5.cpu1", Some(cti("r5.cti1")));
        sim
    }

    #[test]
    fn test_gates_start_gated() {
        let sim = two_cores();
        assert_eq!(sim.gate("r5.cti0", Channel(0)), Some(GateState::Gated));
        assert_eq!(sim.gate("r5.cti1", Channel(1)), Some(GateState::Gated));
    }

    #[test]
    fn test_pulse_reaches_only_ungated_ctis() {
        let sim = two_cores();
        sim.set_gate(&cti("r5.cti0"), Channel(0), GateState::Ungated).unwrap();
        sim.pulse(&cti("r5.cti0"), Channel(0)).unwrap();

        assert_eq!(sim.state("r5.cpu0"), Some(RunState::Halted));
        assert_eq!(sim.state("r5.cpu1"), Some(RunState::Running));
        assert!(sim.is_halt_latched("r5.cti0"));
    }

    #[test]
    fn test_pulse_stays_in_domain() {
        let sim = SimTarget::new();
        sim.add_core("a", Some(cti("cti.a")));
        let mut other = cti("cti.b");
        other.domain = 1;
        sim.add_core("b", Some(other.clone()));
        sim.set_gate(&cti("cti.a"), Channel(0), GateState::Ungated).unwrap();
        sim.set_gate(&other, Channel(0), GateState::Ungated).unwrap();

        sim.pulse(&cti("cti.a"), Channel(0)).unwrap();
        assert_eq!(sim.state("a"), Some(RunState::Halted));
        assert_eq!(sim.state("b"), Some(RunState::Running));
    }

    #[test]
    fn test_latency_counts_reads() {
        let sim = two_cores();
        sim.set_latency("r5.cpu0", 2);
        sim.halt("r5.cpu0").unwrap();

        assert_eq!(sim.read_state("r5.cpu0").unwrap(), RunState::Running);
        assert_eq!(sim.read_state("r5.cpu0").unwrap(), RunState::Halted);
    }

    #[test]
    fn test_unacknowledged_latch_rehalts() {
        let sim = two_cores();
        let binding = cti("r5.cti0");
        sim.set_gate(&binding, Channel(0), GateState::Ungated).unwrap();
        sim.pulse(&binding, Channel(0)).unwrap();
        sim.set_gate(&binding, Channel(0), GateState::Gated).unwrap();
        sim.set_gate(&binding, Channel(1), GateState::Ungated).unwrap();

        sim.pulse(&binding, Channel(1)).unwrap();
        assert_eq!(sim.state("r5.cpu0"), Some(RunState::Halted));

        sim.acknowledge(&binding).unwrap();
        sim.pulse(&binding, Channel(1)).unwrap();
        assert_eq!(sim.state("r5.cpu0"), Some(RunState::Running));
    }

    #[test]
    fn test_stuck_core_ignores_halt() {
        let sim = two_cores();
        sim.set_stuck("r5.cpu1", true);
        sim.halt("r5.cpu1").unwrap();
        assert_eq!(sim.read_state("r5.cpu1").unwrap(), RunState::Running);
    }

    #[test]
    fn test_fault_injection() {
        let sim = two_cores();
        sim.fail_examine("r5.cpu1");
        sim.fail_reads("r5.cpu0", 1);
        sim.fail_pulse(true);
        sim.fail_restore("r5.cpu0");

        assert!(sim.examine("r5.cpu1").is_err());
        assert!(sim.read_state("r5.cpu0").unwrap_err().is_transient());
        assert!(sim.read_state("r5.cpu0").is_ok());
        assert!(sim.pulse(&cti("r5.cti0"), Channel(0)).is_err());
        assert!(sim.restore_debug_state("r5.cpu0").is_err());
        assert!(sim.ops().is_empty());
    }

    #[test]
    fn test_breakpoint_sets_stop_reason() {
        let sim = two_cores();
        sim.hit_breakpoint("r5.cpu1");
        assert_eq!(sim.state("r5.cpu1"), Some(RunState::Halted));
        assert_eq!(sim.stop_reason("r5.cpu1").unwrap(), StopReason::Breakpoint);
    }

    #[test]
    fn test_op_log_order() {
        let sim = two_cores();
        sim.restore_debug_state("r5.cpu0").unwrap();
        sim.set_gate(&cti("r5.cti0"), Channel(1), GateState::Ungated).unwrap();
        sim.pulse(&cti("r5.cti0"), Channel(1)).unwrap();

        assert_eq!(
            sim.ops(),
            vec![
                SimOp::Restore {
                    core: "r5.cpu0".to_string()
                },
                SimOp::Ungate {
                    cti: "r5.cti0".to_string(),
                    channel: Channel(1)
                },
                SimOp::Pulse {
                    cti: "r5.cti0".to_string(),
                    channel: Channel(1)
                },
            ]
        );
        assert_eq!(sim.fabric_ops().len(), 2);
    }
}
