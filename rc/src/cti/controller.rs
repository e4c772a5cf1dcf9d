//! Gate/ungate/pulse/acknowledge for one core's CTI binding

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error, info};

use super::channel::{CTI_CHANNEL_COUNT, Channel, ChannelRoles, CtiBinding, GateState};
use crate::domain::CoreId;
use crate::error::{Result, RunControlError};
use crate::transport::TriggerFabric;

/// Drives one core's binding to the trigger fabric
///
/// The controller caches the last gate state successfully written to each
/// channel. A failed write leaves the cache untouched, so the cache always
/// reflects what the hardware last acknowledged. The halt and restart
/// channels are never ungated at the same time: [`ChannelController::ungate`]
/// refuses with a protocol violation before touching hardware.
pub struct ChannelController {
    core: CoreId,
    binding: CtiBinding,
    roles: ChannelRoles,
    fabric: Arc<dyn TriggerFabric>,
    gates: Mutex<[GateState; CTI_CHANNEL_COUNT as usize]>,
}

impl std::fmt::Debug for ChannelController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelController")
            .field("core", &self.core)
            .field("binding", &self.binding)
            .field("roles", &self.roles)
            .field("gates", &self.gate_states())
            .finish()
    }
}

impl ChannelController {
    pub fn new(
        core: impl Into<CoreId>,
        binding: CtiBinding,
        roles: ChannelRoles,
        fabric: Arc<dyn TriggerFabric>,
    ) -> Self {
        let core = core.into();
        debug!(%core, cti = %binding.name, ?roles, "ChannelController::new: called");
        Self {
            core,
            binding,
            roles,
            fabric,
            gates: Mutex::new([GateState::Unknown; CTI_CHANNEL_COUNT as usize]),
        }
    }

    pub fn core(&self) -> &str {
        &self.core
    }

    pub fn binding(&self) -> &CtiBinding {
        &self.binding
    }

    pub fn roles(&self) -> ChannelRoles {
        self.roles
    }

    /// Last acknowledged gate state of a channel
    pub fn gate_state(&self, channel: Channel) -> GateState {
        self.gate_states().get(channel.index()).copied().unwrap_or_default()
    }

    fn gate_states(&self) -> [GateState; CTI_CHANNEL_COUNT as usize] {
        *self.gates.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_channel(&self, channel: Channel) -> Result<()> {
        if channel.is_valid() {
            Ok(())
        } else {
            Err(self.violation(format!("{} does not exist on {}", channel, self.binding.name)))
        }
    }

    fn violation(&self, detail: String) -> RunControlError {
        error!(core = %self.core, cti = %self.binding.name, %detail, "CTI protocol violation");
        RunControlError::ProtocolViolation {
            core: self.core.clone(),
            detail,
        }
    }

    fn write_gate(&self, channel: Channel, state: GateState) -> Result<()> {
        self.check_channel(channel)?;
        if self.gate_state(channel) == state {
            debug!(core = %self.core, %channel, %state, "ChannelController::write_gate: already in state, skipping");
            return Ok(());
        }

        self.fabric.set_gate(&self.binding, channel, state)?;
        self.gates.lock().unwrap_or_else(PoisonError::into_inner)[channel.index()] = state;
        info!(core = %self.core, cti = %self.binding.name, %channel, gate = %state, "CTI gate transition");
        Ok(())
    }

    /// Stop this core from taking part in `channel` broadcasts
    pub fn gate(&self, channel: Channel) -> Result<()> {
        debug!(core = %self.core, %channel, "ChannelController::gate: called");
        self.write_gate(channel, GateState::Gated)
    }

    /// Let this core take part in `channel` broadcasts
    pub fn ungate(&self, channel: Channel) -> Result<()> {
        debug!(core = %self.core, %channel, "ChannelController::ungate: called");
        self.check_channel(channel)?;
        if let Some(partner) = self.roles.partner(channel)
            && self.gate_state(partner) == GateState::Ungated
        {
            return Err(self.violation(format!("cannot ungate {} while {} is ungated", channel, partner)));
        }
        self.write_gate(channel, GateState::Ungated)
    }

    /// Broadcast one trigger event on `channel`
    pub fn pulse(&self, channel: Channel) -> Result<()> {
        debug!(core = %self.core, %channel, "ChannelController::pulse: called");
        self.check_channel(channel)?;
        self.fabric.pulse(&self.binding, channel)?;
        info!(core = %self.core, cti = %self.binding.name, %channel, "CTI pulse");
        Ok(())
    }

    /// Clear halt/restart events latched but not yet consumed
    pub fn acknowledge_stale_events(&self) -> Result<()> {
        debug!(core = %self.core, "ChannelController::acknowledge_stale_events: called");
        self.fabric.acknowledge(&self.binding)?;
        Ok(())
    }

    /// Gate restart, then ungate halt
    pub fn prepare_for_halt(&self) -> Result<()> {
        self.gate(self.roles.restart)?;
        self.ungate(self.roles.halt)
    }

    /// Gate halt, then ungate restart
    pub fn prepare_for_restart(&self) -> Result<()> {
        self.gate(self.roles.halt)?;
        self.ungate(self.roles.restart)
    }

    /// Gate both role channels so this core neither sends nor receives
    pub fn isolate(&self) -> Result<()> {
        debug!(core = %self.core, "ChannelController::isolate: called");
        self.gate(self.roles.halt)?;
        self.gate(self.roles.restart)
    }

    /// Whether the binding is in the halt-ready configuration
    pub fn is_halt_ready(&self) -> bool {
        self.gate_state(self.roles.halt) == GateState::Ungated && self.gate_state(self.roles.restart) == GateState::Gated
    }

    /// Whether the binding is in the restart-ready configuration
    pub fn is_restart_ready(&self) -> bool {
        self.gate_state(self.roles.restart) == GateState::Ungated && self.gate_state(self.roles.halt) == GateState::Gated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;

    #[derive(Default)]
    struct FakeFabric {
        writes: Mutex<Vec<(Channel, GateState)>>,
        pulses: Mutex<Vec<Channel>>,
        acks: Mutex<u32>,
        fail_gate: bool,
    }

    impl TriggerFabric for FakeFabric {
        fn set_gate(&self, cti: &CtiBinding, channel: Channel, state: GateState) -> std::result::Result<(), TransportError> {
            if self.fail_gate {
                return Err(TransportError::fatal(&cti.name, "gate", "no response"));
            }
            self.writes.lock().unwrap().push((channel, state));
            Ok(())
        }

        fn pulse(&self, _cti: &CtiBinding, channel: Channel) -> std::result::Result<(), TransportError> {
            self.pulses.lock().unwrap().push(channel);
            Ok(())
        }

        fn acknowledge(&self, _cti: &CtiBinding) -> std::result::Result<(), TransportError> {
            *self.acks.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn controller(fabric: Arc<FakeFabric>) -> ChannelController {
        ChannelController::new("r5.cpu0", CtiBinding::new("r5.cti0", 0x8000_8000), ChannelRoles::default(), fabric)
    }

    #[test]
    fn test_prepare_for_halt_gates_restart_first() {
        let fabric = Arc::new(FakeFabric::default());
        let ctl = controller(fabric.clone());

        ctl.prepare_for_halt().unwrap();

        let writes = fabric.writes.lock().unwrap().clone();
        assert_eq!(writes, vec![(Channel(1), GateState::Gated), (Channel(0), GateState::Ungated)]);
        assert!(ctl.is_halt_ready());
        assert!(!ctl.is_restart_ready());
    }

    #[test]
    fn test_switching_roles_never_ungates_both() {
        let fabric = Arc::new(FakeFabric::default());
        let ctl = controller(fabric.clone());

        ctl.prepare_for_halt().unwrap();
        ctl.prepare_for_restart().unwrap();

        let writes = fabric.writes.lock().unwrap().clone();
        assert_eq!(
            writes,
            vec![
                (Channel(1), GateState::Gated),
                (Channel(0), GateState::Ungated),
                (Channel(0), GateState::Gated),
                (Channel(1), GateState::Ungated),
            ]
        );
        assert!(ctl.is_restart_ready());
    }

    #[test]
    fn test_repeat_prepare_skips_hardware() {
        let fabric = Arc::new(FakeFabric::default());
        let ctl = controller(fabric.clone());

        ctl.prepare_for_halt().unwrap();
        ctl.prepare_for_halt().unwrap();

        assert_eq!(fabric.writes.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_ungate_with_partner_ungated_is_violation() {
        let fabric = Arc::new(FakeFabric::default());
        let ctl = controller(fabric.clone());

        ctl.prepare_for_halt().unwrap();
        let err = ctl.ungate(Channel(1)).unwrap_err();

        assert!(matches!(err, RunControlError::ProtocolViolation { .. }));
        assert_eq!(fabric.writes.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_isolate_gates_both_roles() {
        let fabric = Arc::new(FakeFabric::default());
        let ctl = controller(fabric.clone());

        ctl.prepare_for_restart().unwrap();
        ctl.isolate().unwrap();

        assert_eq!(ctl.gate_state(Channel(0)), GateState::Gated);
        assert_eq!(ctl.gate_state(Channel(1)), GateState::Gated);
        assert!(!ctl.is_halt_ready());
        assert!(!ctl.is_restart_ready());
        assert_eq!(fabric.writes.lock().unwrap().last(), Some(&(Channel(1), GateState::Gated)));
    }

    #[test]
    fn test_failed_gate_leaves_cache() {
        let fabric = Arc::new(FakeFabric {
            fail_gate: true,
            ..Default::default()
        });
        let ctl = controller(fabric);

        let err = ctl.gate(Channel(1)).unwrap_err();
        assert!(matches!(err, RunControlError::Transport(_)));
        assert_eq!(ctl.gate_state(Channel(1)), GateState::Unknown);
    }

    #[test]
    fn test_invalid_channel_rejected() {
        let fabric = Arc::new(FakeFabric::default());
        let ctl = controller(fabric.clone());

        assert!(ctl.pulse(Channel(9)).is_err());
        assert!(fabric.pulses.lock().unwrap().is_empty());
    }

    #[test]
    fn test_pulse_and_acknowledge_reach_fabric() {
        let fabric = Arc::new(FakeFabric::default());
        let ctl = controller(fabric.clone());

        ctl.pulse(Channel(0)).unwrap();
        ctl.acknowledge_stale_events().unwrap();

        assert_eq!(*fabric.pulses.lock().unwrap(), vec![Channel(0)]);
        assert_eq!(*fabric.acks.lock().unwrap(), 1);
    }
}
