//! Channel numbers, role mapping and CTI bindings

use serde::{Deserialize, Serialize};

/// Number of channels on the cross-trigger matrix
pub const CTI_CHANNEL_COUNT: u8 = 4;

/// Channel carrying halt requests unless configured otherwise
pub const DEFAULT_HALT_CHANNEL: Channel = Channel(0);

/// Channel carrying restart requests unless configured otherwise
pub const DEFAULT_RESTART_CHANNEL: Channel = Channel(1);

/// A cross-trigger channel number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Channel(pub u8);

impl Channel {
    pub fn is_valid(&self) -> bool {
        self.0 < CTI_CHANNEL_COUNT
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// Gate state of one channel on one CTI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GateState {
    /// Not written since the binding was established
    #[default]
    Unknown,
    Gated,
    Ungated,
}

impl std::fmt::Display for GateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Gated => write!(f, "gated"),
            Self::Ungated => write!(f, "ungated"),
        }
    }
}

/// Role assignment of the halt and restart trigger channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRoles {
    #[serde(default = "default_halt_channel")]
    pub halt: Channel,

    #[serde(default = "default_restart_channel")]
    pub restart: Channel,
}

fn default_halt_channel() -> Channel {
    DEFAULT_HALT_CHANNEL
}

fn default_restart_channel() -> Channel {
    DEFAULT_RESTART_CHANNEL
}

impl Default for ChannelRoles {
    fn default() -> Self {
        Self {
            halt: DEFAULT_HALT_CHANNEL,
            restart: DEFAULT_RESTART_CHANNEL,
        }
    }
}

impl ChannelRoles {
    /// Check the mapping is usable on this fabric
    pub fn validate(&self) -> Result<(), String> {
        for (role, channel) in [("halt", self.halt), ("restart", self.restart)] {
            if !channel.is_valid() {
                return Err(format!(
                    "{} channel {} is out of range (fabric has {} channels)",
                    role, channel.0, CTI_CHANNEL_COUNT
                ));
            }
        }
        if self.halt == self.restart {
            return Err(format!("halt and restart are both mapped to channel {}", self.halt.0));
        }
        Ok(())
    }

    /// The other channel of the pair, if `channel` has a role
    pub fn partner(&self, channel: Channel) -> Option<Channel> {
        if channel == self.halt {
            Some(self.restart)
        } else if channel == self.restart {
            Some(self.halt)
        } else {
            None
        }
    }
}

/// Where a core's CTI lives on the debug bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtiBinding {
    /// CTI instance name (e.g. `r5.cti0`)
    pub name: String,

    /// Base address on the debug access port
    #[serde(default)]
    pub base: u64,

    /// Trigger domain; pulses only reach CTIs in the same domain
    #[serde(default)]
    pub domain: u8,
}

impl CtiBinding {
    pub fn new(name: impl Into<String>, base: u64) -> Self {
        Self {
            name: name.into(),
            base,
            domain: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_roles() {
        let roles = ChannelRoles::default();
        assert_eq!(roles.halt, Channel(0));
        assert_eq!(roles.restart, Channel(1));
        assert!(roles.validate().is_ok());
    }

    #[test]
    fn test_roles_reject_same_channel() {
        let roles = ChannelRoles {
            halt: Channel(2),
            restart: Channel(2),
        };
        let err = roles.validate().unwrap_err();
        assert!(err.contains("channel 2"));
    }

    #[test]
    fn test_roles_reject_out_of_range() {
        let roles = ChannelRoles {
            halt: Channel(0),
            restart: Channel(7),
        };
        let err = roles.validate().unwrap_err();
        assert!(err.contains("restart"));
        assert!(err.contains("out of range"));
    }

    #[test]
    fn test_partner() {
        let roles = ChannelRoles {
            halt: Channel(2),
            restart: Channel(3),
        };
        assert_eq!(roles.partner(Channel(2)), Some(Channel(3)));
        assert_eq!(roles.partner(Channel(3)), Some(Channel(2)));
        assert_eq!(roles.partner(Channel(0)), None);
    }

    #[test]
    fn test_roles_deserialize_with_defaults() {
        let roles: ChannelRoles = serde_yaml::from_str("restart: 3").unwrap();
        assert_eq!(roles.halt, DEFAULT_HALT_CHANNEL);
        assert_eq!(roles.restart, Channel(3));
    }

    #[test]
    fn test_binding_deserialize() {
        let binding: CtiBinding = serde_yaml::from_str("name: r5.cti0\nbase: 0x80008000").unwrap();
        assert_eq!(binding.name, "r5.cti0");
        assert_eq!(binding.base, 0x8000_8000);
        assert_eq!(binding.domain, 0);
    }
}
