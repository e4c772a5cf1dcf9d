//! Cross-trigger interface (CTI) channels
//!
//! Each core taking part in coordinated run control is bound to a CTI.
//! Two channels carry the triggers: one broadcasts halt requests, the other
//! broadcasts restart requests. Which physical channel plays which role is
//! SoC routing, so it is configured per cluster via [`ChannelRoles`].

mod channel;
mod controller;

pub use channel::{
    CTI_CHANNEL_COUNT, Channel, ChannelRoles, CtiBinding, DEFAULT_HALT_CHANNEL, DEFAULT_RESTART_CHANNEL, GateState,
};
pub use controller::ChannelController;
