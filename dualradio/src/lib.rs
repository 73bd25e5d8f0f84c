#![cfg_attr(not(test), no_std)]

//! # dualradio
//!
//! Dual-radio coordination core for connected collar devices carrying both a
//! DA16200 Wi-Fi modem and a cellular LTE modem. The crate presents a single
//! logical MQTT transport backed by whichever radio is currently usable:
//!
//! - [`RadioMgr`] owns the active-radio decision and runs the cooperative
//!   switch state machine, reference-counted radio preparation and the sleep
//!   policy.
//! - [`WifiAt`] is the AT-command driver for the Wi-Fi modem: serialized
//!   transactions, pattern-matched responses, a shadow of the modem's
//!   externally visible state and the asynchronous event decoder.
//! - [`Fabric`] + [`MsgPool`] carry typed state-delta events and
//!   reference-counted message buffers between the two and the application.
//!
//! The crate is `no_std`; all waits are bounded through `embassy-time` and
//! all buffers through `heapless`. Hardware (serial link, cellular modem,
//! PMIC, UICR) is reached through traits so the core can run against
//! simulated modems in tests.

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

mod cellular;
mod config;
mod error;
mod fabric;
mod port;
mod rm;
mod types;
mod wifi;

pub use cellular::*;
pub use config::*;
pub use error::*;
pub use fabric::*;
pub use port::*;
pub use rm::*;
pub use types::*;
pub use wifi::*;

pub mod prelude {
    pub use crate::cellular::*;
    pub use crate::config::*;
    pub use crate::error::*;
    pub use crate::fabric::*;
    pub use crate::port::*;
    pub use crate::rm::*;
    pub use crate::types::*;
    pub use crate::wifi::*;
}
