//! Controller subsystem for the light node
//!
//! Everything the device does funnels through one control loop:
//!
//! 1. [`event`] - Notifications from link, channel, update receiver and timers
//! 2. [`control_loop`] - Startup sequencing and event handling
//!
//! # Architecture
//!
//! ```text
//! producers ──► mpsc queue ──► Controller ──► store / output / channel
//! ```
//!
//! The loop processes one event at a time to completion, so none of the device
//! state needs a lock.

pub mod control_loop;
pub mod event;

pub use control_loop::{ControlSettings, Controller, Exit};
pub use event::{event_channel, Event, EventReceiver, EventSender, RestartReason};

/// How far the device is from talking to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Disconnected,
    LinkUp,
    SessionUp,
}
