//! # MQTT Integration Module
//!
//! The messaging channel of the device: one pub/sub session layered on top of the
//! network link, used to announce presence, publish the light level and receive
//! commands.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Topic layout, payload constants and QoS levels
//! ├── message_manager.rs  - Inbound message → Command decoding
//! └── mqtt_handler.rs     - Transport trait and the rumqttc session pump
//! ```
//!
//! ## Topics
//!
//! ```text
//! <prefix>                 retained CONNECTED / DISCONNECTED (last-will), exactly-once
//! <prefix>/lightlevel      retained current level, at-least-once
//! <prefix>/setlightlevel   subscribed, exactly-once, ASCII integer payload
//! <prefix>/getlightlevel   subscribed, at-most-once, payload ignored
//! ```
//!
//! ## Reconnect Policy
//!
//! The transport never retries by itself. A dropped session is reported to the
//! control loop, which schedules exactly one delayed `connect()`; attempts are
//! unbounded because a broker outage is not fatal to the device.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;

pub use config::Topics;
pub use message_manager::{Command, DecodeError};
pub use mqtt_handler::{MessageTransport, MqttHandler};
