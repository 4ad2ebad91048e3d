//! # Device Channel
//!
//! MQTT plumbing between the logger and the laser measuring device. The device
//! listens on a command topic for the literal `MEDIR` and answers on a result
//! topic with the measured distance in millimeters (or a text message when the
//! target is out of range).
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker address, topics, correlation mode
//! ├── message_manager.rs  - Inbound messages, command/result payload codec
//! └── mqtt_handler.rs     - Connection lifecycle worker and CommandChannel trait
//! ```
//!
//! ## Design Philosophy
//!
//! - **One connection at a time**: the channel never keeps two brokers or two
//!   client identities alive. Reconnecting tears the old link down first.
//! - **No automatic recovery**: connect failures and dropped links are reported
//!   and left for the user to retry.
//! - **Events, not callbacks**: everything the broker does becomes a
//!   `ChannelEvent` on an mpsc channel, consumed by the session's event loop.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;

pub use config::{CorrelationMode, MqttConfig, MqttServer};
pub use message_manager::{MQTTMessage, RequestToken};
pub use mqtt_handler::{
    ChannelError, ChannelEvent, CommandChannel, ConnectionEpoch, ConnectionStatus, LinkEvent,
    MqttChannel,
};
