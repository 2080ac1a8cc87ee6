//! Bridge between the Tello UDP command/telemetry protocol and WebSocket clients.
//!
//! The device speaks plain ASCII over two UDP ports: commands and their
//! responses on one, unsolicited telemetry on the other. The bridge exposes
//! both to any number of WebSocket peers as JSON events.

pub mod bridge;
pub mod codec;
pub mod command;
pub mod config;
pub mod error;
pub mod link;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod telemetry;
pub mod telemetry_channel;
pub mod ws;

pub use bridge::Bridge;
pub use command::{CommandChannel, CommandResult};
pub use config::BridgeConfig;
pub use error::CommandError;
pub use link::LinkState;
pub use protocol::ServerEvent;
pub use telemetry::TelemetryFrame;
