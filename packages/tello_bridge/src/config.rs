use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

// =============================================================================
// File config (figment-deserialized from defaults / TOML file / env vars)
// =============================================================================
//
//   bridge.toml:     [link]
//                    drop_threshold = 5
//
//   env var:         TELLO_LINK__DROP_THRESHOLD=5   (double underscore = nesting)

/// Floor for the reconnect backoff so an unreachable device is never hammered.
pub const MIN_RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub device: DeviceFileConfig,
    #[serde(default)]
    pub websocket: WebSocketFileConfig,
    #[serde(default)]
    pub link: LinkFileConfig,
}

/// Device addressing (lives under `[device]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceFileConfig {
    #[serde(default = "default_device_host")]
    pub host: String,
    #[serde(default = "default_device_port")]
    pub port: u16,
    /// Local address both UDP sockets bind to.
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    /// Local port of the command socket.
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    /// Local port the device sends telemetry to.
    #[serde(default = "default_telemetry_port")]
    pub telemetry_port: u16,
}

impl Default for DeviceFileConfig {
    fn default() -> Self {
        Self {
            host: default_device_host(),
            port: default_device_port(),
            bind_host: default_bind_host(),
            local_port: default_local_port(),
            telemetry_port: default_telemetry_port(),
        }
    }
}

/// WebSocket listener (lives under `[websocket]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebSocketFileConfig {
    #[serde(default = "default_ws_host")]
    pub host: String,
    #[serde(default = "default_ws_port")]
    pub port: u16,
    /// Outbound frames buffered per client before frames are dropped for it.
    #[serde(default = "default_client_buffer")]
    pub client_buffer: usize,
    /// Keepalive ping interval (0 disables).
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Seconds to wait for a pong after each ping before closing the client
    /// (0 disables).
    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,
}

impl Default for WebSocketFileConfig {
    fn default() -> Self {
        Self {
            host: default_ws_host(),
            port: default_ws_port(),
            client_buffer: default_client_buffer(),
            ping_interval_secs: default_ping_interval_secs(),
            pong_timeout_secs: default_pong_timeout_secs(),
        }
    }
}

/// Link supervision tunables (lives under `[link]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LinkFileConfig {
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    /// Consecutive command timeouts before the link is declared down.
    #[serde(default = "default_drop_threshold")]
    pub drop_threshold: u32,
    #[serde(default = "default_reconnect_min_ms")]
    pub reconnect_min_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    /// Command that puts the device into command mode.
    #[serde(default = "default_handshake_command")]
    pub handshake_command: String,
    /// Status query sent when the command path has been idle.
    #[serde(default = "default_probe_command")]
    pub probe_command: String,
}

impl Default for LinkFileConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: default_command_timeout_ms(),
            probe_interval_secs: default_probe_interval_secs(),
            drop_threshold: default_drop_threshold(),
            reconnect_min_ms: default_reconnect_min_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            handshake_command: default_handshake_command(),
            probe_command: default_probe_command(),
        }
    }
}

fn default_device_host() -> String {
    "192.168.10.1".to_string()
}
fn default_device_port() -> u16 {
    8889
}
fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}
fn default_local_port() -> u16 {
    9000
}
fn default_telemetry_port() -> u16 {
    8890
}
fn default_ws_host() -> String {
    "0.0.0.0".to_string()
}
fn default_ws_port() -> u16 {
    8765
}
fn default_client_buffer() -> usize {
    256
}
fn default_ping_interval_secs() -> u64 {
    30
}
fn default_pong_timeout_secs() -> u64 {
    10
}
fn default_command_timeout_ms() -> u64 {
    5000
}
fn default_probe_interval_secs() -> u64 {
    5
}
fn default_drop_threshold() -> u32 {
    3
}
fn default_reconnect_min_ms() -> u64 {
    2000
}
fn default_reconnect_max_ms() -> u64 {
    30_000
}
fn default_handshake_command() -> String {
    "command".to_string()
}
fn default_probe_command() -> String {
    "battery?".to_string()
}

/// Build a figment that layers: defaults → TOML file (if given) → TELLO_* env vars.
pub fn load_config(path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(FileConfig::default()));
    if let Some(path) = path {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed("TELLO_").split("__"))
}

/// Command-line values that take priority over the file config.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub device_host: Option<String>,
    pub device_port: Option<u16>,
    pub local_port: Option<u16>,
    pub telemetry_port: Option<u16>,
    pub ws_host: Option<String>,
    pub ws_port: Option<u16>,
}

impl Overrides {
    pub fn apply(self, fc: &mut FileConfig) {
        if let Some(host) = self.device_host {
            fc.device.host = host;
        }
        if let Some(port) = self.device_port {
            fc.device.port = port;
        }
        if let Some(port) = self.local_port {
            fc.device.local_port = port;
        }
        if let Some(port) = self.telemetry_port {
            fc.device.telemetry_port = port;
        }
        if let Some(host) = self.ws_host {
            fc.websocket.host = host;
        }
        if let Some(port) = self.ws_port {
            fc.websocket.port = port;
        }
    }
}

// =============================================================================
// Runtime config (resolved from FileConfig, handed to the bridge)
// =============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct BridgeConfig {
    /// Device command endpoint
    pub device_addr: SocketAddr,
    /// Local bind address of the command socket
    pub command_bind: SocketAddr,
    /// Local bind address of the telemetry socket
    pub telemetry_bind: SocketAddr,
    /// WebSocket listener address
    pub ws_addr: SocketAddr,
    pub command_timeout: Duration,
    pub probe_interval: Duration,
    pub drop_threshold: u32,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    pub handshake_command: String,
    pub probe_command: String,
    pub client_buffer: usize,
    /// None disables keepalive pings
    pub ping_interval: Option<Duration>,
    /// How long a client has to answer a ping. None never closes for it.
    pub pong_timeout: Option<Duration>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            device_addr: ([192, 168, 10, 1], 8889).into(),
            command_bind: ([0, 0, 0, 0], 9000).into(),
            telemetry_bind: ([0, 0, 0, 0], 8890).into(),
            ws_addr: ([0, 0, 0, 0], 8765).into(),
            command_timeout: Duration::from_millis(default_command_timeout_ms()),
            probe_interval: Duration::from_secs(default_probe_interval_secs()),
            drop_threshold: default_drop_threshold(),
            reconnect_min: Duration::from_millis(default_reconnect_min_ms()),
            reconnect_max: Duration::from_millis(default_reconnect_max_ms()),
            handshake_command: default_handshake_command(),
            probe_command: default_probe_command(),
            client_buffer: default_client_buffer(),
            ping_interval: Some(Duration::from_secs(default_ping_interval_secs())),
            pong_timeout: Some(Duration::from_secs(default_pong_timeout_secs())),
        }
    }
}

impl BridgeConfig {
    pub fn from_file(fc: &FileConfig) -> Result<Self> {
        let device_addr = socket_addr(&fc.device.host, fc.device.port)
            .context("Invalid device address")?;
        let command_bind = socket_addr(&fc.device.bind_host, fc.device.local_port)
            .context("Invalid command bind address")?;
        let telemetry_bind = socket_addr(&fc.device.bind_host, fc.device.telemetry_port)
            .context("Invalid telemetry bind address")?;
        let ws_addr = socket_addr(&fc.websocket.host, fc.websocket.port)
            .context("Invalid WebSocket address")?;

        let reconnect_min = Duration::from_millis(fc.link.reconnect_min_ms).max(MIN_RECONNECT_DELAY);
        let reconnect_max = Duration::from_millis(fc.link.reconnect_max_ms).max(reconnect_min);

        Ok(Self {
            device_addr,
            command_bind,
            telemetry_bind,
            ws_addr,
            command_timeout: Duration::from_millis(fc.link.command_timeout_ms.max(1)),
            probe_interval: Duration::from_secs(fc.link.probe_interval_secs.max(1)),
            drop_threshold: fc.link.drop_threshold.max(1),
            reconnect_min,
            reconnect_max,
            handshake_command: fc.link.handshake_command.clone(),
            probe_command: fc.link.probe_command.clone(),
            client_buffer: fc.websocket.client_buffer.max(1),
            ping_interval: optional_secs(fc.websocket.ping_interval_secs),
            pong_timeout: optional_secs(fc.websocket.pong_timeout_secs),
        })
    }
}

fn optional_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn socket_addr(host: &str, port: u16) -> Result<SocketAddr> {
    format!("{}:{}", host, port)
        .parse::<SocketAddr>()
        .with_context(|| format!("'{}:{}' is not an IP address and port", host, port))
}
