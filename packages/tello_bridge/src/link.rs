//! Link supervision.
//!
//! The supervisor owns both UDP sockets. It opens them, puts the device into
//! command mode, watches command health, and tears everything down and
//! reconnects with backoff when the device stops answering.
//!
//! ```text
//! DISCONNECTED ──open sockets──▶ CONNECTING ──handshake ok──▶ CONNECTED
//!       ▲                              │                          │
//!       └────── handshake failed ──────┘     socket error / N timeouts /
//!       └──────────────────────────────────── probe timeout ──────┘
//! ```

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::{ChannelSignal, CommandChannel};
use crate::config::{BridgeConfig, MIN_RECONNECT_DELAY};
use crate::error::CommandError;
use crate::metrics::BridgeMetrics;
use crate::registry::ClientRegistry;
use crate::telemetry_channel::TelemetryChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
        };
        f.write_str(s)
    }
}

/// Read side of the link: current state plus the live command channel.
///
/// Only the supervisor mutates either; everyone else observes.
#[derive(Clone)]
pub struct LinkHandle {
    state: watch::Receiver<LinkState>,
    channel: Arc<RwLock<Option<Arc<CommandChannel>>>>,
}

impl LinkHandle {
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// Wait until the link reaches `target`. Returns false if the supervisor is gone.
    pub async fn wait_for(&self, target: LinkState) -> bool {
        let mut rx = self.state.clone();
        rx.wait_for(|s| *s == target).await.is_ok()
    }

    /// The command channel, but only while the link is connected and the
    /// channel still admits commands.
    pub async fn command_channel(&self) -> Option<Arc<CommandChannel>> {
        if self.state() != LinkState::Connected {
            return None;
        }
        self.channel.read().await.clone().filter(|c| c.is_open())
    }
}

/// Why a connected link was torn down.
#[derive(Debug, thiserror::Error)]
enum LinkDrop {
    #[error("socket error: {0}")]
    Socket(String),
    #[error("{0} consecutive command timeouts")]
    Timeouts(u32),
    #[error("liveness probe timed out")]
    ProbeTimeout,
    #[error("bridge stopping")]
    Stopped,
}

/// Both sockets of one connection attempt.
struct Session {
    command: Arc<CommandChannel>,
    telemetry: TelemetryChannel,
}

impl Session {
    async fn close(self) {
        self.command.close().await;
        self.telemetry.close().await;
    }
}

pub struct LinkSupervisor {
    config: Arc<BridgeConfig>,
    registry: Arc<ClientRegistry>,
    metrics: Arc<BridgeMetrics>,
    state: watch::Sender<LinkState>,
    channel: Arc<RwLock<Option<Arc<CommandChannel>>>>,
    cancel: CancellationToken,
}

impl LinkSupervisor {
    pub fn new(
        config: Arc<BridgeConfig>,
        registry: Arc<ClientRegistry>,
        metrics: Arc<BridgeMetrics>,
        cancel: CancellationToken,
    ) -> (Self, LinkHandle) {
        let (state, state_rx) = watch::channel(LinkState::Disconnected);
        let channel = Arc::new(RwLock::new(None));
        let handle = LinkHandle {
            state: state_rx,
            channel: channel.clone(),
        };
        (
            Self {
                config,
                registry,
                metrics,
                state,
                channel,
                cancel,
            },
            handle,
        )
    }

    fn set_state(&self, next: LinkState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            info!("Link {} -> {}", prev, next);
        }
    }

    /// Run until cancelled. Both sockets are released before this returns.
    pub async fn run(self) {
        let mut backoff = self.config.reconnect_min.max(MIN_RECONNECT_DELAY);

        while !self.cancel.is_cancelled() {
            self.set_state(LinkState::Connecting);
            self.metrics.reconnect_attempt();

            let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
            match self.open_session(signal_tx).await {
                Ok(session) => {
                    if self.handshake(&session.command).await {
                        backoff = self.config.reconnect_min.max(MIN_RECONNECT_DELAY);
                        *self.channel.write().await = Some(session.command.clone());
                        self.set_state(LinkState::Connected);

                        match self.monitor(&session.command, &mut signal_rx).await {
                            LinkDrop::Stopped => {}
                            reason => {
                                warn!("Link to {} lost: {}", self.config.device_addr, reason);
                                self.metrics.link_dropped();
                            }
                        }
                    }
                    self.set_state(LinkState::Disconnected);
                    self.channel.write().await.take();
                    session.close().await;
                }
                Err(e) => {
                    warn!("{:#}", e);
                    self.set_state(LinkState::Disconnected);
                }
            }

            if self.cancel.is_cancelled() {
                break;
            }
            info!("Reconnecting in {:?}", backoff);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.config.reconnect_max.max(MIN_RECONNECT_DELAY));
        }

        self.set_state(LinkState::Disconnected);
        info!("Link supervisor stopped");
    }

    async fn open_session(&self, signals: mpsc::UnboundedSender<ChannelSignal>) -> Result<Session> {
        let session_cancel = self.cancel.child_token();
        let command = CommandChannel::bind(
            self.config.command_bind,
            self.config.device_addr,
            self.config.command_timeout,
            self.config.drop_threshold,
            signals,
            session_cancel.clone(),
        )
        .await
        .with_context(|| format!("Failed to bind command socket on {}", self.config.command_bind))?;

        let telemetry = TelemetryChannel::bind(
            self.config.telemetry_bind,
            self.registry.clone(),
            self.metrics.clone(),
            session_cancel,
        )
        .await
        .with_context(|| {
            format!(
                "Failed to bind telemetry socket on {}",
                self.config.telemetry_bind
            )
        })?;

        Ok(Session {
            command: Arc::new(command),
            telemetry,
        })
    }

    /// Enter command mode. The device answers "ok" when it accepts.
    async fn handshake(&self, channel: &CommandChannel) -> bool {
        let result = channel.submit(&self.config.handshake_command).await;
        if result.success && result.raw.trim().eq_ignore_ascii_case("ok") {
            info!("Device at {} entered command mode", self.config.device_addr);
            true
        } else {
            warn!(
                "Handshake {:?} failed: {}",
                self.config.handshake_command, result.raw
            );
            false
        }
    }

    async fn monitor(
        &self,
        channel: &CommandChannel,
        signals: &mut mpsc::UnboundedReceiver<ChannelSignal>,
    ) -> LinkDrop {
        let threshold = self.config.drop_threshold.max(1);

        let mut probe = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.probe_interval,
            self.config.probe_interval,
        );
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return LinkDrop::Stopped,
                signal = signals.recv() => match signal {
                    Some(ChannelSignal::Response) => {}
                    Some(ChannelSignal::Timeout { consecutive }) => {
                        debug!("Command timeout {}/{}", consecutive, threshold);
                        // The channel has already stopped admitting commands.
                        if consecutive >= threshold || !channel.is_open() {
                            return LinkDrop::Timeouts(consecutive);
                        }
                    }
                    Some(ChannelSignal::SocketError(e)) => return LinkDrop::Socket(e),
                    None => return LinkDrop::Socket("command channel closed".into()),
                },
                _ = probe.tick() => {
                    if channel.idle_for() < self.config.probe_interval || channel.in_flight().is_some() {
                        continue;
                    }
                    let result = channel.probe(&self.config.probe_command).await;
                    match result.error {
                        None => debug!("Probe {:?} -> {:?}", self.config.probe_command, result.raw),
                        Some(CommandError::Timeout { .. }) => return LinkDrop::ProbeTimeout,
                        Some(CommandError::SocketError(e)) => return LinkDrop::Socket(e),
                        Some(e) => debug!("Probe skipped: {}", e),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::net::UdpSocket;

    /// Fake device: answers "ok" to everything while `responsive` is set.
    async fn spawn_device(responsive: Arc<AtomicBool>) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            while let Ok((_, from)) = socket.recv_from(&mut buf).await {
                if responsive.load(Ordering::SeqCst) {
                    let _ = socket.send_to(b"ok", from).await;
                }
            }
        });
        addr
    }

    fn test_config(device_addr: SocketAddr) -> BridgeConfig {
        BridgeConfig {
            device_addr,
            command_bind: "127.0.0.1:0".parse().unwrap(),
            telemetry_bind: "127.0.0.1:0".parse().unwrap(),
            command_timeout: Duration::from_millis(100),
            probe_interval: Duration::from_secs(60),
            drop_threshold: 3,
            reconnect_min: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(1),
            ..Default::default()
        }
    }

    fn start(config: BridgeConfig) -> (LinkHandle, CancellationToken, tokio::task::JoinHandle<()>) {
        let cancel = CancellationToken::new();
        let (supervisor, handle) = LinkSupervisor::new(
            Arc::new(config),
            Arc::new(ClientRegistry::new()),
            Arc::new(BridgeMetrics::new()),
            cancel.clone(),
        );
        let task = tokio::spawn(supervisor.run());
        (handle, cancel, task)
    }

    async fn wait(handle: &LinkHandle, state: LinkState) {
        tokio::time::timeout(Duration::from_secs(5), handle.wait_for(state))
            .await
            .expect("link state not reached");
    }

    #[tokio::test]
    async fn test_connects_after_handshake() {
        let device = spawn_device(Arc::new(AtomicBool::new(true))).await;
        let (handle, cancel, task) = start(test_config(device));

        wait(&handle, LinkState::Connected).await;
        let channel = handle.command_channel().await.unwrap();
        assert!(channel.submit("takeoff").await.success);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(handle.state(), LinkState::Disconnected);
        assert!(handle.command_channel().await.is_none());
    }

    #[tokio::test]
    async fn test_unresponsive_device_never_connects() {
        let device = spawn_device(Arc::new(AtomicBool::new(false))).await;
        let (handle, cancel, task) = start(test_config(device));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_ne!(handle.state(), LinkState::Connected);
        assert!(handle.command_channel().await.is_none());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_consecutive_timeouts_drop_link() {
        let responsive = Arc::new(AtomicBool::new(true));
        let device = spawn_device(responsive.clone()).await;
        let (handle, cancel, task) = start(test_config(device));
        wait(&handle, LinkState::Connected).await;

        let channel = handle.command_channel().await.unwrap();
        responsive.store(false, Ordering::SeqCst);
        for _ in 0..3 {
            assert_eq!(channel.submit("forward 20").await.reason(), Some("Timeout"));
        }
        // No window between the last timeout and teardown.
        assert_eq!(channel.submit("land").await.reason(), Some("NotConnected"));
        assert!(handle.command_channel().await.is_none());
        wait(&handle, LinkState::Disconnected).await;
        assert!(handle.command_channel().await.is_none());

        // Device comes back; the supervisor reconnects after its backoff.
        responsive.store(true, Ordering::SeqCst);
        wait(&handle, LinkState::Connected).await;

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeouts_below_threshold_keep_link() {
        let responsive = Arc::new(AtomicBool::new(true));
        let device = spawn_device(responsive.clone()).await;
        let (handle, cancel, task) = start(test_config(device));
        wait(&handle, LinkState::Connected).await;

        let channel = handle.command_channel().await.unwrap();
        responsive.store(false, Ordering::SeqCst);
        channel.submit("cw 90").await;
        channel.submit("cw 90").await;
        responsive.store(true, Ordering::SeqCst);
        assert!(channel.submit("cw 90").await.success);
        channel.submit("ccw 90").await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.state(), LinkState::Connected);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_probe_timeout_drops_link() {
        let responsive = Arc::new(AtomicBool::new(true));
        let device = spawn_device(responsive.clone()).await;
        let mut config = test_config(device);
        config.probe_interval = Duration::from_secs(1);
        let (handle, cancel, task) = start(config);
        wait(&handle, LinkState::Connected).await;

        responsive.store(false, Ordering::SeqCst);
        wait(&handle, LinkState::Disconnected).await;

        cancel.cancel();
        task.await.unwrap();
    }
}
