//! Bridge orchestrator.
//!
//! Wires WebSocket commands into the live command channel and command results
//! back out to clients. Owns the link supervisor and the HTTP/WebSocket server
//! for the lifetime between `start()` and `stop()`.

use anyhow::{Context, Result, bail};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec;
use crate::command::CommandResult;
use crate::config::BridgeConfig;
use crate::error::CommandError;
use crate::link::{LinkHandle, LinkState, LinkSupervisor};
use crate::metrics::BridgeMetrics;
use crate::protocol::ServerEvent;
use crate::registry::{ClientId, ClientRegistry};
use crate::ws;

/// How long `stop()` waits for the HTTP server to drain.
const SERVER_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Bridge {
    config: Arc<BridgeConfig>,
    registry: Arc<ClientRegistry>,
    metrics: Arc<BridgeMetrics>,
    link: LinkHandle,
    cancel: CancellationToken,
    supervisor: Mutex<Option<LinkSupervisor>>,
    supervisor_task: Mutex<Option<JoinHandle<()>>>,
    server_task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Arc<Self> {
        let config = Arc::new(config);
        let registry = Arc::new(ClientRegistry::new());
        let metrics = Arc::new(BridgeMetrics::new());
        let cancel = CancellationToken::new();
        let (supervisor, link) = LinkSupervisor::new(
            config.clone(),
            registry.clone(),
            metrics.clone(),
            cancel.clone(),
        );

        Arc::new(Self {
            config,
            registry,
            metrics,
            link,
            cancel,
            supervisor: Mutex::new(Some(supervisor)),
            supervisor_task: Mutex::new(None),
            server_task: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<BridgeMetrics> {
        &self.metrics
    }

    pub fn link(&self) -> &LinkHandle {
        &self.link
    }

    pub fn link_state(&self) -> LinkState {
        self.link.state()
    }

    /// Cancelled once `stop()` begins.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Bind the WebSocket listener and start the link supervisor.
    ///
    /// Returns the address the listener actually bound, which differs from
    /// the configured one when port 0 was requested.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        if self.stopped.load(Ordering::SeqCst) {
            bail!("Bridge already stopped");
        }

        let listener = tokio::net::TcpListener::bind(self.config.ws_addr)
            .await
            .with_context(|| format!("Failed to bind WebSocket listener on {}", self.config.ws_addr))?;
        let local_addr = listener.local_addr()?;

        let supervisor = lock(&self.supervisor).take().context("Bridge already started")?;
        *lock(&self.supervisor_task) = Some(tokio::spawn(supervisor.run()));

        let app = ws::router(self.clone());
        let shutdown = self.cancel.clone().cancelled_owned();
        *lock(&self.server_task) = Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!("WebSocket server error: {}", e);
            }
        }));

        info!(
            "Bridging ws://{} <-> udp://{} (telemetry on {})",
            local_addr, self.config.device_addr, self.config.telemetry_bind
        );
        Ok(local_addr)
    }

    /// Shut everything down. Safe to call more than once.
    ///
    /// Cancels any in-flight command, releases both UDP sockets, stops the
    /// listener and drops every registered client.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping bridge");
        self.cancel.cancel();

        let supervisor = lock(&self.supervisor_task).take();
        if let Some(task) = supervisor {
            let _ = task.await;
        }

        let server = lock(&self.server_task).take();
        if let Some(mut task) = server {
            if tokio::time::timeout(SERVER_SHUTDOWN_GRACE, &mut task)
                .await
                .is_err()
            {
                warn!("WebSocket server did not drain in time, aborting");
                task.abort();
            }
        }

        let removed = self.registry.clear().await;
        info!("Bridge stopped ({} clients dropped)", removed);
    }

    /// Run one command against the device.
    pub async fn submit(&self, text: &str) -> CommandResult {
        self.metrics.command_received();

        let result = if let Err(e) = codec::encode(text) {
            CommandResult::failure(text, e)
        } else {
            match self.link.command_channel().await {
                Some(channel) => channel.submit(text).await,
                None => CommandResult::failure(text, CommandError::NotConnected),
            }
        };

        match &result.error {
            None => self.metrics.command_succeeded(),
            Some(CommandError::Timeout { .. }) => self.metrics.command_timed_out(),
            Some(e) if !e.was_in_flight() => self.metrics.command_rejected(),
            Some(_) => {}
        }
        result
    }

    /// Submit a command on behalf of `client` and deliver the result.
    ///
    /// Anything the device saw goes to every client. Rejections go back only
    /// to the sender.
    pub async fn handle_client_command(&self, client: ClientId, text: &str) {
        debug!("{} -> {:?}", client, text);
        let result = self.submit(text).await;
        let event = ServerEvent::from(&result);

        if result.was_in_flight() {
            let report = self.registry.broadcast(&event).await;
            self.metrics.record_broadcast(report);
        } else if !self.registry.send_to(client, &event).await {
            debug!("{} gone before its {:?} rejection was queued", client, text);
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ClientHandle;

    fn offline_config() -> BridgeConfig {
        BridgeConfig {
            device_addr: "127.0.0.1:9".parse().unwrap(),
            command_bind: "127.0.0.1:0".parse().unwrap(),
            telemetry_bind: "127.0.0.1:0".parse().unwrap(),
            ws_addr: "127.0.0.1:0".parse().unwrap(),
            command_timeout: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_submit_before_connect_is_rejected() {
        let bridge = Bridge::new(offline_config());
        let result = bridge.submit("takeoff").await;
        assert!(!result.success);
        assert_eq!(result.reason(), Some("NotConnected"));
        assert_eq!(bridge.metrics().snapshot().commands.rejected, 1);
    }

    #[tokio::test]
    async fn test_invalid_command_wins_over_not_connected() {
        let bridge = Bridge::new(offline_config());
        assert_eq!(bridge.submit("").await.reason(), Some("InvalidCommand"));
    }

    #[tokio::test]
    async fn test_rejection_goes_only_to_sender() {
        let bridge = Bridge::new(offline_config());
        let (sender, mut sender_rx) = ClientHandle::channel(8);
        let (other, mut other_rx) = ClientHandle::channel(8);
        let sender_id = sender.id();
        bridge.registry().register(sender).await;
        bridge.registry().register(other).await;

        bridge.handle_client_command(sender_id, "takeoff").await;

        let frame = sender_rx.try_recv().unwrap();
        let json: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(json["origin"], "command");
        assert_eq!(json["success"], false);
        assert_eq!(json["reason"], "NotConnected");
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_client_too_slow_for_its_reply_is_evicted() {
        let bridge = Bridge::new(offline_config());
        let (slow, mut rx) = ClientHandle::channel(1);
        let id = slow.id();
        bridge.registry().register(slow).await;

        bridge
            .registry()
            .broadcast_lossy(&serde_json::json!({"origin": "state"}))
            .await;
        bridge.handle_client_command(id, "takeoff").await;

        // The reply could not be queued, so the client is closed rather than
        // left waiting for an answer that never comes.
        assert!(bridge.registry().is_empty().await);
        assert!(rx.recv().await.unwrap().contains("\"state\""));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let bridge = Bridge::new(offline_config());
        bridge.start().await.unwrap();
        assert!(bridge.start().await.is_err());
        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let bridge = Bridge::new(offline_config());
        bridge.start().await.unwrap();
        bridge.stop().await;
        bridge.stop().await;
        assert_eq!(bridge.link_state(), LinkState::Disconnected);
        assert!(bridge.start().await.is_err());
    }
}
