//! Telemetry channel.
//!
//! Drains the telemetry socket and fans each decoded frame out to every
//! client. Delivery is a non-blocking enqueue, so a slow client never holds
//! up the socket.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::metrics::BridgeMetrics;
use crate::protocol::ServerEvent;
use crate::registry::ClientRegistry;
use crate::telemetry;

const MAX_DATAGRAM: usize = 2048;
const RECV_ERROR_PAUSE: Duration = Duration::from_millis(100);

pub struct TelemetryChannel {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TelemetryChannel {
    /// Bind the telemetry socket and start republishing frames.
    pub async fn bind(
        local_addr: SocketAddr,
        registry: Arc<ClientRegistry>,
        metrics: Arc<BridgeMetrics>,
        cancel: CancellationToken,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(local_addr).await?;
        let local_addr = socket.local_addr()?;
        info!("Telemetry socket bound on {}", local_addr);

        let task = tokio::spawn(run(socket, registry, metrics, cancel.clone()));

        Ok(Self {
            local_addr,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the receive loop and release the socket.
    pub async fn close(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
            info!("Telemetry socket closed");
        }
    }
}

impl Drop for TelemetryChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    socket: UdpSocket,
    registry: Arc<ClientRegistry>,
    metrics: Arc<BridgeMetrics>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, from) = tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    // Telemetry loss is non-fatal; back off briefly and keep draining.
                    error!("Telemetry receive failed: {}", e);
                    tokio::time::sleep(RECV_ERROR_PAUSE).await;
                    continue;
                }
            },
        };

        let Some(frame) = telemetry::decode_datagram(&buf[..n]) else {
            continue;
        };
        debug!("Telemetry from {}: {} fields", from, frame.fields.len());
        metrics.telemetry_frame();

        let report = registry.broadcast_lossy(&ServerEvent::from(&frame)).await;
        metrics.record_broadcast(report);
    }
    debug!("Telemetry receiver exiting");
}
