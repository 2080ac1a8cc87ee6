//! Bridge metrics for observability
//!
//! Counters are updated on the hot paths and read as a snapshot by the
//! `/health` and `/metrics` endpoints.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::registry::BroadcastReport;

#[derive(Debug, Default)]
pub struct BridgeMetrics {
    // Connection metrics
    /// Currently connected WebSocket clients
    pub active_clients: AtomicU64,
    /// Total clients since start
    pub total_clients: AtomicU64,

    // Command metrics
    pub commands_received: AtomicU64,
    pub commands_succeeded: AtomicU64,
    pub commands_timed_out: AtomicU64,
    /// Rejected before reaching the device (busy, invalid, not connected)
    pub commands_rejected: AtomicU64,

    // Telemetry metrics
    pub telemetry_frames: AtomicU64,

    // Delivery metrics
    pub frames_sent: AtomicU64,
    /// Frames dropped because a client queue was full
    pub frames_dropped: AtomicU64,
    pub clients_evicted: AtomicU64,

    // Link metrics
    pub link_drops: AtomicU64,
    pub reconnect_attempts: AtomicU64,

    start_time: Option<Instant>,
}

impl BridgeMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn client_connected(&self) {
        self.active_clients.fetch_add(1, Ordering::Relaxed);
        self.total_clients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_disconnected(&self) {
        self.active_clients.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_received(&self) {
        self.commands_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_succeeded(&self) {
        self.commands_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_timed_out(&self) {
        self.commands_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_rejected(&self) {
        self.commands_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn telemetry_frame(&self) {
        self.telemetry_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn link_dropped(&self) {
        self.link_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_broadcast(&self, report: BroadcastReport) {
        self.frames_sent
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.frames_dropped
            .fetch_add(report.dropped as u64, Ordering::Relaxed);
        self.clients_evicted
            .fetch_add(report.removed as u64, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            clients: ClientMetrics {
                active: self.active_clients.load(Ordering::Relaxed),
                total: self.total_clients.load(Ordering::Relaxed),
                evicted: self.clients_evicted.load(Ordering::Relaxed),
            },
            commands: CommandMetrics {
                received: self.commands_received.load(Ordering::Relaxed),
                succeeded: self.commands_succeeded.load(Ordering::Relaxed),
                timed_out: self.commands_timed_out.load(Ordering::Relaxed),
                rejected: self.commands_rejected.load(Ordering::Relaxed),
            },
            frames: FrameMetrics {
                telemetry: self.telemetry_frames.load(Ordering::Relaxed),
                sent: self.frames_sent.load(Ordering::Relaxed),
                dropped: self.frames_dropped.load(Ordering::Relaxed),
            },
            link: LinkMetrics {
                drops: self.link_drops.load(Ordering::Relaxed),
                reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub clients: ClientMetrics,
    pub commands: CommandMetrics,
    pub frames: FrameMetrics,
    pub link: LinkMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMetrics {
    pub active: u64,
    pub total: u64,
    pub evicted: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandMetrics {
    pub received: u64,
    pub succeeded: u64,
    pub timed_out: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameMetrics {
    pub telemetry: u64,
    pub sent: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkMetrics {
    pub drops: u64,
    pub reconnect_attempts: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub link: String,
    pub clients: u64,
    pub uptime_secs: u64,
}
