//! Client registry.
//!
//! Tracks the send side of every connected WebSocket peer. Each peer owns a
//! bounded queue drained by its own writer task, so a broadcast only does a
//! non-blocking enqueue per client and never waits on a slow socket.
//!
//! A full queue is handled per event kind. Telemetry snapshots are lossy and
//! just skip a lagging client. Command results must reach every client, so a
//! client that cannot take one is evicted and its connection closed.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, error, warn};

/// Serialized frame queued for a client.
pub type Frame = Arc<str>;

/// Unique identifier for a connected client
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct ClientId(pub uuid::Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0.simple())
    }
}

/// Send capability for one connected client.
#[derive(Clone, Debug)]
pub struct ClientHandle {
    id: ClientId,
    tx: mpsc::Sender<Frame>,
}

impl ClientHandle {
    /// Create a handle and the receiver its writer task drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: ClientId::new(),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    fn try_deliver(&self, frame: &Frame) -> Delivery {
        match self.tx.try_send(frame.clone()) {
            Ok(()) => Delivery::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Lagging,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Gone,
        }
    }
}

enum Delivery {
    Sent,
    Lagging,
    Gone,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Overflow {
    Skip,
    Evict,
}

/// Outcome of a single broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Lagging clients that skipped a lossy frame.
    pub dropped: usize,
    /// Clients that were unregistered: connection gone, or evicted for lagging.
    pub removed: usize,
}

#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<ClientId, ClientHandle>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client. Registering the same handle twice is a caller bug.
    pub async fn register(&self, handle: ClientHandle) {
        debug!("Registering {}", handle.id);
        self.clients.write().await.insert(handle.id, handle);
    }

    /// Remove a client; no-op if absent.
    pub async fn unregister(&self, id: ClientId) -> bool {
        let removed = self.clients.write().await.remove(&id).is_some();
        if removed {
            debug!("Unregistered {}", id);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// Drop every handle, closing each client's writer queue.
    pub async fn clear(&self) -> usize {
        let mut clients = self.clients.write().await;
        let n = clients.len();
        clients.clear();
        n
    }

    /// Serialize `event` once and enqueue it for every registered client.
    /// A client that cannot take it is removed.
    pub async fn broadcast<T: Serialize>(&self, event: &T) -> BroadcastReport {
        self.fan_out(event, Overflow::Evict).await
    }

    /// Like `broadcast`, but a lagging client only misses this event.
    pub async fn broadcast_lossy<T: Serialize>(&self, event: &T) -> BroadcastReport {
        self.fan_out(event, Overflow::Skip).await
    }

    async fn fan_out<T: Serialize>(&self, event: &T, overflow: Overflow) -> BroadcastReport {
        let Some(frame) = serialize(event) else {
            return BroadcastReport::default();
        };

        // Snapshot so no lock is held while delivering.
        let snapshot: Vec<ClientHandle> = self.clients.read().await.values().cloned().collect();

        let mut report = BroadcastReport::default();
        let mut gone = Vec::new();
        for handle in &snapshot {
            match handle.try_deliver(&frame) {
                Delivery::Sent => report.delivered += 1,
                Delivery::Lagging if overflow == Overflow::Skip => {
                    warn!("{} is lagging, dropping frame", handle.id);
                    report.dropped += 1;
                }
                Delivery::Lagging => {
                    warn!("{} cannot keep up, evicting", handle.id);
                    gone.push(handle.id);
                }
                Delivery::Gone => gone.push(handle.id),
            }
        }

        if !gone.is_empty() {
            let mut clients = self.clients.write().await;
            for id in gone {
                if clients.remove(&id).is_some() {
                    warn!("Removed {} after failed delivery", id);
                    report.removed += 1;
                }
            }
        }

        report
    }

    /// Enqueue `event` for a single client. Returns false if it could not be
    /// queued, in which case the client is removed.
    pub async fn send_to<T: Serialize>(&self, id: ClientId, event: &T) -> bool {
        let Some(frame) = serialize(event) else {
            return false;
        };
        let handle = self.clients.read().await.get(&id).cloned();
        match handle.map(|h| h.try_deliver(&frame)) {
            Some(Delivery::Sent) => true,
            Some(Delivery::Lagging) => {
                warn!("{} cannot take its reply, evicting", id);
                self.unregister(id).await;
                false
            }
            Some(Delivery::Gone) => {
                self.unregister(id).await;
                false
            }
            None => false,
        }
    }
}

fn serialize<T: Serialize>(event: &T) -> Option<Frame> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Frame::from(json)),
        Err(e) => {
            error!("Failed to serialize event: {}", e);
            None
        }
    }
}
