//! WebSocket transport.
//!
//! Each client gets a bounded outbound queue registered with the
//! [`ClientRegistry`](crate::registry::ClientRegistry). A writer drains that
//! queue into the socket while the reader turns every inbound text frame into
//! a command submission. When pings are enabled, a client that leaves one
//! unanswered for `pong_timeout` is closed.

use axum::{
    Json, Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::link::LinkState;
use crate::metrics::HealthStatus;
use crate::registry::ClientHandle;

pub fn router(bridge: Arc<Bridge>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(bridge)
}

async fn ws_handler(State(bridge): State<Arc<Bridge>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, bridge))
}

/// Link state, client count and uptime
async fn health_handler(State(bridge): State<Arc<Bridge>>) -> impl IntoResponse {
    let snapshot = bridge.metrics().snapshot();
    let link = bridge.link_state();
    let status = if link == LinkState::Connected {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthStatus {
        status: status.to_string(),
        link: link.to_string(),
        clients: snapshot.clients.active,
        uptime_secs: snapshot.uptime_secs,
    })
}

async fn metrics_handler(State(bridge): State<Arc<Bridge>>) -> impl IntoResponse {
    Json(bridge.metrics().snapshot())
}

async fn handle_socket(socket: WebSocket, bridge: Arc<Bridge>) {
    let (handle, mut rx) = ClientHandle::channel(bridge.config().client_buffer);
    let client_id = handle.id();
    bridge.registry().register(handle).await;
    bridge.metrics().client_connected();
    info!("{} connected", client_id);

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let shutdown = bridge.shutdown_token();
    let mut ping = ping_timer(bridge.config().ping_interval);
    let pong_timeout = bridge.config().pong_timeout;
    let keepalive = Arc::new(Mutex::new(Keepalive::default()));
    let keepalive_in = keepalive.clone();

    let sender_task = async move {
        loop {
            let deadline = pong_timeout.and_then(|t| lock(&keepalive).deadline(t));
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(frame) => {
                        if ws_sender.send(Message::Text(frame.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // Dropped from the registry.
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                },
                _ = tick(&mut ping) => {
                    if ws_sender.send(Message::Ping(Default::default())).await.is_err() {
                        break;
                    }
                    lock(&keepalive).ping_sent(Instant::now());
                }
                _ = until(deadline) => {
                    if let Some(timeout) = pong_timeout {
                        if lock(&keepalive).expired(Instant::now(), timeout) {
                            warn!("{} missed its pong deadline, closing", client_id);
                            let _ = ws_sender.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    };

    let bridge_in = bridge.clone();
    let input_task = async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    let bridge = bridge_in.clone();
                    let command = text.as_str().to_owned();
                    tokio::spawn(async move {
                        bridge.handle_client_command(client_id, &command).await;
                    });
                }
                Ok(Message::Pong(_)) => {
                    lock(&keepalive_in).pong_received();
                }
                Ok(Message::Binary(data)) => {
                    debug!("{} sent {} binary bytes, ignoring", client_id, data.len());
                }
                Ok(Message::Close(_)) => {
                    debug!("{} closed connection", client_id);
                    break;
                }
                Err(e) => {
                    warn!("{} WebSocket error: {}", client_id, e);
                    break;
                }
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = sender_task => debug!("{} sender ended", client_id),
        _ = input_task => debug!("{} input ended", client_id),
    }

    bridge.registry().unregister(client_id).await;
    bridge.metrics().client_disconnected();
    info!("{} disconnected", client_id);
}

/// Outstanding ping bookkeeping for one client.
#[derive(Debug, Default)]
struct Keepalive {
    /// When the oldest unanswered ping went out.
    unanswered_since: Option<Instant>,
}

impl Keepalive {
    fn ping_sent(&mut self, now: Instant) {
        self.unanswered_since.get_or_insert(now);
    }

    fn pong_received(&mut self) {
        self.unanswered_since = None;
    }

    fn deadline(&self, timeout: Duration) -> Option<Instant> {
        self.unanswered_since.map(|sent| sent + timeout)
    }

    fn expired(&self, now: Instant, timeout: Duration) -> bool {
        self.deadline(timeout).is_some_and(|deadline| now >= deadline)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn ping_timer(period: Option<Duration>) -> Option<Interval> {
    period.map(|period| {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    })
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
