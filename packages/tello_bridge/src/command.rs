//! Command channel.
//!
//! Owns the command UDP socket and admits at most one command at a time.
//! The device protocol carries no sequence numbers, so whatever datagram
//! arrives next is the answer to the single in-flight command. A second
//! submit while one is pending is rejected with `Busy`, never queued.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::error::CommandError;

/// Receive buffer for response datagrams.
const MAX_DATAGRAM: usize = 2048;

/// A command handed to the device.
#[derive(Debug, Clone)]
pub struct Command {
    pub text: String,
    pub issued_at: Instant,
}

impl Command {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            issued_at: Instant::now(),
        }
    }
}

/// Outcome of one submitted command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub success: bool,
    /// Device response on success, error message otherwise.
    pub raw: String,
    pub command: String,
    pub error: Option<CommandError>,
}

impl CommandResult {
    pub fn success(command: &str, raw: String) -> Self {
        Self {
            success: true,
            raw,
            command: command.to_string(),
            error: None,
        }
    }

    pub fn failure(command: &str, error: CommandError) -> Self {
        Self {
            success: false,
            raw: error.to_string(),
            command: command.to_string(),
            error: Some(error),
        }
    }

    /// Whether the command actually reached the device.
    pub fn was_in_flight(&self) -> bool {
        self.error.as_ref().is_none_or(CommandError::was_in_flight)
    }

    pub fn reason(&self) -> Option<&'static str> {
        self.error.as_ref().map(CommandError::reason)
    }
}

/// Health signals emitted to the link supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSignal {
    /// The device answered a command.
    Response,
    /// A command went unanswered; `consecutive` counts unanswered commands
    /// since the last response.
    Timeout { consecutive: u32 },
    /// The socket failed; the link is unusable.
    SocketError(String),
}

struct InFlight {
    seq: u64,
    command: Command,
    respond_to: oneshot::Sender<Result<String, CommandError>>,
}

struct Shared {
    slot: Mutex<Option<InFlight>>,
    last_response: Mutex<Instant>,
    consecutive_timeouts: AtomicU32,
    /// Set once the link is known dead; no further command is admitted.
    closing: AtomicBool,
}

impl Shared {
    fn slot(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn touch(&self) {
        *self.last_response.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        self.consecutive_timeouts.store(0, Ordering::SeqCst);
    }

    fn shut(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }
}

/// Frees the in-flight slot when a submit finishes, however it finishes.
struct SlotGuard<'a> {
    shared: &'a Shared,
    seq: u64,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.shared.slot();
        if slot.as_ref().is_some_and(|f| f.seq == self.seq) {
            *slot = None;
        }
    }
}

pub struct CommandChannel {
    /// Taken on close so the port is released even while callers hold the channel.
    socket: Mutex<Option<Arc<UdpSocket>>>,
    device_addr: SocketAddr,
    timeout: Duration,
    drop_threshold: u32,
    shared: Arc<Shared>,
    next_seq: AtomicU64,
    signals: mpsc::UnboundedSender<ChannelSignal>,
    cancel: CancellationToken,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl CommandChannel {
    /// Bind the command socket on `local_addr` and start the response reader.
    ///
    /// After `drop_threshold` consecutive timeouts the channel stops admitting
    /// commands and answers `NotConnected` until it is replaced.
    pub async fn bind(
        local_addr: SocketAddr,
        device_addr: SocketAddr,
        timeout: Duration,
        drop_threshold: u32,
        signals: mpsc::UnboundedSender<ChannelSignal>,
        cancel: CancellationToken,
    ) -> std::io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(local_addr).await?);
        info!(
            "Command socket bound on {}, device at {}",
            socket.local_addr()?,
            device_addr
        );

        let shared = Arc::new(Shared {
            slot: Mutex::new(None),
            last_response: Mutex::new(Instant::now()),
            consecutive_timeouts: AtomicU32::new(0),
            closing: AtomicBool::new(false),
        });

        let receiver = tokio::spawn(run_receiver(
            socket.clone(),
            shared.clone(),
            signals.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            socket: Mutex::new(Some(socket)),
            device_addr,
            timeout,
            drop_threshold: drop_threshold.max(1),
            shared,
            next_seq: AtomicU64::new(1),
            signals,
            cancel,
            receiver: Mutex::new(Some(receiver)),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        match self.socket() {
            Some(socket) => socket.local_addr(),
            None => Err(std::io::ErrorKind::NotConnected.into()),
        }
    }

    fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Text of the command currently awaiting a response, if any.
    pub fn in_flight(&self) -> Option<String> {
        self.shared.slot().as_ref().map(|f| f.command.text.clone())
    }

    /// Time since the device last sent anything on the command socket.
    pub fn idle_for(&self) -> Duration {
        self.shared
            .last_response
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    /// Whether the channel still admits commands.
    pub fn is_open(&self) -> bool {
        !self.shared.closing.load(Ordering::SeqCst) && !self.cancel.is_cancelled()
    }

    /// Submit a command and wait for its response or timeout.
    pub async fn submit(&self, text: &str) -> CommandResult {
        self.run(text, false).await
    }

    /// Submit a liveness probe. Unlike `submit`, a single timeout closes the channel.
    pub async fn probe(&self, text: &str) -> CommandResult {
        self.run(text, true).await
    }

    async fn run(&self, text: &str, timeout_is_fatal: bool) -> CommandResult {
        match self.execute(text, timeout_is_fatal).await {
            Ok(raw) => CommandResult::success(text, raw),
            Err(e) => CommandResult::failure(text, e),
        }
    }

    async fn execute(&self, text: &str, timeout_is_fatal: bool) -> Result<String, CommandError> {
        let payload = codec::encode(text)?;
        if self.shared.closing.load(Ordering::SeqCst) {
            return Err(CommandError::NotConnected);
        }
        let socket = match self.socket() {
            Some(socket) if !self.cancel.is_cancelled() => socket,
            _ => return Err(CommandError::Cancelled),
        };

        let (tx, rx) = oneshot::channel();
        let _guard = self.claim(Command::new(text), tx)?;

        debug!("Sending to device: {:?}", text);
        let sent = socket.send_to(&payload, self.device_addr).await;
        drop(socket);
        if let Err(e) = sent {
            error!("Failed to send {:?} to device: {}", text, e);
            self.shared.shut();
            let _ = self.signals.send(ChannelSignal::SocketError(e.to_string()));
            return Err(e.into());
        }

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CommandError::Cancelled),
            reply = rx => reply.unwrap_or(Err(CommandError::Cancelled)),
            _ = tokio::time::sleep(self.timeout) => Err(CommandError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        };

        match &outcome {
            Ok(raw) => debug!("Device answered {:?} with {:?}", text, raw),
            Err(CommandError::Timeout { .. }) => {
                let consecutive = self.shared.consecutive_timeouts.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    "No response to {:?} within {:?} ({}/{})",
                    text, self.timeout, consecutive, self.drop_threshold
                );
                // Shut admission before the caller sees the result, so the
                // next submit cannot reach a link that is about to drop.
                if timeout_is_fatal || consecutive >= self.drop_threshold {
                    self.shared.shut();
                }
                let _ = self.signals.send(ChannelSignal::Timeout { consecutive });
            }
            Err(e) => debug!("Command {:?} failed: {}", text, e),
        }
        outcome
    }

    fn claim(
        &self,
        command: Command,
        respond_to: oneshot::Sender<Result<String, CommandError>>,
    ) -> Result<SlotGuard<'_>, CommandError> {
        let mut slot = self.shared.slot();
        if self.shared.closing.load(Ordering::SeqCst) {
            return Err(CommandError::NotConnected);
        }
        if let Some(pending) = slot.as_ref() {
            debug!(
                "Rejecting {:?}: {:?} in flight for {:?}",
                command.text,
                pending.command.text,
                pending.command.issued_at.elapsed()
            );
            return Err(CommandError::Busy);
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        *slot = Some(InFlight {
            seq,
            command,
            respond_to,
        });
        Ok(SlotGuard {
            shared: &self.shared,
            seq,
        })
    }

    /// Cancel any pending wait and release the socket.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.socket.lock().unwrap_or_else(|e| e.into_inner()).take();
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = receiver {
            let _ = handle.await;
            info!("Command socket closed");
        }
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_receiver(
    socket: Arc<UdpSocket>,
    shared: Arc<Shared>,
    signals: mpsc::UnboundedSender<ChannelSignal>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, from) = tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    error!("Command socket receive failed: {}", e);
                    shared.shut();
                    let _ = signals.send(ChannelSignal::SocketError(e.to_string()));
                    break;
                }
            },
        };

        shared.touch();
        let reply = codec::decode(&buf[..n]);
        let pending = shared.slot().take();
        match pending {
            Some(in_flight) => {
                if reply.is_err() {
                    warn!("Malformed response from {} ({} bytes)", from, n);
                }
                let _ = signals.send(ChannelSignal::Response);
                let _ = in_flight.respond_to.send(reply);
            }
            None => debug!("Dropping unsolicited datagram from {}: {:?}", from, reply),
        }
    }
    debug!("Command receiver exiting");
}
