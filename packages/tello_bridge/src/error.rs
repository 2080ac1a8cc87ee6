//! Command-path error taxonomy and the reason codes reported to clients.

/// Why a command did not produce a device response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("another command is already in flight")]
    Busy,

    #[error("no response within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("socket error: {0}")]
    SocketError(String),

    #[error("malformed response ({len} bytes)")]
    MalformedResponse { len: usize },

    #[error("not connected to device")]
    NotConnected,

    #[error("command cancelled")]
    Cancelled,
}

impl CommandError {
    /// Stable code sent as the `reason` field of a failed command result.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidCommand(_) => "InvalidCommand",
            Self::Busy => "Busy",
            Self::Timeout { .. } => "Timeout",
            Self::SocketError(_) => "SocketError",
            Self::MalformedResponse { .. } => "MalformedResponse",
            Self::NotConnected => "NotConnected",
            Self::Cancelled => "Cancelled",
        }
    }

    /// Whether the command reached the device before failing. Only these
    /// outcomes are broadcast to every client.
    pub fn was_in_flight(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::MalformedResponse { .. })
    }
}

impl From<std::io::Error> for CommandError {
    fn from(err: std::io::Error) -> Self {
        Self::SocketError(err.to_string())
    }
}
