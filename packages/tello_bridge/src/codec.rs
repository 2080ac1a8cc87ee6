//! Command codec.
//!
//! Outbound commands are single ASCII lines without a terminator; the device
//! answers each with one datagram whose payload is passed through verbatim.

use crate::error::CommandError;

/// Largest command payload the device accepts in one datagram.
pub const MAX_COMMAND_LEN: usize = 1024;

/// Validate `text` and encode it as a request datagram.
pub fn encode(text: &str) -> Result<Vec<u8>, CommandError> {
    if text.trim().is_empty() {
        return Err(CommandError::InvalidCommand("command is empty".into()));
    }
    if text.len() > MAX_COMMAND_LEN {
        return Err(CommandError::InvalidCommand(format!(
            "command is {} bytes (max {})",
            text.len(),
            MAX_COMMAND_LEN
        )));
    }
    if let Some(c) = text.chars().find(|c| !c.is_ascii() || c.is_ascii_control()) {
        return Err(CommandError::InvalidCommand(format!(
            "unsupported character {:?}",
            c
        )));
    }
    Ok(text.as_bytes().to_vec())
}

/// Decode a response datagram.
pub fn decode(bytes: &[u8]) -> Result<String, CommandError> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| CommandError::MalformedResponse { len: bytes.len() })
}
