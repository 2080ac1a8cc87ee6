//! JSON events sent to WebSocket clients.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::command::CommandResult;
use crate::telemetry::{FieldValue, TelemetryField, TelemetryFrame};

/// Outbound event, tagged by `origin`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "origin", rename_all = "lowercase")]
pub enum ServerEvent {
    Command {
        success: bool,
        data: String,
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<&'static str>,
    },
    State {
        raw: String,
        parsed: BTreeMap<String, FieldValue>,
        timestamp: f64,
        fields: BTreeMap<String, TelemetryField>,
    },
}

impl From<&CommandResult> for ServerEvent {
    fn from(result: &CommandResult) -> Self {
        Self::Command {
            success: result.success,
            data: result.raw.clone(),
            command: result.command.clone(),
            reason: result.error.as_ref().map(|e| e.reason()),
        }
    }
}

impl From<&TelemetryFrame> for ServerEvent {
    fn from(frame: &TelemetryFrame) -> Self {
        Self::State {
            raw: frame.raw.clone(),
            parsed: frame.parsed(),
            timestamp: frame.timestamp,
            fields: frame.fields.clone(),
        }
    }
}
