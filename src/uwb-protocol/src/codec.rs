// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Line codec for backend events.

use serde_json::Value;
use thiserror::Error;

use crate::types::{BackendEvent, CommandRequest, Envelope, OutboundEvent};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed event line: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown event {0:?}")]
    UnknownEvent(String),
}

/// Parse one inbound line into a [`BackendEvent`].
///
/// Tracking toggles ignore their `data`. Command data is either the
/// request object itself or a `{"mac", "data"}` wrapper under `payload`.
pub fn parse_event(line: &str) -> Result<BackendEvent, ProtocolError> {
    let envelope: Envelope = serde_json::from_str(line.trim())?;
    match envelope.event.as_str() {
        "start_tracking" => Ok(BackendEvent::StartTracking),
        "stop_tracking" => Ok(BackendEvent::StopTracking),
        "command" => Ok(BackendEvent::Command(parse_command(envelope.data)?)),
        other => Err(ProtocolError::UnknownEvent(other.to_string())),
    }
}

fn parse_command(data: Value) -> Result<CommandRequest, ProtocolError> {
    let mut request: CommandRequest = serde_json::from_value(data)?;
    if let Value::Object(map) = &request.payload {
        if let Some(inner) = map.get("data") {
            request.payload = inner.clone();
        }
    }
    Ok(request)
}

/// Serialize an outbound event as a single line, without the terminator.
pub fn encode_event(event: &OutboundEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}
