// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Transport DTOs for the backend JSON line protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use uwb_core::{LocationFrame, OperationMode};

/// Raw line shape: `{"event": <name>, "data": <any>}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// Configuration request as sent by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    pub mac: String,
    #[serde(default)]
    pub payload: Value,
}

/// Events received from the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    StartTracking,
    StopTracking,
    Command(CommandRequest),
}

#[derive(Debug, Clone, Serialize)]
pub struct Hello {
    pub gateway_id: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TagData {
    pub mac: String,
    pub data: LocationFrame,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnchorData {
    pub mac: String,
    pub data: LocationFrame,
    pub operation_mode: OperationMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckResult {
    Success,
    Error,
}

/// Outcome of one configuration request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandAck {
    pub command: String,
    pub mac: String,
    pub result: AckResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandAck {
    pub fn success(command: impl Into<String>, mac: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            mac: mac.into(),
            result: AckResult::Success,
            error: None,
        }
    }

    pub fn error(
        command: impl Into<String>,
        mac: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            command: command.into(),
            mac: mac.into(),
            result: AckResult::Error,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result == AckResult::Success
    }
}

/// Events sent to the backend.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundEvent {
    Hello(Hello),
    TagData(TagData),
    AnchorData(AnchorData),
    CommandAck(CommandAck),
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::TagData(_) => "tag_data",
            Self::AnchorData(_) => "anchor_data",
            Self::CommandAck(_) => "command_ack",
        }
    }
}
