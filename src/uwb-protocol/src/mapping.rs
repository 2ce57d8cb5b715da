// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Mapping of backend command requests to validated gateway commands.

use serde_json::{Map, Value};

use uwb_core::{CommandError, CommandKind, GatewayCommand, OperationMode};

use crate::types::CommandRequest;

/// Convert a [`CommandRequest`] into a validated [`GatewayCommand`].
///
/// Payload shapes:
/// - `set_operation_mode`: `"1101001000100000"` or `{"operation_mode": "..."}`
/// - `set_tag_rate`: `{"moving", "stationary"}` (also `{"u1", "u2"}`)
/// - `set_location_mode`: `2` or `{"mode": 2}`
/// - `set_anchor_location`: `{"x", "y", "z", "quality"}` (also `quality_factor`)
pub fn request_to_command(request: &CommandRequest) -> Result<GatewayCommand, CommandError> {
    let kind: CommandKind = request.command.parse()?;
    let payload = &request.payload;
    let command = match kind {
        CommandKind::SetOperationMode => {
            let bits = match payload {
                Value::String(s) => s.as_str(),
                Value::Object(map) => map
                    .get("operation_mode")
                    .and_then(Value::as_str)
                    .ok_or_else(|| missing("operation_mode"))?,
                _ => return Err(invalid("operation mode must be a bit string")),
            };
            GatewayCommand::SetOperationMode(OperationMode::from_bits(bits)?)
        }
        CommandKind::SetTagRate => {
            let map = object(payload)?;
            GatewayCommand::SetTagRate {
                moving: rate(map, "moving", "u1")?,
                stationary: rate(map, "stationary", "u2")?,
            }
        }
        CommandKind::SetLocationMode => {
            let value = match payload {
                Value::Object(map) => map.get("mode").ok_or_else(|| missing("mode"))?,
                other => other,
            };
            let mode = value
                .as_u64()
                .ok_or_else(|| invalid("location mode must be an integer"))?;
            let mode = u8::try_from(mode).map_err(|_| CommandError::LocationModeOutOfRange(mode))?;
            GatewayCommand::SetLocationMode(mode)
        }
        CommandKind::SetAnchorLocation => {
            let map = object(payload)?;
            let quality = map
                .get("quality")
                .or_else(|| map.get("quality_factor"))
                .ok_or_else(|| missing("quality"))?
                .as_i64()
                .ok_or_else(|| invalid("quality must be an integer"))?;
            let quality = u8::try_from(quality)
                .ok()
                .filter(|q| (1..=100).contains(q))
                .ok_or(CommandError::QualityOutOfRange(quality))?;
            GatewayCommand::SetAnchorLocation {
                x: coordinate(map, "x")?,
                y: coordinate(map, "y")?,
                z: coordinate(map, "z")?,
                quality,
            }
        }
    };
    command.validate()?;
    Ok(command)
}

fn object(payload: &Value) -> Result<&Map<String, Value>, CommandError> {
    payload
        .as_object()
        .ok_or_else(|| invalid("payload must be an object"))
}

fn rate(map: &Map<String, Value>, name: &str, alias: &str) -> Result<u32, CommandError> {
    let value = map
        .get(name)
        .or_else(|| map.get(alias))
        .ok_or_else(|| missing(name))?;
    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| invalid(format!("{name} must be an unsigned 32-bit integer")))
}

fn coordinate(map: &Map<String, Value>, name: &str) -> Result<f64, CommandError> {
    map.get(name)
        .ok_or_else(|| missing(name))?
        .as_f64()
        .ok_or_else(|| invalid(format!("{name} must be a number")))
}

fn missing(field: &str) -> CommandError {
    CommandError::InvalidPayload(format!("missing field {field:?}"))
}

fn invalid(message: impl Into<String>) -> CommandError {
    CommandError::InvalidPayload(message.into())
}
