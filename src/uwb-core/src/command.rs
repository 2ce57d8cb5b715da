// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Configuration commands accepted from the backend and their payload
//! encodings.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::DeviceRole;
use crate::opmode::{OperationMode, OperationModeError};
use crate::radio::Characteristic;

const MAX_LOCATION_MODE: u8 = 2;
const MIN_ANCHOR_QUALITY: u8 = 1;
const MAX_ANCHOR_QUALITY: u8 = 100;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    OperationMode(#[from] OperationModeError),
    #[error("location mode must be 0..=2, got {0}")]
    LocationModeOutOfRange(u64),
    #[error("quality factor must be 1..=100, got {0}")]
    QualityOutOfRange(i64),
    #[error("coordinate {axis} out of range: {value}")]
    CoordinateOutOfRange { axis: char, value: f64 },
}

/// Kind tag of a gateway command, as named on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    SetOperationMode,
    SetTagRate,
    SetLocationMode,
    SetAnchorLocation,
}

impl CommandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SetOperationMode => "set_operation_mode",
            Self::SetTagRate => "set_tag_rate",
            Self::SetLocationMode => "set_location_mode",
            Self::SetAnchorLocation => "set_anchor_location",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "set_operation_mode" => Ok(Self::SetOperationMode),
            "set_tag_rate" => Ok(Self::SetTagRate),
            "set_location_mode" => Ok(Self::SetLocationMode),
            "set_anchor_location" => Ok(Self::SetAnchorLocation),
            other => Err(CommandError::UnknownCommand(other.to_string())),
        }
    }
}

/// A configuration write for one module.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCommand {
    SetOperationMode(OperationMode),
    /// Update intervals in the module's native unit (100 ms ticks).
    SetTagRate { moving: u32, stationary: u32 },
    SetLocationMode(u8),
    /// Fixed anchor position in metres.
    SetAnchorLocation {
        x: f64,
        y: f64,
        z: f64,
        quality: u8,
    },
}

impl GatewayCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::SetOperationMode(_) => CommandKind::SetOperationMode,
            Self::SetTagRate { .. } => CommandKind::SetTagRate,
            Self::SetLocationMode(_) => CommandKind::SetLocationMode,
            Self::SetAnchorLocation { .. } => CommandKind::SetAnchorLocation,
        }
    }

    /// Characteristic the payload is written to.
    pub fn characteristic(&self) -> Characteristic {
        match self {
            Self::SetOperationMode(_) => Characteristic::OperationMode,
            Self::SetTagRate { .. } => Characteristic::UpdateRate,
            Self::SetLocationMode(_) => Characteristic::LocationDataMode,
            Self::SetAnchorLocation { .. } => Characteristic::PersistedPosition,
        }
    }

    /// Role implied by the command once it has been applied, if any.
    pub fn target_role(&self) -> Option<DeviceRole> {
        match self {
            Self::SetOperationMode(mode) => Some(mode.role()),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), CommandError> {
        match self {
            Self::SetOperationMode(_) | Self::SetTagRate { .. } => Ok(()),
            Self::SetLocationMode(mode) => {
                if *mode > MAX_LOCATION_MODE {
                    return Err(CommandError::LocationModeOutOfRange(u64::from(*mode)));
                }
                Ok(())
            }
            Self::SetAnchorLocation { x, y, z, quality } => {
                if !(MIN_ANCHOR_QUALITY..=MAX_ANCHOR_QUALITY).contains(quality) {
                    return Err(CommandError::QualityOutOfRange(i64::from(*quality)));
                }
                for (axis, value) in [('x', *x), ('y', *y), ('z', *z)] {
                    metres_to_mm(value).ok_or(CommandError::CoordinateOutOfRange { axis, value })?;
                }
                Ok(())
            }
        }
    }

    /// Validate and encode the characteristic value.
    pub fn encode(&self) -> Result<Vec<u8>, CommandError> {
        self.validate()?;
        let bytes = match self {
            Self::SetOperationMode(mode) => mode.to_bytes().to_vec(),
            Self::SetTagRate { moving, stationary } => {
                let mut out = Vec::with_capacity(8);
                out.extend_from_slice(&moving.to_le_bytes());
                out.extend_from_slice(&stationary.to_le_bytes());
                out
            }
            Self::SetLocationMode(mode) => vec![*mode],
            Self::SetAnchorLocation { x, y, z, quality } => {
                let mut out = Vec::with_capacity(13);
                for (axis, value) in [('x', *x), ('y', *y), ('z', *z)] {
                    let mm = metres_to_mm(value)
                        .ok_or(CommandError::CoordinateOutOfRange { axis, value })?;
                    out.extend_from_slice(&mm.to_le_bytes());
                }
                out.push(*quality);
                out
            }
        };
        Ok(bytes)
    }
}

fn metres_to_mm(value: f64) -> Option<i32> {
    if !value.is_finite() {
        return None;
    }
    let mm = (value * 1000.0).round();
    if mm < f64::from(i32::MIN) || mm > f64::from(i32::MAX) {
        return None;
    }
    Some(mm as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        for kind in [
            CommandKind::SetOperationMode,
            CommandKind::SetTagRate,
            CommandKind::SetLocationMode,
            CommandKind::SetAnchorLocation,
        ] {
            assert_eq!(kind.as_str().parse::<CommandKind>().unwrap(), kind);
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind));
        }
        assert!(matches!(
            "reboot".parse::<CommandKind>(),
            Err(CommandError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_encode_tag_rate_little_endian() {
        let cmd = GatewayCommand::SetTagRate {
            moving: 1,
            stationary: 50,
        };
        assert_eq!(cmd.encode().unwrap(), vec![1, 0, 0, 0, 50, 0, 0, 0]);
        assert_eq!(cmd.characteristic(), Characteristic::UpdateRate);
        assert_eq!(cmd.target_role(), None);
    }

    #[test]
    fn test_encode_operation_mode() {
        let mode = OperationMode::from_bits("1101001000100000").unwrap();
        let cmd = GatewayCommand::SetOperationMode(mode);
        assert_eq!(cmd.encode().unwrap(), vec![0xd2, 0x20]);
        assert_eq!(cmd.target_role(), Some(DeviceRole::Anchor));
    }

    #[test]
    fn test_location_mode_range() {
        assert_eq!(GatewayCommand::SetLocationMode(2).encode().unwrap(), vec![2]);
        assert_eq!(
            GatewayCommand::SetLocationMode(3).validate(),
            Err(CommandError::LocationModeOutOfRange(3))
        );
    }

    #[test]
    fn test_anchor_location_encoding() {
        let cmd = GatewayCommand::SetAnchorLocation {
            x: 1.5,
            y: -0.25,
            z: 2.0,
            quality: 100,
        };
        let mut expected = Vec::new();
        expected.extend_from_slice(&1500i32.to_le_bytes());
        expected.extend_from_slice(&(-250i32).to_le_bytes());
        expected.extend_from_slice(&2000i32.to_le_bytes());
        expected.push(100);
        assert_eq!(cmd.encode().unwrap(), expected);
    }

    #[test]
    fn test_anchor_location_validation() {
        let bad_quality = GatewayCommand::SetAnchorLocation {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            quality: 0,
        };
        assert_eq!(
            bad_quality.validate(),
            Err(CommandError::QualityOutOfRange(0))
        );

        let bad_coord = GatewayCommand::SetAnchorLocation {
            x: f64::NAN,
            y: 0.0,
            z: 0.0,
            quality: 50,
        };
        assert!(matches!(
            bad_coord.validate(),
            Err(CommandError::CoordinateOutOfRange { axis: 'x', .. })
        ));

        let overflow = GatewayCommand::SetAnchorLocation {
            x: 0.0,
            y: 0.0,
            z: 3.0e6,
            quality: 50,
        };
        assert!(matches!(
            overflow.encode(),
            Err(CommandError::CoordinateOutOfRange { axis: 'z', .. })
        ));
    }
}
