// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Operation Mode characteristic codec.
//!
//! The characteristic holds two bytes. The most significant bit of the first
//! byte selects the node role; the remaining bits are feature flags.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

use crate::device::DeviceRole;

const ROLE_BIT: u8 = 0x80;
const UWB_MODE_MASK: u8 = 0x60;
const FIRMWARE_BIT: u8 = 0x10;
const ACCEL_BIT: u8 = 0x08;
const LED_BIT: u8 = 0x04;
const FW_UPDATE_BIT: u8 = 0x02;
const INITIATOR_BIT: u8 = 0x80;
const LOW_POWER_BIT: u8 = 0x40;
const LOC_ENGINE_BIT: u8 = 0x20;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationModeError {
    #[error("operation mode must be 16 binary digits, got {0} characters")]
    BadLength(usize),
    #[error("operation mode contains non-binary character {0:?}")]
    BadDigit(char),
    #[error("operation mode value must be 2 bytes, got {0}")]
    BadValue(usize),
}

/// UWB radio mode encoded in bits 6..5 of the first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UwbMode {
    Off,
    Passive,
    Active,
    Reserved,
}

/// Decoded feature flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OperationFlags {
    pub role: DeviceRole,
    pub uwb_mode: UwbMode,
    pub firmware_slot: u8,
    pub accelerometer: bool,
    pub led: bool,
    pub firmware_update: bool,
    pub initiator: bool,
    pub low_power: bool,
    pub location_engine: bool,
}

/// Raw two-byte operation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationMode([u8; 2]);

impl OperationMode {
    pub fn from_bytes(value: &[u8]) -> Result<Self, OperationModeError> {
        match value {
            [a, b] => Ok(Self([*a, *b])),
            _ => Err(OperationModeError::BadValue(value.len())),
        }
    }

    /// Lenient variant used on values read back from a module: only the
    /// first two bytes are significant.
    pub fn from_read_value(value: &[u8]) -> Result<Self, OperationModeError> {
        match value {
            [a, b, ..] => Ok(Self([*a, *b])),
            _ => Err(OperationModeError::BadValue(value.len())),
        }
    }

    /// Parse the backend's 16-digit big-endian bit string.
    pub fn from_bits(bits: &str) -> Result<Self, OperationModeError> {
        let bits = bits.trim();
        let len = bits.chars().count();
        if len != 16 {
            return Err(OperationModeError::BadLength(len));
        }
        let mut value: u16 = 0;
        for c in bits.chars() {
            let bit = match c {
                '0' => 0,
                '1' => 1,
                other => return Err(OperationModeError::BadDigit(other)),
            };
            value = (value << 1) | bit;
        }
        Ok(Self(value.to_be_bytes()))
    }

    pub fn to_bytes(self) -> [u8; 2] {
        self.0
    }

    pub fn role(self) -> DeviceRole {
        if self.0[0] & ROLE_BIT == 0 {
            DeviceRole::Tag
        } else {
            DeviceRole::Anchor
        }
    }

    pub fn flags(self) -> OperationFlags {
        let [a, b] = self.0;
        OperationFlags {
            role: self.role(),
            uwb_mode: match (a & UWB_MODE_MASK) >> 5 {
                0 => UwbMode::Off,
                1 => UwbMode::Passive,
                2 => UwbMode::Active,
                _ => UwbMode::Reserved,
            },
            firmware_slot: if a & FIRMWARE_BIT == 0 { 1 } else { 2 },
            accelerometer: a & ACCEL_BIT != 0,
            led: a & LED_BIT != 0,
            firmware_update: a & FW_UPDATE_BIT != 0,
            initiator: b & INITIATOR_BIT != 0,
            low_power: b & LOW_POWER_BIT != 0,
            location_engine: b & LOC_ENGINE_BIT != 0,
        }
    }
}

impl FromStr for OperationMode {
    type Err = OperationModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bits(s)
    }
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016b}", u16::from_be_bytes(self.0))
    }
}

impl Serialize for OperationMode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
