// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Device identity attributes shared by the session and command layers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Role of a ranging module in the field.
///
/// Tags move and stream their location; anchors are fixed reference
/// points that are read on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    Tag,
    Anchor,
}

impl DeviceRole {
    pub fn is_anchor(self) -> bool {
        matches!(self, Self::Anchor)
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tag => write!(f, "tag"),
            Self::Anchor => write!(f, "anchor"),
        }
    }
}

/// Externally visible status of a device, as tracked by the session registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    #[default]
    Idle,
    Connecting,
    Streaming,
    Polling,
    Writing,
    WaitingRetry,
}

impl DeviceStatus {
    /// True while a session holds an open data-acquisition link.
    pub fn is_acquiring(self) -> bool {
        matches!(self, Self::Streaming | Self::Polling)
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "Idle",
            Self::Connecting => "Connecting",
            Self::Streaming => "Streaming",
            Self::Polling => "Polling",
            Self::Writing => "Writing",
            Self::WaitingRetry => "WaitingRetry",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serde_lowercase() {
        assert_eq!(serde_json::to_string(&DeviceRole::Tag).unwrap(), "\"tag\"");
        let role: DeviceRole = serde_json::from_str("\"anchor\"").unwrap();
        assert_eq!(role, DeviceRole::Anchor);
    }

    #[test]
    fn test_acquiring_statuses() {
        assert!(DeviceStatus::Streaming.is_acquiring());
        assert!(DeviceStatus::Polling.is_acquiring());
        assert!(!DeviceStatus::WaitingRetry.is_acquiring());
        assert!(!DeviceStatus::Idle.is_acquiring());
    }
}
