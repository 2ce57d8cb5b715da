// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

pub mod command;
pub mod controller;
pub mod device;
pub mod frame;
pub mod opmode;
pub mod radio;
pub mod telemetry;

pub type DynResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub use command::{CommandError, CommandKind, GatewayCommand};
pub use device::{DeviceRole, DeviceStatus};
pub use frame::{DistanceRecord, FrameError, LocationFrame, Position};
pub use opmode::{OperationMode, OperationModeError};
pub use radio::{
    Characteristic, DiscoveredDevice, LinkError, LinkErrorKind, LinkFuture, LinkResult, RadioLink,
};
pub use telemetry::{AdmissionFilter, ForwardDecision, TelemetryThrottle};
