// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Radio Link abstraction over a GATT-style wireless transport.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Network node service exposed by every module.
pub const NETWORK_NODE_SERVICE: Uuid = Uuid::from_u128(0x680c21d9_c946_4c1f_9c11_baa1c21329e7);

/// Characteristics of the network node service used by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Characteristic {
    LocationData,
    LocationDataMode,
    OperationMode,
    /// Tags only.
    UpdateRate,
    /// Anchors only.
    PersistedPosition,
}

impl Characteristic {
    pub const ALL: [Characteristic; 5] = [
        Self::LocationData,
        Self::LocationDataMode,
        Self::OperationMode,
        Self::UpdateRate,
        Self::PersistedPosition,
    ];

    pub fn uuid(self) -> Uuid {
        match self {
            Self::LocationData => Uuid::from_u128(0x003bbdf2_c634_4b3d_ab56_7ec889b89a37),
            Self::LocationDataMode => Uuid::from_u128(0xa02b947e_df97_4516_996a_1882521e0ead),
            Self::OperationMode => Uuid::from_u128(0x3f0afd88_7770_46b0_b5e7_9fc099598964),
            Self::UpdateRate => Uuid::from_u128(0x7bd47f30_5602_4389_b069_8305731308b6),
            Self::PersistedPosition => Uuid::from_u128(0xf0f26c9b_2c8c_49ac_ab60_fe03def1b40c),
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.uuid() == uuid)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::LocationData => "Location Data",
            Self::LocationDataMode => "Location Data Mode",
            Self::OperationMode => "Operation Mode",
            Self::UpdateRate => "Update Rate",
            Self::PersistedPosition => "Persisted Position",
        }
    }
}

impl fmt::Display for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkErrorKind {
    /// Device not visible to the adapter.
    NotFound,
    Connect,
    /// Operation attempted without an open connection, or the link dropped.
    NotConnected,
    Read,
    Write,
    Subscribe,
    /// Service or characteristic missing on the device.
    Unsupported,
    /// Local adapter failure.
    Adapter,
}

/// Error type returned by Radio Link operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkError {
    pub kind: LinkErrorKind,
    pub message: String,
}

pub type LinkResult<T> = Result<T, LinkError>;

impl LinkError {
    pub fn new(kind: LinkErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(address: &str) -> Self {
        Self::new(LinkErrorKind::NotFound, format!("device {address} not found"))
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(LinkErrorKind::Connect, message)
    }

    pub fn not_connected(address: &str) -> Self {
        Self::new(
            LinkErrorKind::NotConnected,
            format!("device {address} not connected"),
        )
    }

    pub fn read(message: impl Into<String>) -> Self {
        Self::new(LinkErrorKind::Read, message)
    }

    pub fn write(message: impl Into<String>) -> Self {
        Self::new(LinkErrorKind::Write, message)
    }

    pub fn subscribe(message: impl Into<String>) -> Self {
        Self::new(LinkErrorKind::Subscribe, message)
    }

    pub fn unsupported(characteristic: Characteristic) -> Self {
        Self::new(
            LinkErrorKind::Unsupported,
            format!("characteristic {characteristic} not available"),
        )
    }

    pub fn adapter(message: impl Into<String>) -> Self {
        Self::new(LinkErrorKind::Adapter, message)
    }

    /// Whether repeating the operation may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self.kind, LinkErrorKind::Unsupported)
    }
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for LinkError {}

/// A module seen during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
    pub address: String,
    pub name: Option<String>,
}

impl DiscoveredDevice {
    /// Case-insensitive advertised-name prefix match.
    pub fn matches_prefix(&self, prefixes: &[String]) -> bool {
        let Some(name) = self.name.as_deref() else {
            return false;
        };
        let name = name.to_ascii_lowercase();
        prefixes
            .iter()
            .any(|p| name.starts_with(&p.to_ascii_lowercase()))
    }
}

/// Alias to reduce type complexity in RadioLink.
pub type LinkFuture<'a, T> = Pin<Box<dyn Future<Output = LinkResult<T>> + Send + 'a>>;

/// Connection-oriented access to modules over the wireless transport.
///
/// Implementations are shared by every session, so all methods take
/// `&self`. `disconnect` must be idempotent.
pub trait RadioLink: Send + Sync {
    fn connect<'a>(&'a self, address: &'a str) -> LinkFuture<'a, ()>;

    fn disconnect<'a>(&'a self, address: &'a str) -> LinkFuture<'a, ()>;

    fn is_connected<'a>(&'a self, address: &'a str) -> LinkFuture<'a, bool>;

    fn read<'a>(
        &'a self,
        address: &'a str,
        characteristic: Characteristic,
    ) -> LinkFuture<'a, Vec<u8>>;

    fn write<'a>(
        &'a self,
        address: &'a str,
        characteristic: Characteristic,
        value: &'a [u8],
    ) -> LinkFuture<'a, ()>;

    /// Deliver every notification value of `characteristic` into `sink`
    /// until unsubscribed or disconnected.
    fn subscribe<'a>(
        &'a self,
        address: &'a str,
        characteristic: Characteristic,
        sink: mpsc::Sender<Vec<u8>>,
    ) -> LinkFuture<'a, ()>;

    fn unsubscribe<'a>(
        &'a self,
        address: &'a str,
        characteristic: Characteristic,
    ) -> LinkFuture<'a, ()>;

    fn discover<'a>(&'a self, duration: Duration) -> LinkFuture<'a, Vec<DiscoveredDevice>>;
}
